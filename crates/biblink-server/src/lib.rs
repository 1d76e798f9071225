//! Biblink Server Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Aggregates MARC records harvested from OAI-PMH feeds into match-key
//! clusters and republishes the merged clusters as OAI-PMH XML.
//!
//! # Architecture
//!
//! Records flow in one direction through the harvest side:
//!
//! ```text
//! HTTP page -> xml::EventStream -> oai::RecordParser -> marc::MarcDecoder
//!           -> storage::Storage::ingest (match keys via matchkey::MatchKeyEngine)
//! ```
//!
//! and out through the export side:
//!
//! ```text
//! storage::Storage -> export::ClusterExportStream -> marc::encode -> response
//! ```
//!
//! - **xml**: pull-based XML event stream over any async byte source
//! - **oai**: streaming OAI-PMH record parser with delegated metadata decoding
//! - **marc**: MARC-XML <-> structured document codec
//! - **matchkey**: cached, single-flight match key strategies (JSONPath, script)
//! - **harvest**: resumable harvest job state machine
//! - **export**: bounded-concurrency cluster export stream
//! - **storage**: collaborator traits plus in-memory reference implementations
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use biblink_server::{config::Config, harvest::HarvestService, matchkey::MatchKeyEngine};
//! use biblink_server::storage::{MemoryJobStore, MemoryStorage};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let engine = Arc::new(MatchKeyEngine::new(config.match_key.limits()));
//!     let storage = Arc::new(MemoryStorage::new(engine));
//!     let jobs = Arc::new(MemoryJobStore::new());
//!     let service = HarvestService::new(&config, jobs, storage)?;
//!     let state = service.start("loc").await?.wait().await?;
//!     tracing::info!(records = state.total_records, "harvest finished");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod export;
pub mod harvest;
pub mod marc;
pub mod matchkey;
pub mod oai;
pub mod storage;
pub mod xml;

// Re-export commonly used types
pub use error::{Classify, ErrorKind};
