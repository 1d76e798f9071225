//! Biblink Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared logging bootstrap and error handling for the biblink workspace.
//!
//! # Overview
//!
//! - **Logging**: `tracing` subscriber setup (console, rolling file, JSON)
//! - **Error Handling**: Error type for rejected settings
//!
//! # Example
//!
//! ```no_run
//! use biblink_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     init_logging(&config)?;
//!     tracing::info!("harvester ready");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::BiblinkError;
