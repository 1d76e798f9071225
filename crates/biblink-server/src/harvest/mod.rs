//! Resumable OAI-PMH harvesting
//!
//! A harvest job repeatedly fetches a `ListRecords` page, streams it through
//! the record parser, ingests every record in document order, and persists
//! its resumption token and `from` watermark before asking for the next page.
//! A stopped or failed job picks up where it left off on the next
//! [`HarvestService::start`].
//!
//! Stopping is cooperative: the loop reads the stop flag once per page, so an
//! in-flight page always finishes first. There is no overall request timeout,
//! so an upstream that never answers keeps the job `running` until the
//! process is restarted.

mod client;
mod job;
mod locks;
mod runner;
mod watermark;

pub use client::FeedClient;
pub use job::{HarvestConfig, HarvestJobState, JobStatus};
pub use locks::{JobLease, JobLocks};
pub use runner::{HarvestHandle, HarvestService, StopReason};
pub use watermark::next_datestamp;

use thiserror::Error;

use crate::marc::CodecError;
use crate::oai::OaiError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("Harvest job {0} not found")]
    NotFound(String),

    #[error("Harvest job {0} is already running")]
    AlreadyRunning(String),

    #[error("Harvest job {0} is already locked")]
    Locked(String),

    #[error("Harvest job {0} is not running")]
    NotRunning(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Protocol(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Oai(#[from] OaiError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}
