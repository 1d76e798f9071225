//! Storage collaborators
//!
//! The harvest and export pipelines only see the traits in this module.
//! [`MemoryStorage`] and [`MemoryJobStore`] are complete in-process
//! implementations used by the CLI and the tests.

mod memory;
mod traits;

pub use memory::{JsonTransform, MemoryJobStore, MemoryStorage};
pub use traits::{ClusterMember, IngestRecord, JobStore, Storage, Transform, TransformError};

use thiserror::Error;

use crate::matchkey::MatchKeyError;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Match key error: {0}")]
    MatchKey(#[from] MatchKeyError),

    #[error("Storage backend error: {0}")]
    Backend(String),
}
