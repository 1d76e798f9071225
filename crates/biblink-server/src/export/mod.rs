//! Cluster export
//!
//! Renders clusters back into OAI-PMH `<record>` fragments. Rendering of
//! several clusters overlaps, bounded by [`ExportOptions::max_in_flight`],
//! while fragments are written in the order clusters were accepted.

mod envelope;
mod merge;
mod stream;

pub use envelope::{format_datestamp, oai_identifier, render_failure, render_record};
pub use merge::{cluster_document, merge_cluster};
pub use stream::ClusterExportStream;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::config::ExportSettings;
use crate::marc::CodecError;
use crate::storage::{StorageError, TransformError};

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Transform(#[from] TransformError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Render task failed: {0}")]
    Task(String),
}

/// One cluster to export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterExportItem {
    pub cluster_id: Uuid,
    pub datestamp: DateTime<Utc>,
    pub set_spec: String,
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub max_in_flight: usize,
    /// `false` writes headers only (`ListIdentifiers`)
    pub with_metadata: bool,
    pub identifier_prefix: String,
}

impl ExportOptions {
    pub fn from_settings(settings: &ExportSettings) -> Self {
        Self {
            max_in_flight: settings.max_in_flight.max(1),
            with_metadata: true,
            identifier_prefix: settings.identifier_prefix.clone(),
        }
    }
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            max_in_flight: crate::config::DEFAULT_EXPORT_MAX_IN_FLIGHT,
            with_metadata: true,
            identifier_prefix: crate::config::DEFAULT_OAI_ID_PREFIX.to_string(),
        }
    }
}
