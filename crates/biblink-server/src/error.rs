//! Error classification
//!
//! Each component owns its `thiserror` enum. This module sorts them into a
//! small taxonomy and maps that onto HTTP status codes plus a JSON error body,
//! so that whatever fronts the service renders failures consistently.

use http::StatusCode;
use serde_json::{json, Value};

use crate::export::ExportError;
use crate::harvest::HarvestError;
use crate::marc::CodecError;
use crate::matchkey::MatchKeyError;
use crate::oai::OaiError;
use crate::storage::StorageError;

/// Failure categories shared by every component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing configuration; user-correctable
    Configuration,
    /// Unknown job or entity
    NotFound,
    /// Already running, already locked, or not running
    Concurrency,
    /// Unexpected upstream status or malformed feed XML
    Protocol,
    /// Malformed record shape
    Codec,
    /// Storage or transform collaborator failed
    Storage,
    /// Anything else
    Internal,
}

impl ErrorKind {
    pub fn status_code(self) -> StatusCode {
        match self {
            ErrorKind::Configuration | ErrorKind::Concurrency => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Protocol => StatusCode::BAD_GATEWAY,
            ErrorKind::Codec | ErrorKind::Storage | ErrorKind::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
        }
    }
}

/// Implemented by every component error
pub trait Classify: std::error::Error {
    fn kind(&self) -> ErrorKind;

    fn status_code(&self) -> StatusCode {
        self.kind().status_code()
    }

    /// Status code and `{"error": {"message", "status"}}` body
    fn to_response(&self) -> (StatusCode, Value) {
        let status = self.status_code();
        if matches!(self.kind(), ErrorKind::Internal | ErrorKind::Storage) {
            tracing::error!(error = %self, "internal failure");
        }
        let message = self.to_string();

        (
            status,
            json!({
                "error": {
                    "message": message,
                    "status": status.as_u16(),
                }
            }),
        )
    }
}

impl Classify for CodecError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Codec
    }
}

impl Classify for OaiError {
    fn kind(&self) -> ErrorKind {
        match self {
            OaiError::Codec(_) => ErrorKind::Codec,
            _ => ErrorKind::Protocol,
        }
    }
}

impl Classify for MatchKeyError {
    fn kind(&self) -> ErrorKind {
        match self {
            MatchKeyError::UnknownMethod(_) | MatchKeyError::Configuration(_) => {
                ErrorKind::Configuration
            },
            MatchKeyError::Evaluation(_) => ErrorKind::Internal,
        }
    }
}

impl Classify for StorageError {
    fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::Conflict(_) => ErrorKind::Concurrency,
            StorageError::MatchKey(e) => e.kind(),
            StorageError::Backend(_) => ErrorKind::Storage,
        }
    }
}

impl Classify for HarvestError {
    fn kind(&self) -> ErrorKind {
        match self {
            HarvestError::NotFound(_) => ErrorKind::NotFound,
            HarvestError::AlreadyRunning(_)
            | HarvestError::Locked(_)
            | HarvestError::NotRunning(_) => ErrorKind::Concurrency,
            HarvestError::Configuration(_) => ErrorKind::Configuration,
            HarvestError::Protocol(_) | HarvestError::Http(_) => ErrorKind::Protocol,
            HarvestError::Oai(e) => e.kind(),
            HarvestError::Codec(_) => ErrorKind::Codec,
            HarvestError::Storage(e) => e.kind(),
            HarvestError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl Classify for ExportError {
    fn kind(&self) -> ErrorKind {
        match self {
            ExportError::Storage(e) => e.kind(),
            ExportError::Transform(_) => ErrorKind::Storage,
            ExportError::Codec(_) => ErrorKind::Codec,
            ExportError::Io(_) | ExportError::Task(_) => ErrorKind::Internal,
        }
    }
}
