//! Error types shared across biblink crates

use thiserror::Error;

/// Errors that are not owned by a single component
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BiblinkError {
    #[error("Invalid log setting: {0}")]
    Logging(String),
}
