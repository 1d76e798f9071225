//! OAI-PMH response parsing
//!
//! [`RecordParser`] walks the events of a `ListRecords` (or `GetRecord`)
//! page and reconstructs one [`OaiRecord`] at a time. The contents of each
//! `<metadata>` element are handed to a [`MetadataDecoder`], normally
//! [`MarcDecoder`](crate::marc::MarcDecoder).

mod parser;
mod record;

pub use parser::{PageSummary, RecordParser};
pub use record::OaiRecord;

use thiserror::Error;

use crate::marc::CodecError;
use crate::xml::{XmlError, XmlEvent};

/// OAI error code that signals an empty result rather than a failure
pub const NO_RECORDS_MATCH: &str = "noRecordsMatch";

#[derive(Error, Debug)]
pub enum OaiError {
    #[error("Malformed feed XML: {0}")]
    Xml(#[from] XmlError),

    #[error("Bad metadata: {0}")]
    Codec(#[from] CodecError),

    #[error("Expected a single record but found another")]
    MultipleRecords,

    #[error("OAI error {code}: {message}")]
    Protocol { code: String, message: String },
}

/// Incremental decoder for the contents of a `<metadata>` element
///
/// The parser calls [`reset`](Self::reset) at every record boundary, forwards
/// every event nested inside `<metadata>` to [`handle`](Self::handle), and
/// calls [`finish`](Self::finish) when `</metadata>` is reached.
pub trait MetadataDecoder {
    type Output;

    fn reset(&mut self);

    fn handle(&mut self, event: &XmlEvent) -> Result<(), CodecError>;

    fn finish(&mut self) -> Result<Self::Output, CodecError>;
}
