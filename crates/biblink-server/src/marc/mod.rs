//! MARC-XML codec
//!
//! Converts between the MARC21 slim XML dialect and [`MarcDocument`], an
//! ordered in-memory form that also serializes to MARC-in-JSON.
//!
//! Decoding is incremental: [`MarcDecoder`] is fed [`XmlEvent`]s one at a
//! time, which lets the OAI record parser forward the contents of a
//! `<metadata>` element without buffering the page. [`decode_str`] wraps the
//! same decoder for complete documents. Encoding is a pure function.
//!
//! ```
//! use biblink_server::marc::{decode_str, encode, DataField, MarcDocument};
//!
//! let mut doc = MarcDocument::new();
//! doc.leader = Some("00714cam a2200205 a 4500".to_string());
//! doc.push_control_field("001", "12883376");
//! doc.insert_data_field(
//!     DataField::with_indicators("245", Some("1"), Some("0")).with_subfield("a", "Jane Eyre"),
//! );
//!
//! let xml = encode(&doc);
//! assert_eq!(decode_str(&xml).unwrap(), doc);
//! ```
//!
//! [`XmlEvent`]: crate::xml::XmlEvent

mod decoder;
mod document;
mod encoder;

pub use decoder::{decode_str, MarcDecoder};
pub use document::{ControlField, DataField, Field, Indicators, MarcDocument, Subfield};
pub use encoder::encode;

use thiserror::Error;

/// MARC21 slim namespace
pub const MARCXML_NAMESPACE: &str = "http://www.loc.gov/MARC21/slim";

/// Errors raised while decoding or converting MARC records
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("No record element found")]
    NoRecord,

    #[error("Multiple records are not supported")]
    MultipleRecords,

    #[error("Bad marcxml element: {0}")]
    UnexpectedElement(String),

    #[error("subfield without field")]
    SubfieldOutsideField,

    #[error("Missing attribute {attribute} on {element}")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },

    #[error("Invalid MARC-in-JSON document: {0}")]
    InvalidDocument(String),

    #[error("XML error: {0}")]
    Xml(String),
}

impl From<crate::xml::XmlError> for CodecError {
    fn from(err: crate::xml::XmlError) -> Self {
        CodecError::Xml(err.to_string())
    }
}
