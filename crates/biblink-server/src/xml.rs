//! Pull-based XML event stream
//!
//! Turns an async byte source into owned [`XmlEvent`]s. Consumers pull one
//! event at a time with [`EventStream::next_event`]; nothing is read from the
//! underlying source while the consumer is suspended on its own work, which
//! is how the record parser pauses the HTTP body while a record is ingested.
//!
//! Element names are reported as local names, so `marc:record` and `record`
//! are the same element. Self-closing elements are expanded into a start and
//! an end event.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;
use tokio::io::AsyncBufRead;

/// Errors raised while tokenizing XML
#[derive(Error, Debug)]
pub enum XmlError {
    #[error("XML syntax error: {0}")]
    Syntax(#[from] quick_xml::Error),

    #[error("XML attribute error: {0}")]
    Attribute(#[from] quick_xml::events::attributes::AttrError),

    #[error("Invalid UTF-8 in XML: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("Unbalanced XML: {0}")]
    Unbalanced(String),
}

/// One parse event with owned content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlEvent {
    Start {
        name: String,
        attributes: Vec<(String, String)>,
    },
    End {
        name: String,
    },
    Text(String),
}

impl XmlEvent {
    /// Convenience constructor for a start tag
    pub fn start(name: &str, attributes: &[(&str, &str)]) -> Self {
        XmlEvent::Start {
            name: name.to_string(),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Convenience constructor for an end tag
    pub fn end(name: &str) -> Self {
        XmlEvent::End {
            name: name.to_string(),
        }
    }

    /// Value of the attribute with the given local name on a start tag
    pub fn attribute(&self, key: &str) -> Option<&str> {
        match self {
            XmlEvent::Start { attributes, .. } => attributes
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }
}

/// Async pull parser over a buffered byte source
pub struct EventStream<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
    depth: usize,
    finished: bool,
}

impl<R: AsyncBufRead + Unpin> EventStream<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: configured(Reader::from_reader(inner)),
            buf: Vec::with_capacity(4096),
            depth: 0,
            finished: false,
        }
    }

    /// Current element nesting depth
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Next event, or `None` once the document is complete
    pub async fn next_event(&mut self) -> Result<Option<XmlEvent>, XmlError> {
        while !self.finished {
            self.buf.clear();
            let event = self.reader.read_event_into_async(&mut self.buf).await?;
            if let Some(event) = convert(event, &mut self.depth, &mut self.finished)? {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }
}

/// Tokenize a complete in-memory document
pub fn events_from_str(xml: &str) -> Result<Vec<XmlEvent>, XmlError> {
    let mut reader = configured(Reader::from_str(xml));
    let mut depth = 0;
    let mut finished = false;
    let mut events = Vec::new();

    while !finished {
        let event = reader.read_event()?;
        if let Some(event) = convert(event, &mut depth, &mut finished)? {
            events.push(event);
        }
    }

    Ok(events)
}

fn configured<R>(mut reader: Reader<R>) -> Reader<R> {
    let config = reader.config_mut();
    config.trim_text(false);
    config.expand_empty_elements = true;
    config.check_end_names = true;
    reader
}

fn convert(
    event: Event<'_>,
    depth: &mut usize,
    finished: &mut bool,
) -> Result<Option<XmlEvent>, XmlError> {
    let converted = match event {
        Event::Start(start) => {
            *depth += 1;
            Some(start_event(&start)?)
        },
        Event::End(end) => {
            if *depth == 0 {
                return Err(XmlError::Unbalanced("end tag without start tag".to_string()));
            }
            *depth -= 1;
            Some(XmlEvent::End {
                name: std::str::from_utf8(end.local_name().as_ref())?.to_string(),
            })
        },
        Event::Text(text) => {
            let text = text.unescape()?;
            (!text.is_empty()).then(|| XmlEvent::Text(text.into_owned()))
        },
        Event::CData(data) => Some(XmlEvent::Text(
            std::str::from_utf8(data.as_ref())?.to_string(),
        )),
        Event::Eof => {
            if *depth != 0 {
                return Err(XmlError::Unbalanced(format!(
                    "document ended with {} open element(s)",
                    depth
                )));
            }
            *finished = true;
            None
        },
        // Expanded by the reader configuration
        Event::Empty(_) => None,
        Event::Comment(_) | Event::Decl(_) | Event::PI(_) | Event::DocType(_) => None,
    };

    Ok(converted)
}

fn start_event(start: &BytesStart<'_>) -> Result<XmlEvent, XmlError> {
    let name = std::str::from_utf8(start.local_name().as_ref())?.to_string();
    let mut attributes = Vec::new();

    for attribute in start.attributes() {
        let attribute = attribute?;
        let key = attribute.key.local_name();
        let key = std::str::from_utf8(key.as_ref())?;
        if key == "xmlns" || attribute.key.as_ref().starts_with(b"xmlns:") {
            continue;
        }
        attributes.push((key.to_string(), attribute.unescape_value()?.into_owned()));
    }

    Ok(XmlEvent::Start { name, attributes })
}
