//! Streaming OAI-PMH record parser
//!
//! The parser is a plain state value advanced one event at a time with
//! [`RecordParser::feed`]; it never recurses and never reads on its own.
//! [`RecordParser::parse`] drives it from an [`EventStream`] and awaits the
//! record handler before pulling the next event, so ingestion of record `n`
//! finishes before any byte of record `n + 1` is consumed.
//!
//! Layout handled:
//!
//! ```text
//! depth 1  <OAI-PMH>
//! depth 2    <ListRecords> | <GetRecord> | <ListIdentifiers> | <error code="..">
//! depth 3      <record> | <header>        record boundary
//!                <header status="deleted"><identifier/><datestamp/></header>
//!                <metadata> ... </metadata>   forwarded to the decoder
//! depth 3      <resumptionToken>..</resumptionToken>
//! ```

use std::future::Future;

use tokio::io::AsyncBufRead;
use tracing::debug;

use super::{MetadataDecoder, OaiError, OaiRecord, NO_RECORDS_MATCH};
use crate::xml::{events_from_str, EventStream, XmlEvent};

/// Depth of `<record>` / `<header>` boundaries
const RECORD_DEPTH: usize = 3;

/// Depth of a protocol `<error>` element
const ERROR_DEPTH: usize = 2;

#[derive(Debug)]
enum Target {
    Identifier,
    Datestamp,
    ResumptionToken,
    Error { code: String },
}

#[derive(Debug)]
struct Capture {
    target: Target,
    depth: usize,
    text: String,
}

/// Outcome of one parsed page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSummary {
    pub records: usize,
    pub resumption_token: Option<String>,
}

pub struct RecordParser<D: MetadataDecoder> {
    decoder: D,
    depth: usize,
    metadata_depth: Option<usize>,
    current: Option<OaiRecord<D::Output>>,
    capture: Option<Capture>,
    resumption_token: Option<String>,
    boundaries: usize,
    emitted: usize,
    single: bool,
}

impl<D: MetadataDecoder> RecordParser<D> {
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            depth: 0,
            metadata_depth: None,
            current: None,
            capture: None,
            resumption_token: None,
            boundaries: 0,
            emitted: 0,
            single: false,
        }
    }

    /// Parser that fails on a second record boundary
    pub fn single(decoder: D) -> Self {
        Self {
            single: true,
            ..Self::new(decoder)
        }
    }

    /// Last resumption token seen; empty tokens count as none
    pub fn resumption_token(&self) -> Option<&str> {
        self.resumption_token.as_deref()
    }

    /// Advance by one event, returning a record completed by this event
    pub fn feed(&mut self, event: &XmlEvent) -> Result<Option<OaiRecord<D::Output>>, OaiError> {
        match event {
            XmlEvent::Start { name, .. } => {
                self.depth += 1;

                if self.metadata_depth.is_some() {
                    self.decoder.handle(event)?;
                    return Ok(None);
                }

                let mut completed = None;
                if self.depth == RECORD_DEPTH && (name == "record" || name == "header") {
                    completed = self.begin_record()?;
                }

                match name.as_str() {
                    "header" => {
                        if event.attribute("status") == Some("deleted") {
                            if let Some(record) = self.current.as_mut() {
                                record.deleted = true;
                            }
                        }
                    },
                    "metadata" if self.current.is_some() => {
                        self.metadata_depth = Some(self.depth);
                    },
                    "identifier" if self.current.is_some() => self.begin_capture(Target::Identifier),
                    "datestamp" if self.current.is_some() => self.begin_capture(Target::Datestamp),
                    "resumptionToken" => self.begin_capture(Target::ResumptionToken),
                    "error" if self.depth == ERROR_DEPTH => {
                        let code = event.attribute("code").unwrap_or_default().to_string();
                        self.begin_capture(Target::Error { code });
                    },
                    _ => {},
                }

                Ok(completed)
            },
            XmlEvent::End { .. } => {
                if let Some(metadata_depth) = self.metadata_depth {
                    if self.depth > metadata_depth {
                        self.decoder.handle(event)?;
                    } else {
                        let metadata = self.decoder.finish()?;
                        if let Some(record) = self.current.as_mut() {
                            record.metadata = Some(metadata);
                        }
                        self.metadata_depth = None;
                    }
                } else if self.capture.as_ref().is_some_and(|c| c.depth == self.depth) {
                    self.end_capture()?;
                }

                self.depth = self.depth.saturating_sub(1);
                Ok(None)
            },
            XmlEvent::Text(text) => {
                match self.metadata_depth {
                    Some(metadata_depth) if self.depth > metadata_depth => {
                        self.decoder.handle(event)?;
                    },
                    Some(_) => {},
                    None => {
                        if let Some(capture) = self.capture.as_mut() {
                            capture.text.push_str(text);
                        }
                    },
                }
                Ok(None)
            },
        }
    }

    /// Complete the page, returning the record still being accumulated
    pub fn finish(&mut self) -> Option<OaiRecord<D::Output>> {
        let pending = self.current.take();
        if pending.is_some() {
            self.emitted += 1;
        }
        pending
    }

    pub fn summary(&self) -> PageSummary {
        PageSummary {
            records: self.emitted,
            resumption_token: self.resumption_token.clone(),
        }
    }

    /// Parse a whole page, awaiting `on_record` for each record in order
    pub async fn parse<R, F, Fut, E>(
        &mut self,
        events: &mut EventStream<R>,
        mut on_record: F,
    ) -> Result<PageSummary, E>
    where
        R: AsyncBufRead + Unpin,
        F: FnMut(OaiRecord<D::Output>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: From<OaiError>,
    {
        while let Some(event) = events.next_event().await.map_err(OaiError::from)? {
            if let Some(record) = self.feed(&event)? {
                on_record(record).await?;
            }
        }

        if let Some(record) = self.finish() {
            on_record(record).await?;
        }

        let summary = self.summary();
        debug!(
            records = summary.records,
            has_token = summary.resumption_token.is_some(),
            "page parsed"
        );
        Ok(summary)
    }

    /// Parse a complete in-memory page
    pub fn parse_str(&mut self, xml: &str) -> Result<Vec<OaiRecord<D::Output>>, OaiError> {
        let mut records = Vec::new();
        for event in events_from_str(xml)? {
            if let Some(record) = self.feed(&event)? {
                records.push(record);
            }
        }
        records.extend(self.finish());
        Ok(records)
    }

    fn begin_record(&mut self) -> Result<Option<OaiRecord<D::Output>>, OaiError> {
        if self.single && self.boundaries > 0 {
            return Err(OaiError::MultipleRecords);
        }
        self.boundaries += 1;

        let completed = self.current.replace(OaiRecord::default());
        if completed.is_some() {
            self.emitted += 1;
        }
        self.decoder.reset();
        Ok(completed)
    }

    fn begin_capture(&mut self, target: Target) {
        self.capture = Some(Capture {
            target,
            depth: self.depth,
            text: String::new(),
        });
    }

    fn end_capture(&mut self) -> Result<(), OaiError> {
        let Some(capture) = self.capture.take() else {
            return Ok(());
        };
        let text = capture.text.trim();

        match capture.target {
            Target::Identifier => {
                if let Some(record) = self.current.as_mut() {
                    record.identifier = text.to_string();
                }
            },
            Target::Datestamp => {
                if let Some(record) = self.current.as_mut() {
                    record.datestamp = text.to_string();
                }
            },
            Target::ResumptionToken => {
                self.resumption_token = (!text.is_empty()).then(|| text.to_string());
            },
            Target::Error { code } => {
                if code != NO_RECORDS_MATCH {
                    return Err(OaiError::Protocol {
                        code,
                        message: text.to_string(),
                    });
                }
            },
        }
        Ok(())
    }
}
