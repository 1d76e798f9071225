use super::document::{ControlField, DataField, Field, Indicators, MarcDocument};
use super::CodecError;
use crate::oai::MetadataDecoder;
use crate::xml::{events_from_str, XmlEvent};

/// Element whose text is being collected
#[derive(Debug)]
enum Capture {
    Leader,
    Control(String),
    Subfield(String),
}

/// Incremental MARC-XML decoder
///
/// Builds exactly one [`MarcDocument`] from forwarded events. A
/// `<collection>` wrapper is tolerated; a second `<record>` is not.
#[derive(Debug, Default)]
pub struct MarcDecoder {
    document: MarcDocument,
    records: usize,
    capture: Option<Capture>,
    text: String,
    data_field: Option<usize>,
}

impl MarcDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn start(&mut self, name: &str, event: &XmlEvent) -> Result<(), CodecError> {
        match name {
            "collection" => {},
            "record" => {
                self.records += 1;
                if self.records > 1 {
                    return Err(CodecError::MultipleRecords);
                }
            },
            "leader" => self.capture = Some(Capture::Leader),
            "controlfield" => {
                let tag = required(event, "controlfield", "tag")?;
                self.capture = Some(Capture::Control(tag.to_string()));
            },
            "datafield" => {
                let tag = required(event, "datafield", "tag")?;
                let mut indicators = Indicators::default();
                if let XmlEvent::Start { attributes, .. } = event {
                    for (key, value) in attributes {
                        if let Some(position) = Indicators::position(key) {
                            indicators.set(position, Some(value));
                        }
                    }
                }
                self.document
                    .fields
                    .push(Field::Data(DataField::new(tag, indicators)));
                self.data_field = Some(self.document.fields.len() - 1);
            },
            "subfield" => {
                if self.data_field.is_none() {
                    return Err(CodecError::SubfieldOutsideField);
                }
                let code = required(event, "subfield", "code")?;
                self.capture = Some(Capture::Subfield(code.to_string()));
            },
            other => return Err(CodecError::UnexpectedElement(other.to_string())),
        }
        Ok(())
    }

    fn flush(&mut self) {
        let text = std::mem::take(&mut self.text);
        match self.capture.take() {
            None => {},
            Some(Capture::Leader) => self.document.leader = Some(text),
            Some(Capture::Control(tag)) => self
                .document
                .fields
                .push(Field::Control(ControlField { tag, value: text })),
            Some(Capture::Subfield(code)) => {
                let field = self
                    .data_field
                    .and_then(|i| self.document.fields.get_mut(i));
                if let Some(Field::Data(field)) = field {
                    field.push_subfield(&code, &text);
                }
            },
        }
    }
}

impl MetadataDecoder for MarcDecoder {
    type Output = MarcDocument;

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn handle(&mut self, event: &XmlEvent) -> Result<(), CodecError> {
        match event {
            XmlEvent::Start { name, .. } => {
                self.flush();
                self.start(name, event)
            },
            XmlEvent::End { name } => {
                self.flush();
                if name == "datafield" {
                    self.data_field = None;
                }
                Ok(())
            },
            XmlEvent::Text(text) => {
                if self.capture.is_some() {
                    self.text.push_str(text);
                }
                Ok(())
            },
        }
    }

    fn finish(&mut self) -> Result<MarcDocument, CodecError> {
        self.flush();
        if self.records == 0 {
            return Err(CodecError::NoRecord);
        }
        Ok(std::mem::take(&mut self.document))
    }
}

fn required<'a>(
    event: &'a XmlEvent,
    element: &'static str,
    attribute: &'static str,
) -> Result<&'a str, CodecError> {
    event
        .attribute(attribute)
        .ok_or(CodecError::MissingAttribute { element, attribute })
}

/// Decode a complete MARC-XML document holding one record
pub fn decode_str(xml: &str) -> Result<MarcDocument, CodecError> {
    let mut decoder = MarcDecoder::new();
    for event in events_from_str(xml)? {
        decoder.handle(&event)?;
    }
    decoder.finish()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<collection xmlns="http://www.loc.gov/MARC21/slim">
  <record>
    <leader>00714cam a2200205 a 4500</leader>
    <controlfield tag="001">12883376</controlfield>
    <datafield tag="245" ind1="1" ind2="0">
      <subfield code="a">Jane Eyre /</subfield>
      <subfield code="c">Charlotte Bront&#235;.</subfield>
    </datafield>
    <datafield tag="650" ind2="0">
      <subfield code="a">Orphans</subfield>
      <subfield code="a">Governesses</subfield>
    </datafield>
  </record>
</collection>"#;

    #[test]
    fn test_decode_sample() {
        let doc = decode_str(SAMPLE).unwrap();

        assert_eq!(doc.leader.as_deref(), Some("00714cam a2200205 a 4500"));
        assert_eq!(doc.control_field("001"), Some("12883376"));

        let title = doc.lookup_data_field("245", Some("1"), Some("0")).unwrap();
        assert_eq!(title.subfield("c"), Some("Charlotte Brontë."));

        let subject = doc.lookup_data_field("650", None, Some("0")).unwrap();
        assert_eq!(subject.indicators.get(1), None);
        let values: Vec<_> = subject.subfields.iter().map(|s| s.value.as_str()).collect();
        assert_eq!(values, vec!["Orphans", "Governesses"]);
    }

    #[test]
    fn test_namespace_prefixes() {
        let doc = decode_str(
            r#"<marc:record xmlns:marc="http://www.loc.gov/MARC21/slim"><marc:controlfield tag="001">x</marc:controlfield></marc:record>"#,
        )
        .unwrap();
        assert_eq!(doc.control_field("001"), Some("x"));
    }

    #[test]
    fn test_no_record() {
        assert_eq!(decode_str("<collection/>").unwrap_err(), CodecError::NoRecord);
    }

    #[test]
    fn test_multiple_records() {
        let err = decode_str("<collection><record/><record/></collection>").unwrap_err();
        assert_eq!(err, CodecError::MultipleRecords);
    }

    #[test]
    fn test_unknown_element() {
        let err = decode_str("<record><foo/></record>").unwrap_err();
        assert_eq!(err, CodecError::UnexpectedElement("foo".to_string()));
    }

    #[test]
    fn test_subfield_without_field() {
        let err = decode_str(r#"<record><subfield code="a">x</subfield></record>"#).unwrap_err();
        assert_eq!(err, CodecError::SubfieldOutsideField);
    }

    #[test]
    fn test_missing_tag() {
        let err = decode_str("<record><controlfield>x</controlfield></record>").unwrap_err();
        assert!(matches!(err, CodecError::MissingAttribute { attribute: "tag", .. }));
    }

    #[test]
    fn test_empty_subfield_value() {
        let doc =
            decode_str(r#"<record><datafield tag="500"><subfield code="a"/></datafield></record>"#)
                .unwrap();
        assert_eq!(doc.lookup_data_field("500", None, None).unwrap().subfield("a"), Some(""));
    }

    #[test]
    fn test_reset_allows_reuse() {
        let mut decoder = MarcDecoder::new();
        for event in events_from_str("<record><controlfield tag=\"001\">1</controlfield></record>")
            .unwrap()
        {
            decoder.handle(&event).unwrap();
        }
        decoder.finish().unwrap();
        decoder.reset();
        for event in events_from_str("<record/>").unwrap() {
            decoder.handle(&event).unwrap();
        }
        assert!(decoder.finish().unwrap().fields.is_empty());
    }
}
