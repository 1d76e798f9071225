use std::fmt::Write;

use quick_xml::escape::escape;

use super::document::{Field, MarcDocument};
use super::MARCXML_NAMESPACE;

/// Encode a document as a MARC21 slim `<record>`
pub fn encode(doc: &MarcDocument) -> String {
    let mut xml = String::with_capacity(256 + doc.fields.len() * 96);
    xml.push_str(&format!("<record xmlns=\"{MARCXML_NAMESPACE}\">\n"));

    if let Some(leader) = &doc.leader {
        let _ = writeln!(xml, "  <leader>{}</leader>", escape(leader.as_str()));
    }

    for field in &doc.fields {
        match field {
            Field::Control(c) => {
                let _ = writeln!(
                    xml,
                    "  <controlfield tag=\"{}\">{}</controlfield>",
                    escape(c.tag.as_str()),
                    escape(c.value.as_str())
                );
            },
            Field::Data(d) => {
                let _ = write!(xml, "  <datafield tag=\"{}\"", escape(d.tag.as_str()));
                for (position, value) in d.indicators.iter() {
                    let _ = write!(xml, " ind{}=\"{}\"", position, escape(value));
                }
                xml.push_str(">\n");
                for sub in &d.subfields {
                    let _ = writeln!(
                        xml,
                        "    <subfield code=\"{}\">{}</subfield>",
                        escape(sub.code.as_str()),
                        escape(sub.value.as_str())
                    );
                }
                xml.push_str("  </datafield>\n");
            },
        }
    }

    xml.push_str("</record>");
    xml
}
