use chrono::{DateTime, Utc};
use quick_xml::escape::escape;
use uuid::Uuid;

pub fn oai_identifier(prefix: &str, cluster_id: Uuid) -> String {
    format!("{prefix}{cluster_id}")
}

pub fn format_datestamp(datestamp: DateTime<Utc>) -> String {
    datestamp.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// OAI `<record>` fragment, or a bare `<header>` when `with_metadata` is off
///
/// `metadata` is the already-encoded MARC-XML; `None` marks the record
/// deleted.
pub fn render_record(
    identifier: &str,
    datestamp: DateTime<Utc>,
    set_spec: &str,
    metadata: Option<&str>,
    with_metadata: bool,
) -> String {
    let status = if metadata.is_none() {
        " status=\"deleted\""
    } else {
        ""
    };
    let indent = if with_metadata { "    " } else { "  " };

    let mut out = String::new();
    if with_metadata {
        out.push_str("  <record>\n");
    }
    out.push_str(&format!("{indent}<header{status}>\n"));
    out.push_str(&format!(
        "{indent}  <identifier>{}</identifier>\n",
        escape(identifier)
    ));
    out.push_str(&format!(
        "{indent}  <datestamp>{}</datestamp>\n",
        format_datestamp(datestamp)
    ));
    out.push_str(&format!("{indent}  <setSpec>{}</setSpec>\n", escape(set_spec)));
    out.push_str(&format!("{indent}</header>\n"));

    if with_metadata {
        if let Some(metadata) = metadata {
            out.push_str("    <metadata>\n");
            out.push_str(metadata);
            out.push_str("\n    </metadata>\n");
        }
        out.push_str("  </record>\n");
    }
    out
}

/// Comment written in place of a record that could not be produced
pub fn render_failure(message: &str) -> String {
    // "--" may not appear inside an XML comment
    let message = escape(message).replace("--", "- -");
    format!("<!-- Failed to produce record: {message} -->\n")
}
