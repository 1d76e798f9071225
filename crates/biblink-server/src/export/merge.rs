//! Local cluster merge
//!
//! The merged record is the first member's MARC record with its `999`
//! fields replaced by:
//!
//! - `999 1 0 $i <cluster id> $m <match value>...`
//! - one `999 0 0 $l <local id> $s <source id>` per member

use serde_json::{json, Value};
use uuid::Uuid;

use super::{format_datestamp, ClusterExportItem};
use crate::marc::{CodecError, DataField, MarcDocument};
use crate::storage::ClusterMember;

const CLUSTER_TAG: &str = "999";

/// Merge members into one record; `None` for an empty cluster
pub fn merge_cluster(
    cluster_id: Uuid,
    members: &[ClusterMember],
    match_values: &[String],
) -> Result<Option<MarcDocument>, CodecError> {
    if members.is_empty() {
        return Ok(None);
    }

    let marc = members
        .iter()
        .find_map(|m| m.payload.get("marc").filter(|v| v.is_object()))
        .ok_or_else(|| {
            CodecError::InvalidDocument(format!("cluster {cluster_id} has no MARC payload"))
        })?;

    let mut doc = MarcDocument::from_json(marc)?;
    doc.remove_fields(CLUSTER_TAG);

    let mut cluster = DataField::with_indicators(CLUSTER_TAG, Some("1"), Some("0"))
        .with_subfield("i", &cluster_id.to_string());
    for value in match_values {
        cluster.push_subfield("m", value);
    }
    doc.insert_data_field(cluster);

    for member in members {
        doc.insert_data_field(
            DataField::with_indicators(CLUSTER_TAG, Some("0"), Some("0"))
                .with_subfield("l", &member.local_id)
                .with_subfield("s", &member.source_id),
        );
    }

    Ok(Some(doc))
}

/// Cluster document handed to an external transform
pub fn cluster_document(
    item: &ClusterExportItem,
    members: &[ClusterMember],
    match_values: &[String],
) -> Value {
    json!({
        "clusterId": item.cluster_id,
        "datestamp": format_datestamp(item.datestamp),
        "records": members,
        "matchValues": match_values,
    })
}
