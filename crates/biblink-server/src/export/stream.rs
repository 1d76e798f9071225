//! Bounded-concurrency export stream
//!
//! Each accepted item is rendered on its own task. At most `max_in_flight`
//! renders run at once; [`ClusterExportStream::write`] waits for any of them
//! to finish once the limit is reached. Finished fragments are buffered and
//! written in acceptance order, and a failed item becomes a comment in its
//! own slot.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    cluster_document, merge_cluster, oai_identifier, render_failure, render_record,
    ClusterExportItem, ExportError, ExportOptions,
};
use crate::marc::{encode, CodecError, MarcDocument};
use crate::storage::{ClusterMember, Storage, Transform};

#[derive(Clone)]
struct RenderContext {
    storage: Arc<dyn Storage>,
    transform: Option<Arc<dyn Transform>>,
    options: ExportOptions,
}

pub struct ClusterExportStream<W> {
    writer: W,
    context: RenderContext,
    completed_tx: mpsc::UnboundedSender<(u64, String)>,
    completed_rx: mpsc::UnboundedReceiver<(u64, String)>,
    /// Finished fragments waiting for an older item
    ready: BTreeMap<u64, String>,
    running: usize,
    accepted: u64,
    written: usize,
}

impl<W: AsyncWrite + Unpin> ClusterExportStream<W> {
    pub fn new(writer: W, storage: Arc<dyn Storage>, options: ExportOptions) -> Self {
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        Self {
            writer,
            context: RenderContext {
                storage,
                transform: None,
                options,
            },
            completed_tx,
            completed_rx,
            ready: BTreeMap::new(),
            running: 0,
            accepted: 0,
            written: 0,
        }
    }

    /// Build merged records with `transform` instead of the local merge
    ///
    /// Applies to items accepted after the call.
    pub fn with_transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.context.transform = Some(transform);
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.context.options.max_in_flight.max(1)
    }

    /// Items accepted whose render has not finished
    pub fn in_flight(&self) -> usize {
        self.running
    }

    /// True while the in-flight set is at capacity
    pub fn is_full(&self) -> bool {
        self.in_flight() >= self.max_in_flight()
    }

    /// Fragments written so far
    pub fn written(&self) -> usize {
        self.written
    }

    /// Accept an item, first waiting for a free slot if the set is full
    pub async fn write(&mut self, item: ClusterExportItem) -> Result<(), ExportError> {
        while self.is_full() {
            self.drain().await?;
        }

        let seq = self.accepted;
        self.accepted += 1;
        self.running += 1;

        let context = self.context.clone();
        let completed = self.completed_tx.clone();
        tokio::spawn(async move {
            let fragment = tokio::spawn(render(context, item))
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "render task failed");
                    render_failure(&e.to_string())
                });
            // The stream may have been dropped mid-export
            let _ = completed.send((seq, fragment));
        });
        Ok(())
    }

    /// Wait for the next render to finish, then write every fragment whose
    /// turn has come
    ///
    /// Returns `false` when nothing was in flight. Capacity is freed by the
    /// completion itself, even if the fragment must wait behind an older one.
    pub async fn drain(&mut self) -> Result<bool, ExportError> {
        if self.running == 0 {
            return Ok(false);
        }
        let Some((seq, fragment)) = self.completed_rx.recv().await else {
            return Err(ExportError::Task("completion channel closed".to_string()));
        };
        self.running -= 1;
        self.ready.insert(seq, fragment);
        self.flush_ready().await?;
        Ok(true)
    }

    async fn flush_ready(&mut self) -> Result<(), ExportError> {
        while let Some(entry) = self.ready.first_entry() {
            if *entry.key() != self.written as u64 {
                break;
            }
            let fragment = entry.remove();
            self.writer.write_all(fragment.as_bytes()).await?;
            self.written += 1;
        }
        Ok(())
    }

    /// Wait for every accepted item, flush, and hand back the writer
    pub async fn end(mut self) -> Result<W, ExportError> {
        while self.drain().await? {}
        self.writer.flush().await?;
        debug!(written = self.written, "export stream ended");
        Ok(self.writer)
    }
}

async fn render(context: RenderContext, item: ClusterExportItem) -> String {
    debug!(cluster_id = %item.cluster_id, "rendering cluster");
    match produce(&context, &item).await {
        Ok(fragment) => fragment,
        Err(e) => {
            warn!(cluster_id = %item.cluster_id, error = %e, "failed to produce record");
            render_failure(&e.to_string())
        },
    }
}

async fn produce(context: &RenderContext, item: &ClusterExportItem) -> Result<String, ExportError> {
    let options = &context.options;
    let identifier = oai_identifier(&options.identifier_prefix, item.cluster_id);
    let members = context.storage.cluster_members(item.cluster_id).await?;

    let metadata = if members.is_empty() {
        None
    } else if !options.with_metadata {
        Some(String::new())
    } else {
        let values = context.storage.cluster_match_values(item.cluster_id).await?;
        Some(metadata(context, item, members, values).await?)
    };

    Ok(render_record(
        &identifier,
        item.datestamp,
        &item.set_spec,
        metadata.as_deref(),
        options.with_metadata,
    ))
}

async fn metadata(
    context: &RenderContext,
    item: &ClusterExportItem,
    members: Vec<ClusterMember>,
    values: Vec<String>,
) -> Result<String, ExportError> {
    if let Some(transform) = &context.transform {
        let output = transform
            .execute(cluster_document(item, &members, &values))
            .await?;
        let marc = match output.get("marc") {
            Some(marc @ Value::Object(_)) => marc,
            _ => &output,
        };
        return Ok(encode(&MarcDocument::from_json(marc)?));
    }

    let cluster_id = item.cluster_id;
    let encoded = tokio::task::spawn_blocking(move || -> Result<String, CodecError> {
        let merged = merge_cluster(cluster_id, &members, &values)?;
        Ok(merged.map(|doc| encode(&doc)).unwrap_or_default())
    })
    .await
    .map_err(|e| ExportError::Task(e.to_string()))??;

    Ok(encoded)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::matchkey::MatchKeyConfig;
    use crate::storage::{IngestRecord, StorageError, TransformError, JsonTransform};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::{HashMap, HashSet};
    use std::time::Duration;
    use tokio::sync::watch;
    use uuid::Uuid;

    /// Storage serving fixed clusters, the `gated` ones held until a gate opens
    struct FixedStorage {
        clusters: HashMap<Uuid, Vec<ClusterMember>>,
        gate: Option<watch::Receiver<bool>>,
        gated: HashSet<Uuid>,
    }

    #[async_trait]
    impl Storage for FixedStorage {
        async fn ingest(&self, _: &str, _: IngestRecord, _: &[MatchKeyConfig]) -> Result<(), StorageError> {
            Ok(())
        }

        async fn match_key_configs(&self) -> Result<Vec<MatchKeyConfig>, StorageError> {
            Ok(Vec::new())
        }

        async fn cluster_members(&self, cluster_id: Uuid) -> Result<Vec<ClusterMember>, StorageError> {
            if let Some(gate) = self.gate.as_ref().filter(|_| self.gated.contains(&cluster_id)) {
                let mut gate = gate.clone();
                gate.wait_for(|open| *open).await.unwrap();
            }
            Ok(self.clusters.get(&cluster_id).cloned().unwrap_or_default())
        }

        async fn cluster_match_values(&self, _: Uuid) -> Result<Vec<String>, StorageError> {
            Ok(vec!["K".to_string()])
        }
    }

    fn member(title: &str) -> ClusterMember {
        ClusterMember {
            global_id: Uuid::new_v4(),
            local_id: title.to_string(),
            source_id: "s".to_string(),
            payload: json!({"marc": {"fields": [{"245": {"subfields": [{"a": title}]}}]}}),
        }
    }

    fn item(cluster_id: Uuid) -> ClusterExportItem {
        ClusterExportItem {
            cluster_id,
            datestamp: Utc::now(),
            set_spec: "all".to_string(),
        }
    }

    fn options(max_in_flight: usize) -> ExportOptions {
        ExportOptions {
            max_in_flight,
            ..ExportOptions::default()
        }
    }

    fn fixture(titles: &[&str], gate: Option<watch::Receiver<bool>>) -> (Arc<FixedStorage>, Vec<Uuid>) {
        let all: Vec<usize> = (0..titles.len()).collect();
        partly_gated_fixture(titles, gate, &all)
    }

    fn partly_gated_fixture(
        titles: &[&str],
        gate: Option<watch::Receiver<bool>>,
        gated_items: &[usize],
    ) -> (Arc<FixedStorage>, Vec<Uuid>) {
        let mut clusters = HashMap::new();
        let mut ids = Vec::new();
        for title in titles {
            let id = Uuid::new_v4();
            clusters.insert(id, vec![member(title)]);
            ids.push(id);
        }
        let gated = gated_items.iter().map(|i| ids[*i]).collect();
        (Arc::new(FixedStorage { clusters, gate, gated }), ids)
    }

    #[tokio::test]
    async fn test_end_on_empty_stream_completes() {
        let (storage, _) = fixture(&[], None);
        let stream = ClusterExportStream::new(Vec::new(), storage, options(5));
        let out = stream.end().await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_full_at_max_and_end_waits_for_all() {
        let (open, gate) = watch::channel(false);
        let (storage, ids) = fixture(&["a", "b", "c"], Some(gate));
        let mut stream = ClusterExportStream::new(Vec::new(), storage, options(3));

        stream.write(item(ids[0])).await.unwrap();
        stream.write(item(ids[1])).await.unwrap();
        assert!(!stream.is_full());
        stream.write(item(ids[2])).await.unwrap();
        assert!(stream.is_full());
        assert_eq!(stream.in_flight(), 3);

        let mut end = Box::pin(stream.end());
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut end)
            .await
            .is_err());

        open.send(true).unwrap();
        let out = String::from_utf8(end.await.unwrap()).unwrap();
        assert_eq!(out.matches("<record>").count(), 3);
    }

    #[tokio::test]
    async fn test_drain_reopens_capacity() {
        let (open, gate) = watch::channel(false);
        let (storage, ids) = fixture(&["a", "b"], Some(gate));
        let mut stream = ClusterExportStream::new(Vec::new(), storage, options(2));

        stream.write(item(ids[0])).await.unwrap();
        stream.write(item(ids[1])).await.unwrap();
        assert!(stream.is_full());

        open.send(true).unwrap();
        assert!(stream.drain().await.unwrap());
        assert!(!stream.is_full());
        assert_eq!(stream.in_flight(), 1);

        let out = String::from_utf8(stream.end().await.unwrap()).unwrap();
        assert_eq!(out.matches("<record>").count(), 2);
    }

    #[tokio::test]
    async fn test_finished_items_free_capacity_behind_slow_head() {
        let (open, gate) = watch::channel(false);
        let (storage, ids) = partly_gated_fixture(&["a", "b", "c", "d"], Some(gate), &[0]);
        let mut stream = ClusterExportStream::new(Vec::new(), storage, options(3));

        for id in &ids[..3] {
            stream.write(item(*id)).await.unwrap();
        }
        assert!(stream.is_full());

        assert!(stream.drain().await.unwrap());
        assert!(stream.drain().await.unwrap());
        assert!(!stream.is_full());
        assert_eq!(stream.in_flight(), 1);
        assert_eq!(stream.written(), 0);

        tokio::time::timeout(Duration::from_millis(200), stream.write(item(ids[3])))
            .await
            .expect("write must not wait on the slow head item")
            .unwrap();

        open.send(true).unwrap();
        let out = String::from_utf8(stream.end().await.unwrap()).unwrap();
        let positions: Vec<usize> = [">a<", ">b<", ">c<", ">d<"]
            .iter()
            .map(|title| out.find(title).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_write_blocks_while_full() {
        let (open, gate) = watch::channel(false);
        let (storage, ids) = fixture(&["a", "b"], Some(gate));
        let mut stream = ClusterExportStream::new(Vec::new(), storage, options(1));

        stream.write(item(ids[0])).await.unwrap();
        {
            let blocked = stream.write(item(ids[1]));
            tokio::pin!(blocked);
            assert!(tokio::time::timeout(Duration::from_millis(50), &mut blocked)
                .await
                .is_err());
        }

        open.send(true).unwrap();
        stream.write(item(ids[1])).await.unwrap();
        let out = String::from_utf8(stream.end().await.unwrap()).unwrap();
        assert!(out.contains(">a<"));
        assert!(out.contains(">b<"));
    }

    #[tokio::test]
    async fn test_failed_item_is_isolated_in_place() {
        let (storage, ids) = fixture(&["first", "bad", "third", "fourth"], None);
        let transform = JsonTransform::new(|cluster| {
            let title = cluster["records"][0]["localId"].as_str().unwrap_or_default().to_string();
            if title == "bad" {
                return Err(TransformError("cannot merge bad".to_string()));
            }
            Ok(cluster["records"][0]["payload"]["marc"].clone())
        });
        let mut stream = ClusterExportStream::new(Vec::new(), storage, options(2))
            .with_transform(Arc::new(transform));

        for id in &ids {
            stream.write(item(*id)).await.unwrap();
        }
        let out = String::from_utf8(stream.end().await.unwrap()).unwrap();

        assert_eq!(out.matches("<!-- Failed to produce record").count(), 1);
        assert!(out.contains("cannot merge bad"));
        let first = out.find(">first<").unwrap();
        let failure = out.find("<!-- Failed").unwrap();
        let third = out.find(">third<").unwrap();
        let fourth = out.find(">fourth<").unwrap();
        assert!(first < failure && failure < third && third < fourth);
    }

    #[tokio::test]
    async fn test_local_merge_adds_cluster_fields() {
        let (storage, ids) = fixture(&["solo"], None);
        let mut stream = ClusterExportStream::new(Vec::new(), storage, options(5));
        stream.write(item(ids[0])).await.unwrap();
        let out = String::from_utf8(stream.end().await.unwrap()).unwrap();

        assert!(out.contains(&format!("<identifier>oai:{}</identifier>", ids[0])));
        assert!(out.contains(&format!("<subfield code=\"i\">{}</subfield>", ids[0])));
        assert!(out.contains("<subfield code=\"m\">K</subfield>"));
        assert!(out.contains("<datafield tag=\"999\" ind1=\"0\" ind2=\"0\">"));
    }

    #[tokio::test]
    async fn test_transform_replaces_local_merge() {
        let (storage, ids) = fixture(&["solo"], None);
        let transform = JsonTransform::new(|_| {
            Ok(json!({"marc": {"fields": [{"245": {"subfields": [{"a": "merged elsewhere"}]}}]}}))
        });
        let mut stream = ClusterExportStream::new(Vec::new(), storage, options(5))
            .with_transform(Arc::new(transform));
        stream.write(item(ids[0])).await.unwrap();
        let out = String::from_utf8(stream.end().await.unwrap()).unwrap();

        assert!(out.contains(">merged elsewhere<"));
        assert!(!out.contains(">solo<"));
        assert!(!out.contains("tag=\"999\""));
    }

    #[tokio::test]
    async fn test_empty_cluster_is_deleted_header() {
        let (storage, _) = fixture(&[], None);
        let mut stream = ClusterExportStream::new(Vec::new(), storage, options(5));
        stream.write(item(Uuid::new_v4())).await.unwrap();
        let out = String::from_utf8(stream.end().await.unwrap()).unwrap();

        assert!(out.contains("<header status=\"deleted\">"));
        assert!(!out.contains("<metadata>"));
    }

    #[tokio::test]
    async fn test_headers_only() {
        let (storage, ids) = fixture(&["a"], None);
        let options = ExportOptions {
            with_metadata: false,
            ..ExportOptions::default()
        };
        let mut stream = ClusterExportStream::new(Vec::new(), storage, options);
        stream.write(item(ids[0])).await.unwrap();
        let out = String::from_utf8(stream.end().await.unwrap()).unwrap();

        assert!(out.starts_with("  <header>"));
        assert!(!out.contains("<metadata>"));
    }
}
