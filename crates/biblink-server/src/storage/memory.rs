//! In-process storage
//!
//! Clustering rule: records that share any `(match key id, value)` pair
//! belong to the same cluster. Ingesting a record that bridges two clusters
//! merges them; the absorbed cluster stays behind empty so exports report it
//! as deleted. Clusters are never split.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use super::traits::{ClusterMember, IngestRecord, JobStore, Storage, Transform, TransformError};
use super::StorageError;
use crate::export::ClusterExportItem;
use crate::harvest::{HarvestConfig, HarvestJobState};
use crate::matchkey::{MatchKeyConfig, MatchKeyEngine, UpdatePolicy};

type RecordKey = (String, String);
type MatchValue = (String, String);

#[derive(Debug)]
struct StoredRecord {
    global_id: Uuid,
    payload: Value,
    values: BTreeSet<MatchValue>,
    cluster_id: Uuid,
}

#[derive(Debug)]
struct Cluster {
    created: u64,
    members: Vec<RecordKey>,
    datestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    records: HashMap<RecordKey, StoredRecord>,
    clusters: HashMap<Uuid, Cluster>,
    created: u64,
}

impl State {
    fn detach(&mut self, key: &RecordKey, cluster_id: Uuid, now: DateTime<Utc>) {
        if let Some(cluster) = self.clusters.get_mut(&cluster_id) {
            cluster.members.retain(|m| m != key);
            cluster.datestamp = now;
        }
    }

    fn matching_clusters(&self, values: &BTreeSet<MatchValue>) -> Vec<Uuid> {
        let mut found: Vec<Uuid> = Vec::new();
        for record in self.records.values() {
            if !found.contains(&record.cluster_id) && !record.values.is_disjoint(values) {
                found.push(record.cluster_id);
            }
        }
        found.sort_by_key(|id| self.clusters.get(id).map(|c| c.created));
        found
    }
}

/// In-memory [`Storage`]
pub struct MemoryStorage {
    engine: Arc<MatchKeyEngine>,
    match_keys: RwLock<Vec<MatchKeyConfig>>,
    state: Mutex<State>,
}

impl MemoryStorage {
    pub fn new(engine: Arc<MatchKeyEngine>) -> Self {
        Self {
            engine,
            match_keys: RwLock::new(Vec::new()),
            state: Mutex::new(State::default()),
        }
    }

    /// Register a match key, compiling it first so bad configs are rejected
    pub async fn add_match_key(&self, config: MatchKeyConfig) -> Result<(), StorageError> {
        self.engine.configure(&config.method, &config.params).await?;
        let mut keys = self.match_keys.write().await;
        keys.retain(|k| k.id != config.id);
        keys.push(config);
        Ok(())
    }

    /// Every cluster ever created, oldest change first
    pub async fn export_items(&self, set_spec: &str) -> Vec<ClusterExportItem> {
        let state = self.state.lock().await;
        let mut items: Vec<_> = state
            .clusters
            .iter()
            .map(|(id, cluster)| ClusterExportItem {
                cluster_id: *id,
                datestamp: cluster.datestamp,
                set_spec: set_spec.to_string(),
            })
            .collect();
        items.sort_by_key(|item| (item.datestamp, item.cluster_id));
        items
    }

    pub async fn record_count(&self) -> usize {
        self.state.lock().await.records.len()
    }

    /// Cluster holding `(source_id, local_id)`
    pub async fn cluster_of(&self, source_id: &str, local_id: &str) -> Option<Uuid> {
        let key = (source_id.to_string(), local_id.to_string());
        self.state.lock().await.records.get(&key).map(|r| r.cluster_id)
    }

    async fn match_values(
        &self,
        payload: &Value,
        match_keys: &[MatchKeyConfig],
    ) -> Result<BTreeSet<MatchValue>, StorageError> {
        let mut values = BTreeSet::new();
        for config in match_keys.iter().filter(|c| c.update == UpdatePolicy::Ingest) {
            for value in self.engine.evaluate(config, payload).await? {
                values.insert((config.id.clone(), value));
            }
        }
        Ok(values)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn ingest(
        &self,
        source_id: &str,
        record: IngestRecord,
        match_keys: &[MatchKeyConfig],
    ) -> Result<(), StorageError> {
        let key = (source_id.to_string(), record.local_id.clone());
        let payload = match (record.delete, record.payload) {
            (true, _) => None,
            (false, Some(payload)) => Some(payload),
            (false, None) => {
                return Err(StorageError::Backend(format!(
                    "record {} has no payload",
                    record.local_id
                )))
            },
        };

        let values = match &payload {
            Some(payload) => self.match_values(payload, match_keys).await?,
            None => BTreeSet::new(),
        };

        let now = Utc::now();
        let mut state = self.state.lock().await;

        let previous = state.records.remove(&key);
        if let Some(previous) = &previous {
            state.detach(&key, previous.cluster_id, now);
        }

        let Some(payload) = payload else {
            debug!(source_id, local_id = %key.1, "record deleted");
            return Ok(());
        };

        let mut targets = state.matching_clusters(&values);
        let cluster_id = match (targets.is_empty(), &previous) {
            (false, _) => targets.remove(0),
            (true, Some(previous)) => previous.cluster_id,
            (true, None) => Uuid::new_v4(),
        };

        for absorbed in targets {
            let moved = match state.clusters.get_mut(&absorbed) {
                Some(cluster) => {
                    cluster.datestamp = now;
                    std::mem::take(&mut cluster.members)
                },
                None => Vec::new(),
            };
            for member in &moved {
                if let Some(stored) = state.records.get_mut(member) {
                    stored.cluster_id = cluster_id;
                }
            }
            if let Some(cluster) = state.clusters.get_mut(&cluster_id) {
                cluster.members.extend(moved);
            }
        }

        state.created += 1;
        let created = state.created;
        let cluster = state.clusters.entry(cluster_id).or_insert_with(|| Cluster {
            created,
            members: Vec::new(),
            datestamp: now,
        });
        cluster.members.push(key.clone());
        cluster.datestamp = now;

        let global_id = previous.map_or_else(Uuid::new_v4, |p| p.global_id);
        state.records.insert(
            key,
            StoredRecord {
                global_id,
                payload,
                values,
                cluster_id,
            },
        );

        Ok(())
    }

    async fn match_key_configs(&self) -> Result<Vec<MatchKeyConfig>, StorageError> {
        Ok(self.match_keys.read().await.clone())
    }

    async fn cluster_members(&self, cluster_id: Uuid) -> Result<Vec<ClusterMember>, StorageError> {
        let state = self.state.lock().await;
        let cluster = state
            .clusters
            .get(&cluster_id)
            .ok_or_else(|| StorageError::NotFound(format!("cluster {cluster_id}")))?;

        Ok(cluster
            .members
            .iter()
            .filter_map(|key| {
                state.records.get(key).map(|record| ClusterMember {
                    global_id: record.global_id,
                    source_id: key.0.clone(),
                    local_id: key.1.clone(),
                    payload: record.payload.clone(),
                })
            })
            .collect())
    }

    async fn cluster_match_values(&self, cluster_id: Uuid) -> Result<Vec<String>, StorageError> {
        let state = self.state.lock().await;
        let cluster = state
            .clusters
            .get(&cluster_id)
            .ok_or_else(|| StorageError::NotFound(format!("cluster {cluster_id}")))?;

        let values: BTreeSet<String> = cluster
            .members
            .iter()
            .filter_map(|key| state.records.get(key))
            .flat_map(|record| record.values.iter().map(|(_, value)| value.clone()))
            .collect();
        Ok(values.into_iter().collect())
    }
}

/// In-memory [`JobStore`]
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, HarvestJobState>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, id: &str, config: HarvestConfig) -> Result<HarvestJobState, StorageError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(id) {
            return Err(StorageError::Conflict(format!("harvest job {id} already exists")));
        }
        let state = HarvestJobState::new(id, config);
        jobs.insert(id.to_string(), state.clone());
        Ok(state)
    }

    async fn get(&self, id: &str) -> Result<Option<HarvestJobState>, StorageError> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<HarvestJobState>, StorageError> {
        let mut jobs: Vec<_> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }

    async fn update_config(&self, id: &str, config: HarvestConfig) -> Result<HarvestJobState, StorageError> {
        let mut jobs = self.jobs.write().await;
        let state = jobs
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("harvest job {id}")))?;
        state.config = config;
        Ok(state.clone())
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.jobs.write().await.remove(id).is_some())
    }

    async fn save_state(&self, state: &HarvestJobState) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs
            .get_mut(&state.id)
            .ok_or_else(|| StorageError::NotFound(format!("harvest job {}", state.id)))?;
        let stop = stored.stop;
        *stored = state.clone();
        stored.stop = stop;
        Ok(())
    }

    async fn set_stop(&self, id: &str, stop: bool) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("harvest job {id}")))?;
        stored.stop = stop;
        Ok(())
    }

    async fn stop_requested(&self, id: &str) -> Result<bool, StorageError> {
        let jobs = self.jobs.read().await;
        jobs.get(id)
            .map(|state| state.stop)
            .ok_or_else(|| StorageError::NotFound(format!("harvest job {id}")))
    }
}

type TransformFn = dyn Fn(Value) -> Result<Value, TransformError> + Send + Sync;

/// [`Transform`] backed by a closure
pub struct JsonTransform {
    func: Box<TransformFn>,
}

impl JsonTransform {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(Value) -> Result<Value, TransformError> + Send + Sync + 'static,
    {
        Self { func: Box::new(func) }
    }
}

#[async_trait]
impl Transform for JsonTransform {
    async fn execute(&self, cluster: Value) -> Result<Value, TransformError> {
        (self.func)(cluster)
    }
}
