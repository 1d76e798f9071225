use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use super::StorageError;
use crate::harvest::{HarvestConfig, HarvestJobState};
use crate::matchkey::MatchKeyConfig;

/// Canonical ingestion payload for one harvested record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRecord {
    pub local_id: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub delete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl IngestRecord {
    pub fn deleted(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            delete: true,
            payload: None,
        }
    }

    /// Upsert carrying a MARC-in-JSON document under `payload.marc`
    pub fn marc(local_id: impl Into<String>, marc: Value) -> Self {
        Self {
            local_id: local_id.into(),
            delete: false,
            payload: Some(json!({ "marc": marc })),
        }
    }
}

/// One source record inside a cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMember {
    pub global_id: Uuid,
    pub local_id: String,
    pub source_id: String,
    pub payload: Value,
}

/// Record and cluster storage
#[async_trait]
pub trait Storage: Send + Sync {
    /// Idempotent upsert (or delete) keyed by `(source_id, local_id)`
    ///
    /// Cluster membership is recomputed against `match_keys`.
    async fn ingest(
        &self,
        source_id: &str,
        record: IngestRecord,
        match_keys: &[MatchKeyConfig],
    ) -> Result<(), StorageError>;

    /// Match keys currently configured
    async fn match_key_configs(&self) -> Result<Vec<MatchKeyConfig>, StorageError>;

    /// Members of a cluster; empty once every member is deleted
    async fn cluster_members(&self, cluster_id: Uuid) -> Result<Vec<ClusterMember>, StorageError>;

    /// Distinct match values that hold a cluster together
    async fn cluster_match_values(&self, cluster_id: Uuid) -> Result<Vec<String>, StorageError>;
}

#[derive(Error, Debug, Clone)]
#[error("Transform failed: {0}")]
pub struct TransformError(pub String);

/// External cluster-to-record transform
#[async_trait]
pub trait Transform: Send + Sync {
    /// Turn a cluster document into a MARC-in-JSON record
    async fn execute(&self, cluster: Value) -> Result<Value, TransformError>;
}

/// Persistence of harvest jobs
///
/// The stop flag is owned by [`set_stop`](Self::set_stop): `save_state` never
/// overwrites it, so a stop request cannot be lost to a concurrent save.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, id: &str, config: HarvestConfig) -> Result<HarvestJobState, StorageError>;

    async fn get(&self, id: &str) -> Result<Option<HarvestJobState>, StorageError>;

    async fn list(&self) -> Result<Vec<HarvestJobState>, StorageError>;

    async fn update_config(&self, id: &str, config: HarvestConfig) -> Result<HarvestJobState, StorageError>;

    async fn delete(&self, id: &str) -> Result<bool, StorageError>;

    async fn save_state(&self, state: &HarvestJobState) -> Result<(), StorageError>;

    async fn set_stop(&self, id: &str, stop: bool) -> Result<(), StorageError>;

    async fn stop_requested(&self, id: &str) -> Result<bool, StorageError>;
}
