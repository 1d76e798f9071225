//! Match keys
//!
//! A match key turns an ingested payload into a set of strings; records that
//! share a string end up in the same cluster. Two strategies exist:
//!
//! - `jsonpath`: `{"expr": "$.marc.fields[*]['020'].subfields[*].a"}`
//! - `script`: `{"script": "x => JSON.parse(x).id"}` or `{"filename": "key.js"}`
//!
//! Strategies are compiled through [`MatchKeyEngine`], which caches each
//! distinct `(method, params)` pair and compiles it once even when several
//! tasks ask for it at the same time.

mod engine;
mod jsonpath;
mod script;

pub use engine::{MatchKeyEngine, MatchKeyStrategy};
pub use jsonpath::JsonPathKey;
pub use script::{ScriptKey, ScriptLimits};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Match key failures; `Clone` so one compile outcome can reach every waiter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchKeyError {
    #[error("unknown match key method `{0}`")]
    UnknownMethod(String),

    #[error("{0}")]
    Configuration(String),

    #[error("Match key evaluation failed: {0}")]
    Evaluation(String),
}

/// When a key is recomputed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePolicy {
    /// On every ingest
    #[default]
    Ingest,
    /// Only on explicit request
    Manual,
}

/// Stored match key definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchKeyConfig {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub update: UpdatePolicy,
}

impl MatchKeyConfig {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
            update: UpdatePolicy::Ingest,
        }
    }
}

/// Known strategy kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchKeyMethod {
    JsonPath,
    Script,
}

impl MatchKeyMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchKeyMethod::JsonPath => "jsonpath",
            MatchKeyMethod::Script => "script",
        }
    }
}

impl fmt::Display for MatchKeyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchKeyMethod {
    type Err = MatchKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "jsonpath" => Ok(MatchKeyMethod::JsonPath),
            "script" | "javascript" => Ok(MatchKeyMethod::Script),
            other => Err(MatchKeyError::UnknownMethod(other.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_method_from_str() {
        assert_eq!("jsonpath".parse::<MatchKeyMethod>().unwrap(), MatchKeyMethod::JsonPath);
        assert_eq!("javascript".parse::<MatchKeyMethod>().unwrap(), MatchKeyMethod::Script);
        let err = "xpath".parse::<MatchKeyMethod>().unwrap_err();
        assert_eq!(err.to_string(), "unknown match key method `xpath`");
    }

    #[test]
    fn test_config_deserializes_with_default_policy() {
        let config: MatchKeyConfig = serde_json::from_value(json!({
            "id": "isbn",
            "method": "jsonpath",
            "params": {"expr": "$.isbn"}
        }))
        .unwrap();
        assert_eq!(config.update, UpdatePolicy::Ingest);

        let manual: MatchKeyConfig = serde_json::from_value(json!({
            "id": "title", "method": "script", "params": {}, "update": "manual"
        }))
        .unwrap();
        assert_eq!(manual.update, UpdatePolicy::Manual);
    }
}
