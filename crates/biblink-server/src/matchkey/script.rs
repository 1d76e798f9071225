//! JavaScript match keys
//!
//! The script must evaluate to a function. It is called with the payload as
//! a JSON string and its result is read as keys: a number gives its integer
//! text, a string gives itself, an array is read element by element, and
//! anything else gives nothing.
//!
//! `boa_engine::Context` cannot leave its thread, so each compiled script
//! owns a worker thread holding the context. Evaluations are sent over a
//! channel and the caller awaits the reply with a timeout; runaway loops
//! inside the worker are cut off by the engine's loop iteration limit.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use boa_engine::object::builtins::JsArray;
use boa_engine::{Context, JsObject, JsResult, JsString, JsValue, Source};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::MatchKeyError;

/// Resource bounds for script evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptLimits {
    pub timeout: Duration,
    pub loop_iteration_limit: u64,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(crate::config::DEFAULT_SCRIPT_TIMEOUT_MS),
            loop_iteration_limit: crate::config::DEFAULT_SCRIPT_LOOP_LIMIT,
        }
    }
}

const RECURSION_LIMIT: usize = 512;

struct Evaluation {
    payload: String,
    reply: oneshot::Sender<Result<Vec<String>, String>>,
}

/// Compiled script match key
pub struct ScriptKey {
    requests: mpsc::Sender<Evaluation>,
    timeout: Duration,
}

impl std::fmt::Debug for ScriptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptKey")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ScriptKey {
    pub async fn configure(params: &Value, limits: ScriptLimits) -> Result<Self, MatchKeyError> {
        let script = params.get("script").and_then(Value::as_str);
        let filename = params.get("filename").and_then(Value::as_str);

        let source = match (script, filename) {
            (Some(script), None) => script.to_string(),
            (None, Some(filename)) => {
                tokio::fs::read_to_string(PathBuf::from(filename))
                    .await
                    .map_err(|e| {
                        MatchKeyError::Configuration(format!("script: {filename}: {e}"))
                    })?
            },
            (Some(_), Some(_)) => {
                return Err(MatchKeyError::Configuration(
                    "script: only one of filename or script may be given".to_string(),
                ))
            },
            (None, None) => {
                return Err(MatchKeyError::Configuration(
                    "script: filename or script must be given".to_string(),
                ))
            },
        };

        let (requests, inbox) = mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("matchkey-script".to_string())
            .spawn(move || worker(source, limits, ready_tx, inbox))
            .map_err(|e| MatchKeyError::Configuration(format!("script: worker: {e}")))?;

        let ready = tokio::time::timeout(limits.timeout, ready_rx)
            .await
            .map_err(|_| MatchKeyError::Configuration("script: compile timed out".to_string()))?
            .map_err(|_| MatchKeyError::Configuration("script: worker exited".to_string()))?;
        ready.map_err(|e| MatchKeyError::Configuration(format!("script: {e}")))?;

        Ok(Self {
            requests,
            timeout: limits.timeout,
        })
    }

    pub async fn keys(&self, payload: &Value, keys: &mut BTreeSet<String>) -> Result<(), MatchKeyError> {
        let payload = serde_json::to_string(payload)
            .map_err(|e| MatchKeyError::Evaluation(e.to_string()))?;
        let (reply, response) = oneshot::channel();

        self.requests
            .send(Evaluation { payload, reply })
            .map_err(|_| MatchKeyError::Evaluation("script worker is gone".to_string()))?;

        let values = tokio::time::timeout(self.timeout, response)
            .await
            .map_err(|_| {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "match key script timed out");
                MatchKeyError::Evaluation("script timed out".to_string())
            })?
            .map_err(|_| MatchKeyError::Evaluation("script worker is gone".to_string()))?
            .map_err(MatchKeyError::Evaluation)?;

        keys.extend(values);
        Ok(())
    }
}

fn worker(
    source: String,
    limits: ScriptLimits,
    ready: oneshot::Sender<Result<(), String>>,
    inbox: mpsc::Receiver<Evaluation>,
) {
    let mut context = Context::default();
    context
        .runtime_limits_mut()
        .set_loop_iteration_limit(limits.loop_iteration_limit);
    context.runtime_limits_mut().set_recursion_limit(RECURSION_LIMIT);

    let function = match compile(&source, &mut context) {
        Ok(function) => function,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        },
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    // Ends when the owning ScriptKey is dropped
    while let Ok(Evaluation { payload, reply }) = inbox.recv() {
        let result = call(&function, &payload, &mut context).map_err(|e| e.to_string());
        let _ = reply.send(result);
    }
    debug!("match key script worker stopped");
}

fn compile(source: &str, context: &mut Context) -> Result<JsObject, String> {
    let value = context
        .eval(Source::from_bytes(source.as_bytes()))
        .map_err(|e| e.to_string())?;
    value
        .as_callable()
        .cloned()
        .ok_or_else(|| "script must evaluate to a function".to_string())
}

fn call(function: &JsObject, payload: &str, context: &mut Context) -> JsResult<Vec<String>> {
    let argument = JsValue::from(JsString::from(payload));
    let result = function.call(&JsValue::undefined(), &[argument], context)?;
    let mut keys = Vec::new();
    collect(&result, context, &mut keys)?;
    Ok(keys)
}

fn collect(value: &JsValue, context: &mut Context, keys: &mut Vec<String>) -> JsResult<()> {
    if let Some(number) = value.as_number() {
        keys.push((number as i64).to_string());
    } else if let Some(string) = value.as_string() {
        keys.push(string.to_std_string_escaped());
    } else if let Some(object) = value.as_object() {
        if object.is_array() {
            let array = JsArray::from_object(object.clone())?;
            let length = array.length(context)?;
            for index in 0..length {
                let element = array.get(index, context)?;
                collect(&element, context, keys)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    async fn keys(script: &str, payload: Value) -> BTreeSet<String> {
        let key = ScriptKey::configure(&json!({ "script": script }), ScriptLimits::default())
            .await
            .unwrap();
        let mut keys = BTreeSet::new();
        key.keys(&payload, &mut keys).await.unwrap();
        keys
    }

    #[tokio::test]
    async fn test_number_result() {
        let result = keys("x => JSON.parse(x).id + 1", json!({"id": 2})).await;
        assert_eq!(result, BTreeSet::from(["3".to_string()]));
    }

    #[tokio::test]
    async fn test_number_is_truncated_to_integer() {
        let result = keys("x => 2.75", json!({})).await;
        assert_eq!(result, BTreeSet::from(["2".to_string()]));
    }

    #[tokio::test]
    async fn test_boolean_result_is_empty() {
        assert!(keys("x => true", json!({"id": 2})).await.is_empty());
    }

    #[tokio::test]
    async fn test_array_result() {
        let result = keys(
            "x => { const r = JSON.parse(x); return [r.a, r.b, true, [r.c]]; }",
            json!({"a": "one", "b": 2, "c": "three"}),
        )
        .await;
        assert_eq!(
            result,
            BTreeSet::from(["one".to_string(), "2".to_string(), "three".to_string()])
        );
    }

    #[tokio::test]
    async fn test_missing_source() {
        let err = ScriptKey::configure(&json!({}), ScriptLimits::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "script: filename or script must be given");
    }

    #[tokio::test]
    async fn test_missing_file_names_the_file() {
        let err = ScriptKey::configure(
            &json!({"filename": "/nonexistent/key.js"}),
            ScriptLimits::default(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/key.js"));
    }

    #[tokio::test]
    async fn test_script_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "x => JSON.parse(x).title.toUpperCase()").unwrap();

        let key = ScriptKey::configure(
            &json!({"filename": file.path().to_str().unwrap()}),
            ScriptLimits::default(),
        )
        .await
        .unwrap();
        let mut keys = BTreeSet::new();
        key.keys(&json!({"title": "dune"}), &mut keys).await.unwrap();
        assert_eq!(keys, BTreeSet::from(["DUNE".to_string()]));
    }

    #[tokio::test]
    async fn test_syntax_error_fails_configuration() {
        let err = ScriptKey::configure(&json!({"script": "x => {"}), ScriptLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MatchKeyError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_non_function_fails_configuration() {
        let err = ScriptKey::configure(&json!({"script": "42"}), ScriptLimits::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("function"));
    }

    #[tokio::test]
    async fn test_runaway_loop_is_stopped() {
        let limits = ScriptLimits {
            timeout: Duration::from_secs(5),
            loop_iteration_limit: 1000,
        };
        let key = ScriptKey::configure(&json!({"script": "x => { while (true) {} }"}), limits)
            .await
            .unwrap();
        let mut keys = BTreeSet::new();
        let err = key.keys(&json!({}), &mut keys).await.unwrap_err();
        assert!(matches!(err, MatchKeyError::Evaluation(_)));
    }

    #[tokio::test]
    async fn test_thrown_error_is_evaluation_error() {
        let key = ScriptKey::configure(
            &json!({"script": "x => { throw new Error('nope'); }"}),
            ScriptLimits::default(),
        )
        .await
        .unwrap();
        let mut keys = BTreeSet::new();
        let err = key.keys(&json!({}), &mut keys).await.unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
