//! Compiled strategy cache
//!
//! Entries are keyed by method and the canonical JSON text of the params.
//! Each entry is a `OnceCell`: the first caller runs the compile, callers
//! arriving meanwhile wait on the same cell and receive the same result. A
//! failed compile is handed to every waiter and then evicted so a corrected
//! file or a transient failure can be retried.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{JsonPathKey, MatchKeyConfig, MatchKeyError, MatchKeyMethod, ScriptKey, ScriptLimits};

type CacheKey = (MatchKeyMethod, String);
type CompileResult = Result<Arc<MatchKeyStrategy>, MatchKeyError>;
type Slot = Arc<OnceCell<CompileResult>>;

static GLOBAL: LazyLock<Arc<MatchKeyEngine>> =
    LazyLock::new(|| Arc::new(MatchKeyEngine::new(ScriptLimits::default())));

/// A compiled match key
#[derive(Debug)]
pub enum MatchKeyStrategy {
    JsonPath(JsonPathKey),
    Script(ScriptKey),
}

impl MatchKeyStrategy {
    pub fn method(&self) -> MatchKeyMethod {
        match self {
            MatchKeyStrategy::JsonPath(_) => MatchKeyMethod::JsonPath,
            MatchKeyStrategy::Script(_) => MatchKeyMethod::Script,
        }
    }

    /// Add the keys for `payload` to `keys`
    pub async fn keys(&self, payload: &Value, keys: &mut BTreeSet<String>) -> Result<(), MatchKeyError> {
        match self {
            MatchKeyStrategy::JsonPath(key) => {
                key.keys(payload, keys);
                Ok(())
            },
            MatchKeyStrategy::Script(key) => key.keys(payload, keys).await,
        }
    }
}

pub struct MatchKeyEngine {
    cache: Mutex<HashMap<CacheKey, Slot>>,
    limits: ScriptLimits,
    compiles: AtomicUsize,
}

impl MatchKeyEngine {
    pub fn new(limits: ScriptLimits) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            limits,
            compiles: AtomicUsize::new(0),
        }
    }

    /// Process-wide engine with default limits
    pub fn global() -> Arc<MatchKeyEngine> {
        GLOBAL.clone()
    }

    /// Compile, or fetch from cache, the strategy for `method` and `params`
    pub async fn configure(&self, method: &str, params: &Value) -> CompileResult {
        let method: MatchKeyMethod = method.parse()?;
        let canonical = serde_json::to_string(params)
            .map_err(|e| MatchKeyError::Configuration(e.to_string()))?;
        let key = (method, canonical);

        let slot = {
            let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            cache.entry(key.clone()).or_default().clone()
        };

        let result = slot
            .get_or_init(|| self.compile(method, params))
            .await
            .clone();

        if result.is_err() {
            let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            if cache.get(&key).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                cache.remove(&key);
            }
        }

        result
    }

    /// Keys for `payload` under `config`
    pub async fn evaluate(
        &self,
        config: &MatchKeyConfig,
        payload: &Value,
    ) -> Result<BTreeSet<String>, MatchKeyError> {
        let strategy = self.configure(&config.method, &config.params).await?;
        let mut keys = BTreeSet::new();
        strategy.keys(payload, &mut keys).await?;
        Ok(keys)
    }

    /// Number of compiles performed, cached or not
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::Relaxed)
    }

    /// Number of cached entries, including in-progress ones
    pub fn cached(&self) -> usize {
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    async fn compile(&self, method: MatchKeyMethod, params: &Value) -> CompileResult {
        self.compiles.fetch_add(1, Ordering::Relaxed);
        debug!(%method, "compiling match key");

        let strategy = match method {
            MatchKeyMethod::JsonPath => MatchKeyStrategy::JsonPath(JsonPathKey::configure(params)?),
            MatchKeyMethod::Script => {
                MatchKeyStrategy::Script(ScriptKey::configure(params, self.limits).await?)
            },
        };

        info!(%method, "match key compiled");
        Ok(Arc::new(strategy))
    }
}

impl Default for MatchKeyEngine {
    fn default() -> Self {
        Self::new(ScriptLimits::default())
    }
}
