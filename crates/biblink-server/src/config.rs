//! Configuration management

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::matchkey::ScriptLimits;

// ============================================================================
// Harvest Configuration Constants
// ============================================================================

/// Default connect timeout for feed requests in seconds.
///
/// Applies to the connect phase only; a slow feed body is never cut off.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default maximum number of export items rendered concurrently.
pub const DEFAULT_EXPORT_MAX_IN_FLIGHT: usize = 5;

/// Default OAI identifier prefix for exported clusters.
pub const DEFAULT_OAI_ID_PREFIX: &str = "oai:";

/// Default wall-clock budget for one script match key evaluation.
pub const DEFAULT_SCRIPT_TIMEOUT_MS: u64 = 5000;

/// Default loop iteration limit inside match key scripts.
pub const DEFAULT_SCRIPT_LOOP_LIMIT: u64 = 1_000_000;

/// Default User-Agent sent to feeds.
pub fn default_user_agent() -> String {
    format!("biblink-harvester/{}", env!("CARGO_PKG_VERSION"))
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub harvest: HarvestSettings,
    pub export: ExportSettings,
    pub match_key: MatchKeySettings,
}

/// Outbound feed client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestSettings {
    pub user_agent: String,
    pub connect_timeout_secs: u64,
}

/// Cluster export settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSettings {
    pub max_in_flight: usize,
    pub identifier_prefix: String,
}

/// Match key script sandbox settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchKeySettings {
    pub script_timeout_ms: u64,
    pub script_loop_limit: u64,
}

impl MatchKeySettings {
    pub fn limits(&self) -> ScriptLimits {
        ScriptLimits {
            timeout: Duration::from_millis(self.script_timeout_ms),
            loop_iteration_limit: self.script_loop_limit,
        }
    }
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            harvest: HarvestSettings {
                user_agent: std::env::var("BIBLINK_USER_AGENT")
                    .unwrap_or_else(|_| default_user_agent()),
                connect_timeout_secs: env_parse(
                    "BIBLINK_CONNECT_TIMEOUT_SECS",
                    DEFAULT_CONNECT_TIMEOUT_SECS,
                ),
            },
            export: ExportSettings {
                max_in_flight: env_parse("BIBLINK_EXPORT_MAX_IN_FLIGHT", DEFAULT_EXPORT_MAX_IN_FLIGHT),
                identifier_prefix: std::env::var("BIBLINK_OAI_ID_PREFIX")
                    .unwrap_or_else(|_| DEFAULT_OAI_ID_PREFIX.to_string()),
            },
            match_key: MatchKeySettings {
                script_timeout_ms: env_parse("BIBLINK_SCRIPT_TIMEOUT_MS", DEFAULT_SCRIPT_TIMEOUT_MS),
                script_loop_limit: env_parse("BIBLINK_SCRIPT_LOOP_LIMIT", DEFAULT_SCRIPT_LOOP_LIMIT),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.harvest.user_agent.trim().is_empty() {
            anyhow::bail!("User agent cannot be empty");
        }

        if self.harvest.connect_timeout_secs == 0 {
            anyhow::bail!("Connect timeout must be greater than 0");
        }

        if self.export.max_in_flight == 0 {
            anyhow::bail!("Export max_in_flight must be greater than 0");
        }

        if self.match_key.script_timeout_ms == 0 {
            anyhow::bail!("Script timeout must be greater than 0");
        }

        if self.match_key.script_loop_limit == 0 {
            tracing::warn!("Script loop limit is 0 - scripts with loops will always fail");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            harvest: HarvestSettings {
                user_agent: default_user_agent(),
                connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            },
            export: ExportSettings {
                max_in_flight: DEFAULT_EXPORT_MAX_IN_FLIGHT,
                identifier_prefix: DEFAULT_OAI_ID_PREFIX.to_string(),
            },
            match_key: MatchKeySettings {
                script_timeout_ms: DEFAULT_SCRIPT_TIMEOUT_MS,
                script_loop_limit: DEFAULT_SCRIPT_LOOP_LIMIT,
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.export.max_in_flight, 5);
        assert!(config.harvest.user_agent.starts_with("biblink-harvester/"));
    }

    #[test]
    fn test_zero_in_flight_is_rejected() {
        let mut config = Config::default();
        config.export.max_in_flight = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_script_timeout_is_rejected() {
        let mut config = Config::default();
        config.match_key.script_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_limits() {
        let limits = Config::default().match_key.limits();
        assert_eq!(limits.timeout, Duration::from_millis(DEFAULT_SCRIPT_TIMEOUT_MS));
        assert_eq!(limits.loop_iteration_limit, DEFAULT_SCRIPT_LOOP_LIMIT);
    }
}
