//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (VETCACHE_*)
//! 2. TOML config file (if VETCACHE_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Which normalizer the serving path uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizerKind {
    /// Exact-match keys.
    #[default]
    Identity,
    /// Ordered regex rules over cleaned text.
    Rules,
}

/// One `pattern -> key` normalization rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub pattern: String,
    pub key: String,
}

/// One named entity pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPatternConfig {
    pub name: String,
    pub pattern: String,
}

/// A generative backend provider, tried in list order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Fallback invoker budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Per-call timeout in milliseconds.
    #[serde(default = "default_fallback_timeout_ms")]
    pub timeout_ms: u64,
    /// Retries per provider for transient and rate-limited errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff between retries in milliseconds (multiplied by the attempt number).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_fallback_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl FallbackConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Per-provider circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Failures only count as consecutive when they fall inside this window.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// How long an open circuit short-circuits calls.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_ms: default_window_ms(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl BreakerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Replication polling and staleness bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Lag above this is logged.
    #[serde(default = "default_warn_lag_ms")]
    pub warn_lag_ms: u64,
    /// Lag above this marks the replica unhealthy.
    #[serde(default = "default_critical_lag_ms")]
    pub critical_lag_ms: u64,
    /// Maximum feed rows applied per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            warn_lag_ms: default_warn_lag_ms(),
            critical_lag_ms: default_critical_lag_ms(),
            batch_size: default_batch_size(),
        }
    }
}

impl ReplicationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn warn_lag(&self) -> Duration {
        Duration::from_millis(self.warn_lag_ms)
    }

    pub fn critical_lag(&self) -> Duration {
        Duration::from_millis(self.critical_lag_ms)
    }
}

/// Thresholds every policy sub-score must clear for an automatic commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyThresholds {
    #[serde(default = "default_max_sensitive_data")]
    pub max_sensitive_data: f64,
    #[serde(default = "default_min_genericness")]
    pub min_genericness: f64,
    #[serde(default = "default_min_actionability")]
    pub min_actionability: f64,
    #[serde(default = "default_min_safety")]
    pub min_safety: f64,
}

impl Default for PolicyThresholds {
    fn default() -> Self {
        Self {
            max_sensitive_data: default_max_sensitive_data(),
            min_genericness: default_min_genericness(),
            min_actionability: default_min_actionability(),
            min_safety: default_min_safety(),
        }
    }
}

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (VETCACHE_*)
/// 2. TOML config file (if VETCACHE_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to the authoritative SQLite store.
    ///
    /// Set via VETCACHE_DB_PATH environment variable.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Edge region whose replica backs tier 0 in this process.
    ///
    /// Set via VETCACHE_EDGE_REGION environment variable.
    #[serde(default = "default_edge_region")]
    pub edge_region: String,

    /// Normalizer variant. Identity unless the operator opts in.
    #[serde(default)]
    pub normalizer: NormalizerKind,

    /// Ordered rules for the rule-based normalizer.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Named entity patterns. Empty means no extraction.
    #[serde(default)]
    pub entities: Vec<EntityPatternConfig>,

    /// Latency budget for entity extraction in milliseconds.
    #[serde(default = "default_extraction_timeout_ms")]
    pub extraction_timeout_ms: u64,

    /// Text served when every fallback path failed.
    #[serde(default = "default_degraded_response")]
    pub degraded_response: String,

    #[serde(default)]
    pub fallback: FallbackConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Backend providers in priority order.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub policy: PolicyThresholds,

    /// Grace period before an invalidated entry is physically removed.
    #[serde(default = "default_invalidation_grace_secs")]
    pub invalidation_grace_secs: u64,

    /// How often invalidated entries past their grace period are removed.
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./vetcache.sqlite")
}

fn default_edge_region() -> String {
    "local".into()
}

fn default_extraction_timeout_ms() -> u64 {
    50
}

fn default_degraded_response() -> String {
    "We're unable to answer that right now. Please try again shortly.".into()
}

fn default_fallback_timeout_ms() -> u64 {
    20_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_window_ms() -> u64 {
    30_000
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_warn_lag_ms() -> u64 {
    5_000
}

fn default_critical_lag_ms() -> u64 {
    30_000
}

fn default_batch_size() -> u32 {
    500
}

fn default_max_sensitive_data() -> f64 {
    0.1
}

fn default_min_genericness() -> f64 {
    0.7
}

fn default_min_actionability() -> f64 {
    0.6
}

fn default_min_safety() -> f64 {
    0.9
}

fn default_invalidation_grace_secs() -> u64 {
    300
}

fn default_purge_interval_secs() -> u64 {
    60
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            edge_region: default_edge_region(),
            normalizer: NormalizerKind::default(),
            rules: Vec::new(),
            entities: Vec::new(),
            extraction_timeout_ms: default_extraction_timeout_ms(),
            degraded_response: default_degraded_response(),
            fallback: FallbackConfig::default(),
            breaker: BreakerConfig::default(),
            providers: Vec::new(),
            replication: ReplicationConfig::default(),
            policy: PolicyThresholds::default(),
            invalidation_grace_secs: default_invalidation_grace_secs(),
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

impl AppConfig {
    /// Extraction budget as Duration for use with tokio.
    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_millis(self.extraction_timeout_ms)
    }

    pub fn invalidation_grace(&self) -> Duration {
        Duration::from_secs(self.invalidation_grace_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `VETCACHE_` (nested keys split on `__`)
    /// 2. TOML file from `VETCACHE_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("VETCACHE_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("VETCACHE_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// At least one provider is needed before the fallback tier can serve.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if no provider is configured.
    pub fn require_providers(&self) -> Result<&[ProviderConfig], ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::Missing {
                field: "providers".into(),
                hint: "Add [[providers]] entries to the file named by VETCACHE_CONFIG_FILE".into(),
            });
        }
        Ok(&self.providers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.db_path, PathBuf::from("./vetcache.sqlite"));
        assert_eq!(config.edge_region, "local");
        assert_eq!(config.normalizer, NormalizerKind::Identity);
        assert!(config.rules.is_empty());
        assert!(config.entities.is_empty());
        assert_eq!(config.fallback.max_retries, 2);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.replication.critical_lag_ms, 30_000);
        assert_eq!(config.invalidation_grace_secs, 300);
    }

    #[test]
    fn test_durations() {
        let config = AppConfig::default();
        assert_eq!(config.extraction_timeout(), Duration::from_millis(50));
        assert_eq!(config.fallback.timeout(), Duration::from_millis(20_000));
        assert_eq!(config.breaker.cooldown(), Duration::from_millis(30_000));
        assert_eq!(config.replication.warn_lag(), Duration::from_millis(5_000));
        assert_eq!(config.replication.critical_lag(), Duration::from_millis(30_000));
        assert_eq!(config.invalidation_grace(), Duration::from_secs(300));
    }

    #[test]
    fn test_require_providers_missing() {
        let config = AppConfig::default();
        assert!(matches!(config.require_providers(), Err(ConfigError::Missing { .. })));
    }

    #[test]
    fn test_require_providers_present() {
        let config = AppConfig {
            providers: vec![ProviderConfig {
                id: "primary".into(),
                endpoint: "https://llm.internal/v1/generate".into(),
                api_key: None,
                model: None,
            }],
            ..Default::default()
        };
        assert_eq!(config.require_providers().unwrap().len(), 1);
    }

    #[test]
    fn test_toml_layer() {
        let toml = r#"
            normalizer = "rules"
            edge_region = "eu-west"

            [[rules]]
            pattern = "^cancel (my )?order"
            key = "cancel_order"

            [breaker]
            failure_threshold = 3
        "#;
        let config: AppConfig = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string(toml))
            .extract()
            .unwrap();
        assert_eq!(config.normalizer, NormalizerKind::Rules);
        assert_eq!(config.edge_region, "eu-west");
        assert_eq!(config.rules[0].key, "cancel_order");
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.cooldown_ms, 30_000);
    }
}
