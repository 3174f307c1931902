//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("missing required configuration: {field} ({hint})")]
    Missing { field: String, hint: String },
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field: field.into(), reason: reason.into() }
}

fn check_unit(field: &str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(field, "must be between 0.0 and 1.0"));
    }
    Ok(())
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `fallback.timeout_ms` is under 100ms or exceeds 5 minutes
    /// - `fallback.max_retries` exceeds 5
    /// - `breaker.failure_threshold` is 0
    /// - `replication.critical_lag_ms` is below `replication.warn_lag_ms`
    /// - a policy threshold falls outside `[0.0, 1.0]`
    /// - `degraded_response` or `edge_region` is empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fallback.timeout_ms < 100 {
            return Err(invalid("fallback.timeout_ms", "must be at least 100ms"));
        }
        if self.fallback.timeout_ms > 300_000 {
            return Err(invalid("fallback.timeout_ms", "must not exceed 5 minutes (300000ms)"));
        }
        if self.fallback.max_retries > 5 {
            return Err(invalid("fallback.max_retries", "must not exceed 5"));
        }

        if self.purge_interval_secs == 0 {
            return Err(invalid("purge_interval_secs", "must be greater than 0"));
        }

        if self.extraction_timeout_ms == 0 {
            return Err(invalid("extraction_timeout_ms", "must be greater than 0"));
        }

        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold", "must be greater than 0"));
        }
        if self.breaker.window_ms == 0 {
            return Err(invalid("breaker.window_ms", "must be greater than 0"));
        }

        if self.replication.poll_interval_ms == 0 {
            return Err(invalid("replication.poll_interval_ms", "must be greater than 0"));
        }
        if self.replication.batch_size == 0 {
            return Err(invalid("replication.batch_size", "must be greater than 0"));
        }
        if self.replication.critical_lag_ms < self.replication.warn_lag_ms {
            return Err(invalid("replication.critical_lag_ms", "must not be below replication.warn_lag_ms"));
        }
        if self.replication.critical_lag_ms <= self.replication.poll_interval_ms {
            return Err(invalid("replication.critical_lag_ms", "must exceed replication.poll_interval_ms"));
        }

        check_unit("policy.max_sensitive_data", self.policy.max_sensitive_data)?;
        check_unit("policy.min_genericness", self.policy.min_genericness)?;
        check_unit("policy.min_actionability", self.policy.min_actionability)?;
        check_unit("policy.min_safety", self.policy.min_safety)?;

        if self.degraded_response.trim().is_empty() {
            return Err(invalid("degraded_response", "must not be empty"));
        }
        if self.edge_region.is_empty() {
            return Err(invalid("edge_region", "must not be empty"));
        }

        for (i, provider) in self.providers.iter().enumerate() {
            if provider.id.is_empty() || provider.endpoint.is_empty() {
                return Err(ConfigError::Invalid {
                    field: format!("providers[{i}]"),
                    reason: "id and endpoint must not be empty".into(),
                });
            }
        }

        if self.normalizer == crate::config::NormalizerKind::Identity && !self.rules.is_empty() {
            tracing::warn!(
                rule_count = self.rules.len(),
                "normalization rules are configured but the identity normalizer is selected; rules are ignored"
            );
        }

        Ok(())
    }
}
