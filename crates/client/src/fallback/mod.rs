//! Fallback invocation across ordered providers.
//!
//! ### Behavior
//!
//! - **Timeout**: every attempt runs under the configured per-call budget; an
//!   elapsed budget counts as a transient failure.
//! - **Retries**: transient and rate-limited failures are retried on the same
//!   provider with linear backoff (`retry_backoff * attempt`); other failures
//!   move straight to the next provider.
//! - **Failover**: providers are tried in priority order.
//! - **Circuit breaking**: each provider has its own breaker. A provider whose
//!   circuit is open is skipped; when every circuit is open the invoker fails
//!   immediately with [`FallbackError::AllCircuitsOpen`].

pub mod breaker;

pub use breaker::{CallPermit, CircuitBreaker, CircuitState};

use std::sync::Arc;
use std::time::Duration;

use vetcache_core::config::{BreakerConfig, FallbackConfig};

use crate::backend::{Backend, BackendError, CallOptions};

/// Why the fallback path produced no answer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FallbackError {
    #[error("every provider circuit is open")]
    AllCircuitsOpen,

    #[error("no backend providers configured")]
    NoProviders,

    #[error("provider {provider} failed: {source}")]
    Exhausted { provider: String, source: BackendError },

    #[error("fallback call aborted: {0}")]
    Aborted(String),
}

struct Provider {
    backend: Arc<dyn Backend>,
    breaker: CircuitBreaker,
}

/// Calls providers in order under timeout, retry and breaker rules.
pub struct FallbackInvoker {
    providers: Vec<Provider>,
    timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
    options: CallOptions,
}

impl FallbackInvoker {
    pub fn new(backends: Vec<Arc<dyn Backend>>, fallback: &FallbackConfig, breaker: &BreakerConfig) -> Self {
        let providers = backends
            .into_iter()
            .map(|backend| Provider { backend, breaker: CircuitBreaker::new(breaker) })
            .collect();
        Self {
            providers,
            timeout: fallback.timeout(),
            max_retries: fallback.max_retries,
            retry_backoff: fallback.retry_backoff(),
            options: CallOptions::default(),
        }
    }

    /// Breaker state per provider id, in priority order.
    pub fn circuit_states(&self) -> Vec<(String, CircuitState)> {
        self.providers
            .iter()
            .map(|p| (p.backend.id().to_string(), p.breaker.state()))
            .collect()
    }

    /// Produce an answer for `raw_text` from the first provider that succeeds.
    pub async fn invoke(&self, raw_text: &str) -> Result<String, FallbackError> {
        if self.providers.is_empty() {
            return Err(FallbackError::NoProviders);
        }

        let mut last_error = None;
        for provider in &self.providers {
            let id = provider.backend.id();
            let Some(permit) = provider.breaker.try_acquire() else {
                tracing::debug!(provider = id, "circuit open; skipping provider");
                continue;
            };

            match self.call_with_retries(provider.backend.as_ref(), raw_text).await {
                Ok(text) => {
                    permit.success();
                    return Ok(text);
                }
                Err(source) => {
                    permit.failure();
                    let state = provider.breaker.state();
                    tracing::warn!(provider = id, error = %source, state = state.as_str(), "provider failed");
                    last_error = Some(FallbackError::Exhausted { provider: id.to_string(), source });
                }
            }
        }

        Err(last_error.unwrap_or(FallbackError::AllCircuitsOpen))
    }

    async fn call_with_retries(&self, backend: &dyn Backend, raw_text: &str) -> Result<String, BackendError> {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.timeout, backend.call(raw_text, &self.options)).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::Transient(format!("timed out after {}ms", self.timeout.as_millis()))),
            };

            match result {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let backoff = self.retry_backoff * attempt;
                    tracing::debug!(
                        provider = backend.id(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "retrying backend call"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for FallbackInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackInvoker")
            .field("providers", &self.circuit_states())
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}
