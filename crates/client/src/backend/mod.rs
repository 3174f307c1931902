//! Generative backends consulted on a full cache miss.
//!
//! A backend only has to answer `call`. The fallback invoker layers timeouts,
//! retries, provider ordering and circuit breaking on top.

pub mod error;
pub mod http;

pub use error::{BackendError, BackendErrorKind};
pub use http::{HttpBackend, HttpBackendConfig};

use async_trait::async_trait;

/// Per-call options passed through to the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Model override; providers fall back to their configured default.
    pub model: Option<String>,
}

/// A provider that can draft an answer for raw request text.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable provider id used in logs and breaker state.
    fn id(&self) -> &str;

    async fn call(&self, raw_text: &str, options: &CallOptions) -> Result<String, BackendError>;
}
