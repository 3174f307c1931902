//! Backend error types.

use std::sync::Arc;

/// How the fallback invoker should treat a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    Transient,
    RateLimited,
    Unavailable,
}

/// Errors from a generative backend.
///
/// Cloneable so one failed call can be handed to every coalesced waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// Worth retrying on the same provider (timeouts, 502/504).
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// Provider asked us to slow down (429).
    #[error("rate limited")]
    RateLimited,

    /// Provider cannot serve right now; retrying will not help.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Transport failure before a response arrived.
    #[error("network error: {0}")]
    Network(Arc<reqwest::Error>),

    /// Response arrived but was not understood.
    #[error("parse error: {0}")]
    Parse(String),
}

impl BackendError {
    pub fn kind(&self) -> BackendErrorKind {
        match self {
            Self::Transient(_) => BackendErrorKind::Transient,
            Self::RateLimited => BackendErrorKind::RateLimited,
            Self::Network(e) if e.is_timeout() => BackendErrorKind::Transient,
            Self::Unavailable(_) | Self::Network(_) | Self::Parse(_) => BackendErrorKind::Unavailable,
        }
    }

    /// Only transient and rate-limited failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), BackendErrorKind::Transient | BackendErrorKind::RateLimited)
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Transient("request timed out".into())
        } else {
            BackendError::Network(Arc::new(err))
        }
    }
}
