//! Request normalization into canonical keys.
//!
//! Every normalizer is total: whatever it is given, it returns a key. Inputs
//! it cannot place map to [`CanonicalKey::unknown`], which is never served
//! from cache.

pub mod model;
pub mod rules;

pub use model::{Classifier, ClassifyError, ModelNormalizer};
pub use rules::{Rule, RuleNormalizer};

use std::sync::Arc;

use async_trait::async_trait;
use vetcache_core::CanonicalKey;
use vetcache_core::config::{AppConfig, NormalizerKind};

/// Errors building a normalizer.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("invalid rule pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("rule for pattern {0:?} has an empty key")]
    EmptyKey(String),
}

/// Maps raw request text to a canonical key.
#[async_trait]
pub trait Normalizer: Send + Sync {
    async fn normalize(&self, raw_text: &str) -> CanonicalKey;
}

/// Exact-match normalizer: the key is the raw text.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityNormalizer;

#[async_trait]
impl Normalizer for IdentityNormalizer {
    async fn normalize(&self, raw_text: &str) -> CanonicalKey {
        if raw_text.trim().is_empty() { CanonicalKey::unknown() } else { CanonicalKey::new(raw_text) }
    }
}

/// Build the normalizer selected in config.
pub fn from_config(config: &AppConfig) -> Result<Arc<dyn Normalizer>, NormalizeError> {
    match config.normalizer {
        NormalizerKind::Identity => Ok(Arc::new(IdentityNormalizer)),
        NormalizerKind::Rules => Ok(Arc::new(RuleNormalizer::from_config(&config.rules)?)),
    }
}
