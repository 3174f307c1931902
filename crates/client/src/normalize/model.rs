//! Classifier-backed normalizer with a hard latency budget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use vetcache_core::CanonicalKey;

use super::Normalizer;

/// Failure reported by a classifier.
#[derive(Debug, Clone, thiserror::Error)]
#[error("classifier failed: {0}")]
pub struct ClassifyError(pub String);

/// External model that labels request text with an intent.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, raw_text: &str) -> Result<String, ClassifyError>;
}

/// Wraps a [`Classifier`]. Errors, timeouts and empty labels all yield the
/// unknown key; none of them fail the request.
pub struct ModelNormalizer {
    classifier: Arc<dyn Classifier>,
    budget: Duration,
}

impl ModelNormalizer {
    pub fn new(classifier: Arc<dyn Classifier>, budget: Duration) -> Self {
        Self { classifier, budget }
    }
}

impl std::fmt::Debug for ModelNormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelNormalizer").field("budget", &self.budget).finish()
    }
}

#[async_trait]
impl Normalizer for ModelNormalizer {
    async fn normalize(&self, raw_text: &str) -> CanonicalKey {
        if raw_text.trim().is_empty() {
            return CanonicalKey::unknown();
        }

        match tokio::time::timeout(self.budget, self.classifier.classify(raw_text)).await {
            Ok(Ok(label)) if !label.trim().is_empty() => CanonicalKey::new(label.trim()),
            Ok(Ok(_)) => {
                tracing::warn!("classifier returned an empty label; using unknown key");
                CanonicalKey::unknown()
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "normalization failed; using unknown key");
                CanonicalKey::unknown()
            }
            Err(_) => {
                let budget_ms = self.budget.as_millis() as u64;
                tracing::warn!(budget_ms, "normalization timed out; using unknown key");
                CanonicalKey::unknown()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        result: Result<String, ClassifyError>,
        delay: Duration,
    }

    #[async_trait]
    impl Classifier for Fixed {
        async fn classify(&self, _raw_text: &str) -> Result<String, ClassifyError> {
            tokio::time::sleep(self.delay).await;
            self.result.clone()
        }
    }

    fn normalizer(result: Result<String, ClassifyError>, delay: Duration) -> ModelNormalizer {
        ModelNormalizer::new(Arc::new(Fixed { result, delay }), Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn test_label_becomes_key() {
        let n = normalizer(Ok(" cancel_order ".into()), Duration::from_millis(5));
        assert_eq!(n.normalize("how do I cancel?").await.as_str(), "cancel_order");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_map_to_unknown() {
        let error = normalizer(Err(ClassifyError("model offline".into())), Duration::ZERO);
        assert!(error.normalize("anything").await.is_unknown());

        let slow = normalizer(Ok("cancel_order".into()), Duration::from_secs(1));
        assert!(slow.normalize("anything").await.is_unknown());

        let empty = normalizer(Ok("  ".into()), Duration::ZERO);
        assert!(empty.normalize("anything").await.is_unknown());
    }
}
