//! Read-only lookup tiers and the ordered cascade over them.
//!
//! A tier only answers `get`. Nothing reachable from a [`TieredStore`] can
//! write: the trait has no mutating method, and the tier-0 implementation
//! ([`ReplicaReader`](crate::replication::ReplicaReader)) wraps state that
//! only the replication process can change.

use std::sync::Arc;

use async_trait::async_trait;

use crate::model::CanonicalKey;

/// Label reported for hits served by the canonical-answer tier.
pub const TIER0_LABEL: &str = "TIER0";

/// Health reported by a tier before each lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierHealth {
    Healthy,
    Unhealthy(String),
}

impl TierHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Tier lookup errors. Always absorbed by the cascade.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TierError {
    #[error("tier unavailable: {0}")]
    Unavailable(String),

    #[error("tier lookup failed: {0}")]
    Lookup(String),
}

/// One lookup layer.
#[async_trait]
pub trait Tier: Send + Sync {
    /// Label reported as the envelope source on a hit.
    fn label(&self) -> &str;

    /// Unhealthy tiers are skipped and count as a miss.
    fn health(&self) -> TierHealth {
        TierHealth::Healthy
    }

    /// Look up a servable value.
    async fn get(&self, key: &CanonicalKey) -> Result<Option<String>, TierError>;
}

/// A value found by the cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierHit {
    pub value: String,
    pub tier: String,
}

/// Ordered tiers, tried strictly in sequence.
#[derive(Clone, Default)]
pub struct TieredStore {
    tiers: Vec<Arc<dyn Tier>>,
}

impl TieredStore {
    pub fn new(tiers: Vec<Arc<dyn Tier>>) -> Self {
        Self { tiers }
    }

    pub fn labels(&self) -> Vec<&str> {
        self.tiers.iter().map(|t| t.label()).collect()
    }

    /// Walk the tiers in order and stop at the first hit.
    ///
    /// Unhealthy tiers and tier errors are logged and treated as misses.
    pub async fn lookup(&self, key: &CanonicalKey) -> Option<TierHit> {
        for tier in &self.tiers {
            if let TierHealth::Unhealthy(reason) = tier.health() {
                tracing::debug!(tier = tier.label(), %reason, "skipping unhealthy tier");
                continue;
            }

            match tier.get(key).await {
                Ok(Some(value)) => return Some(TierHit { value, tier: tier.label().to_string() }),
                Ok(None) => {}
                Err(e) => tracing::warn!(tier = tier.label(), error = %e, "tier lookup failed; treating as miss"),
            }
        }
        None
    }
}

impl std::fmt::Debug for TieredStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredStore").field("tiers", &self.labels()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MapTier {
        label: &'static str,
        values: HashMap<String, String>,
        health: TierHealth,
        fail: bool,
        calls: AtomicUsize,
    }

    impl MapTier {
        fn new(label: &'static str, pairs: &[(&str, &str)]) -> Self {
            Self {
                label,
                values: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                health: TierHealth::Healthy,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Tier for MapTier {
        fn label(&self) -> &str {
            self.label
        }

        fn health(&self) -> TierHealth {
            self.health.clone()
        }

        async fn get(&self, key: &CanonicalKey) -> Result<Option<String>, TierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TierError::Lookup("boom".into()));
            }
            Ok(self.values.get(key.as_str()).cloned())
        }
    }

    #[tokio::test]
    async fn test_first_hit_short_circuits() {
        let first = Arc::new(MapTier::new("TIER0", &[("k", "from tier 0")]));
        let second = Arc::new(MapTier::new("SIMILARITY", &[("k", "from tier 1")]));
        let store = TieredStore::new(vec![first.clone() as Arc<dyn Tier>, second.clone()]);

        let hit = store.lookup(&"k".into()).await.unwrap();
        assert_eq!(hit.tier, "TIER0");
        assert_eq!(hit.value, "from tier 0");
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_falls_through_in_order() {
        let first = Arc::new(MapTier::new("TIER0", &[]));
        let second = Arc::new(MapTier::new("SIMILARITY", &[("k", "from tier 1")]));
        let store = TieredStore::new(vec![first as Arc<dyn Tier>, second]);

        let hit = store.lookup(&"k".into()).await.unwrap();
        assert_eq!(hit.tier, "SIMILARITY");
        assert!(store.lookup(&"missing".into()).await.is_none());
    }

    #[tokio::test]
    async fn test_unhealthy_tier_skipped() {
        let mut first = MapTier::new("TIER0", &[("k", "stale")]);
        first.health = TierHealth::Unhealthy("lag".into());
        let first = Arc::new(first);
        let store = TieredStore::new(vec![first.clone() as Arc<dyn Tier>]);

        assert!(store.lookup(&"k".into()).await.is_none());
        assert_eq!(first.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tier_error_is_a_miss() {
        let mut first = MapTier::new("TIER0", &[("k", "v")]);
        first.fail = true;
        let second = MapTier::new("SIMILARITY", &[("k", "backup")]);
        let store = TieredStore::new(vec![Arc::new(first) as Arc<dyn Tier>, Arc::new(second)]);

        assert_eq!(store.lookup(&"k".into()).await.unwrap().value, "backup");
    }

    #[test]
    fn test_labels_in_order() {
        let store = TieredStore::new(vec![
            Arc::new(MapTier::new("TIER0", &[])) as Arc<dyn Tier>,
            Arc::new(MapTier::new("SIM", &[])),
        ]);
        assert_eq!(store.labels(), vec!["TIER0", "SIM"]);
    }
}
