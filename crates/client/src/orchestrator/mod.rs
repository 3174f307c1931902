//! Request orchestration for the serving path.
//!
//! ### Flow
//!
//! 1. Normalize and extract concurrently; extraction runs under its own
//!    budget and yields an empty map on timeout or error.
//! 2. Walk the tiers in order. A hit is served with the tier's label.
//! 3. On a full miss, join (or lead) the coalesced fallback call for the key.
//! 4. If the fallback fails, serve the configured degraded text.
//!
//! One [`RequestRecord`] is written per request.

pub mod log;

pub use log::{RequestLog, RequestRecord, TracingRequestLog};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use vetcache_core::config::AppConfig;
use vetcache_core::{CanonicalKey, EntityMap, TieredStore};

use crate::coalesce::Coalescer;
use crate::extract::{self, EntityExtractor, ExtractError, NoopExtractor};
use crate::fallback::FallbackInvoker;
use crate::normalize::{self, IdentityNormalizer, NormalizeError, Normalizer};

const DEFAULT_DEGRADED_RESPONSE: &str = "We're unable to answer that right now. Please try again shortly.";

const DEFAULT_EXTRACTION_TIMEOUT: Duration = Duration::from_millis(50);

/// Where an answer came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Served from the tier with this label.
    Tier(String),
    /// Drafted by a backend provider.
    Fallback,
    /// Every fallback path failed; degraded text was served.
    FallbackDegraded,
}

impl Source {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Tier(label) => label,
            Self::Fallback => "FALLBACK",
            Self::FallbackDegraded => "FALLBACK_DEGRADED",
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Tier(_))
    }
}

impl Serialize for Source {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Response handed back for every request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub key: CanonicalKey,
    pub text: String,
    pub entities: EntityMap,
    pub source: Source,
    pub latency_ms: u64,
}

/// Running counters for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    pub requests: u64,
    pub hits: u64,
    pub fallbacks: u64,
    pub degraded: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    hits: AtomicU64,
    fallbacks: AtomicU64,
    degraded: AtomicU64,
}

/// Errors building an orchestrator from config.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Normalizer(#[from] NormalizeError),

    #[error(transparent)]
    Extractor(#[from] ExtractError),
}

/// Serves requests from the tiers, falling back to backends on a miss.
pub struct Orchestrator {
    normalizer: Arc<dyn Normalizer>,
    extractor: Arc<dyn EntityExtractor>,
    extraction_timeout: Duration,
    tiers: TieredStore,
    coalescer: Coalescer,
    fallback: Arc<FallbackInvoker>,
    degraded_response: String,
    request_log: Arc<dyn RequestLog>,
    counters: Counters,
}

impl Orchestrator {
    /// Identity normalization, no extraction, tracing request log.
    pub fn new(tiers: TieredStore, fallback: Arc<FallbackInvoker>) -> Self {
        Self {
            normalizer: Arc::new(IdentityNormalizer),
            extractor: Arc::new(NoopExtractor),
            extraction_timeout: DEFAULT_EXTRACTION_TIMEOUT,
            tiers,
            coalescer: Coalescer::new(),
            fallback,
            degraded_response: DEFAULT_DEGRADED_RESPONSE.to_string(),
            request_log: Arc::new(TracingRequestLog),
            counters: Counters::default(),
        }
    }

    /// Wire normalizer, extractor and budgets from the application config.
    pub fn from_config(
        config: &AppConfig, tiers: TieredStore, fallback: Arc<FallbackInvoker>,
    ) -> Result<Self, BuildError> {
        Ok(Self::new(tiers, fallback)
            .with_normalizer(normalize::from_config(config)?)
            .with_extractor(extract::from_config(config)?)
            .with_extraction_timeout(config.extraction_timeout())
            .with_degraded_response(config.degraded_response.clone()))
    }

    pub fn with_normalizer(mut self, normalizer: Arc<dyn Normalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn EntityExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_extraction_timeout(mut self, timeout: Duration) -> Self {
        self.extraction_timeout = timeout;
        self
    }

    pub fn with_degraded_response(mut self, text: impl Into<String>) -> Self {
        self.degraded_response = text.into();
        self
    }

    pub fn with_request_log(mut self, log: Arc<dyn RequestLog>) -> Self {
        self.request_log = log;
        self
    }

    pub fn coalescer(&self) -> &Coalescer {
        &self.coalescer
    }

    pub fn fallback(&self) -> &FallbackInvoker {
        &self.fallback
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            degraded: self.counters.degraded.load(Ordering::Relaxed),
        }
    }

    async fn extract(&self, raw_text: &str) -> EntityMap {
        match tokio::time::timeout(self.extraction_timeout, self.extractor.extract(raw_text)).await {
            Ok(Ok(entities)) => entities,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "entity extraction failed; continuing without entities");
                EntityMap::new()
            }
            Err(_) => {
                tracing::debug!("entity extraction exceeded its budget; continuing without entities");
                EntityMap::new()
            }
        }
    }

    /// Answer one request. Never fails: a total failure yields the degraded envelope.
    pub async fn handle(&self, raw_text: &str) -> Envelope {
        let start = Instant::now();
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let (key, entities) = tokio::join!(self.normalizer.normalize(raw_text), self.extract(raw_text));

        let (text, source) = match self.tiers.lookup(&key).await {
            Some(hit) => {
                tracing::debug!(key = %key, tier = %hit.tier, "tier hit");
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                (hit.value, Source::Tier(hit.tier))
            }
            None => {
                tracing::debug!(key = %key, "tier miss; invoking fallback");
                let fallback = self.fallback.clone();
                let raw = raw_text.to_string();
                match self.coalescer.run(&key, move || async move { fallback.invoke(&raw).await }).await {
                    Ok(text) => {
                        self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                        (text, Source::Fallback)
                    }
                    Err(e) => {
                        self.counters.degraded.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(key = %key, error = %e, "fallback exhausted; serving degraded response");
                        (self.degraded_response.clone(), Source::FallbackDegraded)
                    }
                }
            }
        };

        let latency_ms = start.elapsed().as_millis() as u64;
        self.request_log.record(&RequestRecord {
            key: key.clone(),
            source: source.as_str().to_string(),
            latency_ms,
            hit: source.is_hit(),
        });

        Envelope { key, text, entities, source, latency_ms }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("tiers", &self.tiers)
            .field("extraction_timeout", &self.extraction_timeout)
            .field("coalescer", &self.coalescer)
            .field("fallback", &self.fallback)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, BackendError, CallOptions};
    use crate::extract::PatternExtractor;
    use crate::normalize::{Rule, RuleNormalizer};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;
    use vetcache_core::config::{BreakerConfig, EntityPatternConfig, FallbackConfig, PolicyThresholds};
    use vetcache_core::replication::replica;
    use vetcache_core::tier::Tier;
    use vetcache_core::{CacheDb, MutationPipeline, Replicator};

    /// Answers after an optional gate opens; counts calls.
    struct GatedBackend {
        answer: Result<String, BackendError>,
        gate: Option<Arc<Notify>>,
        calls: AtomicUsize,
    }

    impl GatedBackend {
        fn new(answer: Result<String, BackendError>) -> Arc<Self> {
            Arc::new(Self { answer, gate: None, calls: AtomicUsize::new(0) })
        }

        fn gated(answer: &str, gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self { answer: Ok(answer.to_string()), gate: Some(gate), calls: AtomicUsize::new(0) })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Backend for GatedBackend {
        fn id(&self) -> &str {
            "mock"
        }

        async fn call(&self, _raw_text: &str, _options: &CallOptions) -> Result<String, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.answer.clone()
        }
    }

    #[derive(Default)]
    struct CapturingLog(Mutex<Vec<RequestRecord>>);

    impl RequestLog for CapturingLog {
        fn record(&self, record: &RequestRecord) {
            self.0.lock().unwrap().push(record.clone());
        }
    }

    fn invoker(backend: Arc<dyn Backend>) -> Arc<FallbackInvoker> {
        let fallback = FallbackConfig { timeout_ms: 60_000, max_retries: 0, retry_backoff_ms: 1 };
        let breaker = BreakerConfig { failure_threshold: 1, window_ms: 60_000, cooldown_ms: 60_000 };
        Arc::new(FallbackInvoker::new(vec![backend], &fallback, &breaker))
    }

    fn cancel_order_rules() -> Arc<dyn Normalizer> {
        Arc::new(RuleNormalizer::new(vec![Rule::new(r"\bcancel\b.*\border\b", "cancel_order").unwrap()]))
    }

    fn order_id_extractor() -> Arc<dyn EntityExtractor> {
        let patterns = [EntityPatternConfig { name: "order_id".into(), pattern: r"#?(\d+)".into() }];
        Arc::new(PatternExtractor::new(&patterns).unwrap())
    }

    /// Store, pipeline and a synced edge replica wired as tier 0.
    async fn edge() -> (MutationPipeline, Replicator, TieredStore) {
        let db = CacheDb::open_in_memory().await.unwrap();
        let pipeline = MutationPipeline::open(db.clone(), PolicyThresholds::default(), Duration::ZERO).unwrap();
        let (sink, reader) = replica("local", Duration::from_secs(30));
        let replicator = Replicator::new(db, vec![sink], Default::default());
        let tiers = TieredStore::new(vec![Arc::new(reader) as Arc<dyn Tier>]);
        (pipeline, replicator, tiers)
    }

    #[tokio::test]
    async fn test_cancel_order_scenario() {
        let (pipeline, mut replicator, tiers) = edge().await;
        pipeline
            .commit(&"cancel_order".into(), "Open Orders, pick the order, choose Cancel.", 0, "alice")
            .await
            .unwrap();
        replicator.sync_once().await.unwrap();

        let backend = GatedBackend::new(Ok("drafted".into()));
        let log = Arc::new(CapturingLog::default());
        let orchestrator = Orchestrator::new(tiers, invoker(backend.clone()))
            .with_normalizer(cancel_order_rules())
            .with_extractor(order_id_extractor())
            .with_request_log(log.clone());

        let first = orchestrator.handle("cancel order 12345").await;
        let second = orchestrator.handle("Cancel order #98765").await;
        let third = orchestrator.handle("How do I cancel my order 456?").await;

        assert_eq!(first.key.as_str(), "cancel_order");
        assert_eq!(second.key, first.key);
        assert_eq!(third.key, first.key);
        assert_eq!(first.source, Source::Tier("TIER0".into()));
        assert_eq!(first.text, second.text);
        assert_eq!(first.entities.get("order_id").map(String::as_str), Some("12345"));
        assert_eq!(second.entities.get("order_id").map(String::as_str), Some("98765"));
        assert_eq!(third.entities.get("order_id").map(String::as_str), Some("456"));
        assert_eq!(backend.calls(), 0);

        let records = log.0.lock().unwrap().clone();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.hit && r.source == "TIER0" && r.key.as_str() == "cancel_order"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_thousand_concurrent_misses_share_one_backend_call() {
        let gate = Arc::new(Notify::new());
        let backend = GatedBackend::gated("drafted once", gate.clone());
        let orchestrator = Arc::new(
            Orchestrator::new(TieredStore::default(), invoker(backend.clone())).with_normalizer(cancel_order_rules()),
        );

        let mut handles = Vec::new();
        for i in 0..1000 {
            let orchestrator = orchestrator.clone();
            handles.push(tokio::spawn(async move { orchestrator.handle(&format!("cancel order #{i}")).await }));
        }

        let key = CanonicalKey::from("cancel_order");
        while orchestrator.coalescer().waiters(&key) < 1000 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        gate.notify_one();

        let mut envelopes = Vec::new();
        for handle in handles {
            envelopes.push(handle.await.unwrap());
        }
        assert_eq!(backend.calls(), 1);
        assert!(envelopes.iter().all(|e| e.text == "drafted once" && e.source == Source::Fallback));
        assert_eq!(orchestrator.coalescer().in_flight(), 0);
        assert_eq!(orchestrator.stats().fallbacks, 1000);
    }

    #[tokio::test]
    async fn test_all_circuits_open_degrades_without_hanging() {
        let backend = GatedBackend::new(Err(BackendError::Unavailable("down".into())));
        let orchestrator = Orchestrator::new(TieredStore::default(), invoker(backend.clone()))
            .with_degraded_response("Please try later.");

        let first = orchestrator.handle("q").await;
        assert_eq!(first.source, Source::FallbackDegraded);

        let second = tokio::time::timeout(Duration::from_secs(1), orchestrator.handle("q")).await.unwrap();
        assert_eq!(second.source, Source::FallbackDegraded);
        assert_eq!(second.text, "Please try later.");
        assert_eq!(backend.calls(), 1);
        assert_eq!(orchestrator.stats().degraded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lagging_replica_is_a_miss() {
        let (pipeline, mut replicator, tiers) = edge().await;
        pipeline.commit(&"k".into(), "cached", 0, "alice").await.unwrap();
        replicator.sync_once().await.unwrap();

        let backend = GatedBackend::new(Ok("fresh".into()));
        let orchestrator = Orchestrator::new(tiers, invoker(backend.clone()));
        assert_eq!(orchestrator.handle("k").await.source, Source::Tier("TIER0".into()));

        tokio::time::advance(Duration::from_secs(31)).await;
        let envelope = orchestrator.handle("k").await;
        assert_eq!(envelope.source, Source::Fallback);
        assert_eq!(envelope.text, "fresh");
    }

    #[tokio::test]
    async fn test_invalid_entry_is_a_miss() {
        let (pipeline, mut replicator, tiers) = edge().await;
        pipeline.commit(&"k".into(), "retracted", 0, "alice").await.unwrap();
        pipeline.invalidate(&"k".into(), "bob", 1).await.unwrap();
        replicator.sync_once().await.unwrap();

        let backend = GatedBackend::new(Ok("fresh".into()));
        let orchestrator = Orchestrator::new(tiers, invoker(backend));
        let envelope = orchestrator.handle("k").await;
        assert_eq!(envelope.source, Source::Fallback);
        assert_ne!(envelope.text, "retracted");
    }

    #[tokio::test]
    async fn test_slow_extractor_yields_empty_entities() {
        struct Slow;

        #[async_trait]
        impl EntityExtractor for Slow {
            async fn extract(&self, _raw_text: &str) -> Result<EntityMap, ExtractError> {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(EntityMap::from([("never".to_string(), "seen".to_string())]))
            }
        }

        let backend = GatedBackend::new(Ok("answer".into()));
        let orchestrator = Orchestrator::new(TieredStore::default(), invoker(backend))
            .with_extractor(Arc::new(Slow))
            .with_extraction_timeout(Duration::from_millis(20));

        let envelope = orchestrator.handle("k").await;
        assert!(envelope.entities.is_empty());
        assert_eq!(envelope.text, "answer");
    }

    #[test]
    fn test_source_serializes_as_label() {
        assert_eq!(serde_json::to_string(&Source::Tier("TIER0".into())).unwrap(), r#""TIER0""#);
        assert_eq!(serde_json::to_string(&Source::FallbackDegraded).unwrap(), r#""FALLBACK_DEGRADED""#);
    }
}
