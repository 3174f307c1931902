//! Per-request structured log records.

use serde::Serialize;
use vetcache_core::CanonicalKey;

/// The only fields recorded per request. Raw text and entities are never part of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestRecord {
    pub key: CanonicalKey,
    pub source: String,
    pub latency_ms: u64,
    pub hit: bool,
}

/// Sink for request records.
pub trait RequestLog: Send + Sync {
    fn record(&self, record: &RequestRecord);
}

/// Emits each record as a `tracing` event on target `vetcache::request`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRequestLog;

impl RequestLog for TracingRequestLog {
    fn record(&self, record: &RequestRecord) {
        tracing::info!(
            target: "vetcache::request",
            key = %record.key,
            source = %record.source,
            latency_ms = record.latency_ms,
            hit = record.hit,
        );
    }
}
