//! Serving-path code for vetcache.
//!
//! This crate provides request normalization, entity extraction, the
//! coalesced fallback path to generative backends, and the orchestrator that
//! ties them to the read-only tiers from `vetcache-core`.

pub mod backend;
pub mod coalesce;
pub mod extract;
pub mod fallback;
pub mod normalize;
pub mod orchestrator;

pub use backend::{Backend, BackendError, CallOptions, HttpBackend};
pub use coalesce::Coalescer;
pub use extract::{EntityExtractor, ExtractError, NoopExtractor, PatternExtractor};
pub use fallback::{CircuitBreaker, CircuitState, FallbackError, FallbackInvoker};
pub use normalize::{IdentityNormalizer, ModelNormalizer, Normalizer, RuleNormalizer};
pub use orchestrator::{Envelope, Orchestrator, OrchestratorStats, RequestLog, RequestRecord, Source};
