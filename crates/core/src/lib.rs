//! Core types and shared functionality for vetcache.
//!
//! This crate provides:
//! - The authoritative SQLite store with versioned entries and an audit log
//! - The single-writer mutation pipeline and its policy gate
//! - Edge replicas and the replicator that feeds them
//! - The read-only tier contract used by the serving path
//! - Unified error types and layered configuration

pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod replication;
pub mod store;
pub mod tier;

pub use config::{AppConfig, ConfigError};
pub use error::Error;
pub use model::{CacheEntry, CanonicalKey, EntityMap, PendingCandidate, PolicyScore};
pub use pipeline::{MutationPipeline, SubmitOutcome};
pub use replication::{ReplicaReader, ReplicaStatus, Replicator};
pub use store::CacheDb;
pub use tier::{Tier, TierError, TierHealth, TierHit, TieredStore};
