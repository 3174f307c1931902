//! Asynchronous replication from the authoritative store to edge replicas.
//!
//! The feed is the audit log: every commit and invalidation has a
//! monotonically increasing `seq`, and the replicator joins each record with
//! its `key:version` row. Replicas apply events per key in version order and
//! expose their lag so tier 0 can step aside when it falls too far behind.

mod replica;
mod replicator;

pub use replica::{ApplyOutcome, ReplicaReader, ReplicaSink, ReplicaStatus, replica};
pub use replicator::{Replicator, SyncReport};
