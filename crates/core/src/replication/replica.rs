//! One edge region's read-only copy of the authoritative store.
//!
//! [`replica`] returns a split pair: the [`ReplicaSink`] is handed to the
//! replicator and is the only way to change replica state, while the
//! [`ReplicaReader`] is handed to the serving path and only answers `get`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::model::{CacheEntry, CanonicalKey};
use crate::store::ChangeEvent;
use crate::store::entries::Snapshot;
use crate::tier::{TIER0_LABEL, Tier, TierError, TierHealth};

/// Result of applying one feed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Installed, possibly together with buffered successors.
    Applied,
    /// At or below the key's applied version; dropped.
    Stale,
    /// Ahead of a missing predecessor; held until the gap fills.
    Buffered,
}

/// Point-in-time health of a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, schemars::JsonSchema)]
pub struct ReplicaStatus {
    pub region: String,
    /// Time since the last gap-free sync. `None` if the replica never synced.
    pub lag_ms: Option<u64>,
    pub healthy: bool,
    pub entries: usize,
    /// Events held back waiting for a missing predecessor version.
    pub buffered: usize,
    pub applied_seq: i64,
}

#[derive(Debug, Default)]
struct ReplicaState {
    entries: HashMap<CanonicalKey, CacheEntry>,
    applied: HashMap<CanonicalKey, u64>,
    buffered: HashMap<CanonicalKey, BTreeMap<u64, Option<CacheEntry>>>,
    last_synced: Option<Instant>,
    applied_seq: i64,
}

impl ReplicaState {
    fn install(&mut self, key: &CanonicalKey, version: u64, entry: Option<CacheEntry>) {
        match entry {
            Some(entry) => {
                self.entries.insert(key.clone(), entry);
            }
            None => {
                self.entries.remove(key);
            }
        }
        self.applied.insert(key.clone(), version);
    }

    fn buffered_len(&self) -> usize {
        self.buffered.values().map(BTreeMap::len).sum()
    }

    fn lag(&self, now: Instant) -> Option<Duration> {
        self.last_synced.map(|at| now.saturating_duration_since(at))
    }
}

#[derive(Debug)]
struct Shared {
    region: String,
    critical_lag: Duration,
    state: RwLock<ReplicaState>,
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, ReplicaState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ReplicaState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create an empty replica for `region`.
///
/// The replica reports unhealthy until its first gap-free sync and whenever
/// the time since the last one exceeds `critical_lag`.
pub fn replica(region: impl Into<String>, critical_lag: Duration) -> (ReplicaSink, ReplicaReader) {
    let shared = Arc::new(Shared { region: region.into(), critical_lag, state: RwLock::new(ReplicaState::default()) });
    (ReplicaSink { shared: shared.clone() }, ReplicaReader { shared })
}

/// Write side of a replica. Owned by the replicator.
#[derive(Debug)]
pub struct ReplicaSink {
    shared: Arc<Shared>,
}

impl ReplicaSink {
    pub fn region(&self) -> &str {
        &self.shared.region
    }

    /// Replace the replica contents with a store snapshot.
    pub(crate) fn load_snapshot(&self, snapshot: &Snapshot) {
        let mut state = self.shared.write();
        state.entries.clear();
        state.applied.clear();
        state.buffered.clear();

        for entry in &snapshot.entries {
            state.applied.insert(entry.key.clone(), entry.version);
            state.entries.insert(entry.key.clone(), entry.clone());
        }
        for (key, version) in &snapshot.purged {
            state.applied.insert(key.clone(), *version);
        }
        state.applied_seq = snapshot.head_seq;
    }

    /// Apply one feed event in per-key version order.
    pub(crate) fn apply(&self, event: &ChangeEvent) -> ApplyOutcome {
        let mut state = self.shared.write();
        state.applied_seq = state.applied_seq.max(event.seq);

        let applied = state.applied.get(&event.key).copied().unwrap_or(0);
        if event.version <= applied {
            return ApplyOutcome::Stale;
        }
        if event.version > applied + 1 {
            state
                .buffered
                .entry(event.key.clone())
                .or_default()
                .insert(event.version, event.entry.clone());
            return ApplyOutcome::Buffered;
        }

        state.install(&event.key, event.version, event.entry.clone());

        let mut next = event.version + 1;
        while let Some(entry) = state.buffered.get_mut(&event.key).and_then(|b| b.remove(&next)) {
            state.install(&event.key, next, entry);
            next += 1;
        }
        if let Some(pending) = state.buffered.get_mut(&event.key) {
            pending.retain(|version, _| *version >= next);
            if pending.is_empty() {
                state.buffered.remove(&event.key);
            }
        }
        ApplyOutcome::Applied
    }

    /// Record a completed sync. Lag only resets when no version gap is outstanding.
    pub(crate) fn mark_synced(&self, now: Instant) -> bool {
        let mut state = self.shared.write();
        if !state.buffered.is_empty() {
            return false;
        }
        state.last_synced = Some(now);
        true
    }

    /// Drop invalid entries whose grace period has passed.
    pub(crate) fn compact(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.shared.write();
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.is_purgeable(now));
        before - state.entries.len()
    }

    pub fn reader(&self) -> ReplicaReader {
        ReplicaReader { shared: self.shared.clone() }
    }
}

/// Read side of a replica; tier 0 of the serving path.
///
/// Exposes lookups and status only.
#[derive(Debug, Clone)]
pub struct ReplicaReader {
    shared: Arc<Shared>,
}

impl ReplicaReader {
    pub fn region(&self) -> &str {
        &self.shared.region
    }

    /// Time since the last gap-free sync.
    pub fn lag(&self) -> Option<Duration> {
        self.shared.read().lag(Instant::now())
    }

    /// Highest applied version for `key`, 0 if none.
    pub fn applied_version(&self, key: &CanonicalKey) -> u64 {
        self.shared.read().applied.get(key).copied().unwrap_or(0)
    }

    pub fn status(&self) -> ReplicaStatus {
        let state = self.shared.read();
        let lag = state.lag(Instant::now());
        ReplicaStatus {
            region: self.shared.region.clone(),
            lag_ms: lag.map(|l| l.as_millis() as u64),
            healthy: lag.is_some_and(|l| l <= self.shared.critical_lag),
            entries: state.entries.len(),
            buffered: state.buffered_len(),
            applied_seq: state.applied_seq,
        }
    }
}

#[async_trait]
impl Tier for ReplicaReader {
    fn label(&self) -> &str {
        TIER0_LABEL
    }

    fn health(&self) -> TierHealth {
        match self.lag() {
            None => TierHealth::Unhealthy(format!("replica {} has not synced", self.shared.region)),
            Some(lag) if lag > self.shared.critical_lag => TierHealth::Unhealthy(format!(
                "replica {} lag {}ms over {}ms",
                self.shared.region,
                lag.as_millis(),
                self.shared.critical_lag.as_millis()
            )),
            Some(_) => TierHealth::Healthy,
        }
    }

    async fn get(&self, key: &CanonicalKey) -> Result<Option<String>, TierError> {
        if key.is_unknown() {
            return Ok(None);
        }
        let state = self.shared.read();
        Ok(state.entries.get(key).filter(|e| e.is_servable()).map(|e| e.value.clone()))
    }
}
