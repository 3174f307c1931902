//! Per-key request coalescing for the fallback path.
//!
//! The first caller for a key becomes the leader and starts the backend call
//! on a spawned task. Callers arriving while it is in flight await the same
//! shared result. The table entry is removed when the call finishes, whatever
//! the outcome, so the next miss starts a fresh call.
//!
//! Dropping a waiter only withdraws that waiter. The spawned call is aborted
//! once the last waiter for its generation is gone.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::task::AbortHandle;
use vetcache_core::CanonicalKey;

use crate::fallback::FallbackError;

type CallResult = Result<String, FallbackError>;
type SharedCall = Shared<BoxFuture<'static, CallResult>>;

struct Slot {
    generation: u64,
    call: SharedCall,
    waiters: usize,
    abort: AbortHandle,
}

type Table = Arc<Mutex<HashMap<CanonicalKey, Slot>>>;

fn lock(table: &Table) -> MutexGuard<'_, HashMap<CanonicalKey, Slot>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decrements the waiter count when a waiter finishes or is dropped.
struct WaiterGuard {
    table: Table,
    key: CanonicalKey,
    generation: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let mut table = lock(&self.table);
        let Some(slot) = table.get_mut(&self.key) else { return };
        if slot.generation != self.generation {
            return;
        }
        slot.waiters = slot.waiters.saturating_sub(1);
        if slot.waiters == 0 {
            slot.abort.abort();
            table.remove(&self.key);
            tracing::debug!(key = %self.key, "fallback call abandoned by every waiter");
        }
    }
}

/// Single-flight table keyed by canonical key.
#[derive(Clone, Default)]
pub struct Coalescer {
    in_flight: Table,
    next_generation: Arc<AtomicU64>,
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a call in flight.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Callers currently waiting on `key`.
    pub fn waiters(&self, key: &CanonicalKey) -> usize {
        lock(&self.in_flight).get(key).map_or(0, |slot| slot.waiters)
    }

    /// Run `make()` for `key` unless a call for it is already in flight.
    ///
    /// The unknown key is never coalesced: unrelated inputs share it.
    pub async fn run<F, Fut>(&self, key: &CanonicalKey, make: F) -> CallResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        if key.is_unknown() {
            return make().await;
        }

        let (call, generation) = {
            let mut table = lock(&self.in_flight);
            match table.get_mut(key) {
                Some(slot) => {
                    slot.waiters += 1;
                    tracing::debug!(key = %key, waiters = slot.waiters, "joining in-flight fallback call");
                    (slot.call.clone(), slot.generation)
                }
                None => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let fut = make();
                    let cleanup_table = self.in_flight.clone();
                    let cleanup_key = key.clone();
                    let handle = tokio::spawn(async move {
                        let result = fut.await;
                        let mut table = lock(&cleanup_table);
                        if table.get(&cleanup_key).is_some_and(|slot| slot.generation == generation) {
                            table.remove(&cleanup_key);
                        }
                        result
                    });
                    let abort = handle.abort_handle();
                    let call = async move {
                        match handle.await {
                            Ok(result) => result,
                            Err(e) => Err(FallbackError::Aborted(e.to_string())),
                        }
                    }
                    .boxed()
                    .shared();
                    table.insert(key.clone(), Slot { generation, call: call.clone(), waiters: 1, abort });
                    (call, generation)
                }
            }
        };

        let _guard = WaiterGuard { table: self.in_flight.clone(), key: key.clone(), generation };
        call.await
    }
}

impl std::fmt::Debug for Coalescer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coalescer").field("in_flight", &self.in_flight()).finish()
    }
}
