//! Feed consumer that keeps every edge replica in step with the authoritative store.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};

use super::replica::{ApplyOutcome, ReplicaSink};
use crate::Error;
use crate::config::ReplicationConfig;
use crate::store::CacheDb;

/// Counts from one pass over the feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub events: usize,
    pub applied: usize,
    pub buffered: usize,
    pub compacted: usize,
}

/// Copies the audit feed into replicas.
///
/// Bootstraps from a consistent snapshot, then follows `changes_since` from
/// the snapshot's head sequence.
#[derive(Debug)]
pub struct Replicator {
    db: CacheDb,
    sinks: Vec<ReplicaSink>,
    cursor: i64,
    bootstrapped: bool,
    config: ReplicationConfig,
}

impl Replicator {
    pub fn new(db: CacheDb, sinks: Vec<ReplicaSink>, config: ReplicationConfig) -> Self {
        Self { db, sinks, cursor: 0, bootstrapped: false, config }
    }

    /// Feed position already applied to every replica.
    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Load every replica from the current store contents.
    pub async fn bootstrap(&mut self) -> Result<(), Error> {
        let snapshot = self.db.snapshot().await?;
        let now = Instant::now();
        for sink in &self.sinks {
            sink.load_snapshot(&snapshot);
            sink.mark_synced(now);
        }
        self.cursor = snapshot.head_seq;
        self.bootstrapped = true;
        tracing::info!(
            replicas = self.sinks.len(),
            entries = snapshot.entries.len(),
            head_seq = snapshot.head_seq,
            "replicas bootstrapped"
        );
        Ok(())
    }

    /// Drain the feed once and apply it to every replica.
    pub async fn sync_once(&mut self) -> Result<SyncReport, Error> {
        if !self.bootstrapped {
            self.bootstrap().await?;
        }

        let mut report = SyncReport::default();
        loop {
            let batch = self.db.changes_since(self.cursor, self.config.batch_size).await?;
            let fetched = batch.len();
            for event in &batch {
                for sink in &self.sinks {
                    match sink.apply(event) {
                        ApplyOutcome::Applied => report.applied += 1,
                        ApplyOutcome::Buffered => report.buffered += 1,
                        ApplyOutcome::Stale => {}
                    }
                }
                self.cursor = event.seq;
            }
            report.events += fetched;
            if fetched < self.config.batch_size as usize {
                break;
            }
        }

        let now = Instant::now();
        let wall = Utc::now();
        for sink in &self.sinks {
            report.compacted += sink.compact(wall);
            if !sink.mark_synced(now) {
                tracing::warn!(region = sink.region(), "replica has version gaps; lag not reset");
            }

            let status = sink.reader().status();
            if let Some(lag) = status.lag_ms
                && Duration::from_millis(lag) > self.config.warn_lag()
            {
                tracing::warn!(region = %status.region, lag_ms = lag, healthy = status.healthy, "replica lagging");
            }
        }

        if report.events > 0 {
            tracing::debug!(
                events = report.events,
                applied = report.applied,
                cursor = self.cursor,
                "replication pass complete"
            );
        }
        Ok(report)
    }

    /// Poll the feed on the configured interval until `shutdown` flips to true.
    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.poll_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("replicator shutting down");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sync_once().await {
                            tracing::error!(error = %e, cursor = self.cursor, "replication pass failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyThresholds;
    use crate::pipeline::MutationPipeline;
    use crate::replication::replica;
    use crate::tier::Tier;

    async fn setup(batch_size: u32) -> (MutationPipeline, Replicator, crate::replication::ReplicaReader) {
        let db = CacheDb::open_in_memory().await.unwrap();
        let pipeline = MutationPipeline::open(db.clone(), PolicyThresholds::default(), Duration::ZERO).unwrap();
        let (sink, reader) = replica("eu", Duration::from_secs(30));
        let config = ReplicationConfig { batch_size, ..ReplicationConfig::default() };
        (pipeline, Replicator::new(db, vec![sink], config), reader)
    }

    #[tokio::test]
    async fn test_bootstrap_copies_existing_entries() {
        let (pipeline, mut replicator, reader) = setup(500).await;
        pipeline.commit(&"cancel_order".into(), "Open Orders and choose Cancel.", 0, "alice").await.unwrap();

        replicator.bootstrap().await.unwrap();
        assert_eq!(replicator.cursor(), 1);
        assert!(reader.health().is_healthy());
        assert_eq!(
            reader.get(&"cancel_order".into()).await.unwrap().as_deref(),
            Some("Open Orders and choose Cancel.")
        );
    }

    #[tokio::test]
    async fn test_sync_pages_through_feed() {
        let (pipeline, mut replicator, reader) = setup(2).await;
        replicator.bootstrap().await.unwrap();

        for i in 0..5 {
            pipeline.commit(&format!("k{i}").as_str().into(), "v", 0, "alice").await.unwrap();
        }
        let report = replicator.sync_once().await.unwrap();
        assert_eq!(report.events, 5);
        assert_eq!(report.applied, 5);
        assert_eq!(replicator.cursor(), 5);
        assert_eq!(reader.status().entries, 5);
    }

    #[tokio::test]
    async fn test_invalidation_propagates_as_miss() {
        let (pipeline, mut replicator, reader) = setup(500).await;
        pipeline.commit(&"k".into(), "v1", 0, "alice").await.unwrap();
        replicator.sync_once().await.unwrap();
        assert!(reader.get(&"k".into()).await.unwrap().is_some());

        pipeline.invalidate(&"k".into(), "bob", 1).await.unwrap();
        replicator.sync_once().await.unwrap();
        assert!(reader.get(&"k".into()).await.unwrap().is_none());
        assert_eq!(reader.applied_version(&"k".into()), 2);
    }

    #[tokio::test]
    async fn test_purged_history_replays_as_removal() {
        let (pipeline, mut replicator, reader) = setup(500).await;
        pipeline.commit(&"k".into(), "v1", 0, "alice").await.unwrap();
        pipeline.invalidate(&"k".into(), "bob", 1).await.unwrap();
        pipeline.purge_expired().await.unwrap();
        pipeline.commit(&"k".into(), "v3", 2, "alice").await.unwrap();

        replicator.sync_once().await.unwrap();
        assert_eq!(reader.get(&"k".into()).await.unwrap().as_deref(), Some("v3"));
        assert_eq!(reader.applied_version(&"k".into()), 3);
    }

    #[tokio::test]
    async fn test_spawned_loop_stops_on_shutdown() {
        let (pipeline, replicator, reader) = setup(500).await;
        pipeline.commit(&"k".into(), "v1", 0, "alice").await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = replicator.spawn(rx);

        let mut served = false;
        for _ in 0..50 {
            if reader.get(&"k".into()).await.unwrap().is_some() {
                served = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(served);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
