//! Single-writer mutation pipeline.
//!
//! The only path that writes canonical answers into the authoritative store.
//!
//! ### Lifecycle per key
//! `NO_ENTRY -> PENDING_REVIEW -> ACTIVE(vN) -> ACTIVE(vN+1) | INVALID`
//!
//! ### Guarantees
//! - One pipeline per store: a second [`MutationPipeline::open`] fails with
//!   [`Error::WriterTaken`] until the first is dropped.
//! - Every commit is compare-and-swap on the version the caller reviewed.
//!   A stale version is a [`Error::ConcurrentModification`], never an overwrite.
//! - Every commit and invalidation appends one audit record in the same transaction.
//! - Invalidation is soft. Physical removal waits for the grace period.

pub mod policy;

pub use policy::{PolicyVerdict, evaluate};

use chrono::Utc;
use tokio::sync::Mutex;

use crate::Error;
use crate::config::PolicyThresholds;
use crate::model::{AUTO_APPROVER, Approval, CacheEntry, CanonicalKey, PendingCandidate, PolicyScore, QueuedCandidate};
use crate::store::{CacheDb, WriterClaim};
use crate::store::entries::CommitRequest;

/// What happened to a submitted candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Cleared policy and was committed as `AUTO`.
    Committed(CacheEntry),
    /// Parked for human adjudication.
    Queued { id: i64, reason: String },
}

/// The single writer for one authoritative store.
#[derive(Debug)]
pub struct MutationPipeline {
    db: CacheDb,
    policy: PolicyThresholds,
    grace: chrono::Duration,
    write_lock: Mutex<()>,
    _writer: WriterClaim,
}

fn validate_write(key: &CanonicalKey, value: &str) -> Result<(), Error> {
    if key.as_str().trim().is_empty() {
        return Err(Error::InvalidInput("key cannot be empty".into()));
    }
    if key.is_unknown() {
        return Err(Error::InvalidInput("the unknown key cannot hold an answer".into()));
    }
    if value.trim().is_empty() {
        return Err(Error::InvalidInput("value cannot be empty".into()));
    }
    Ok(())
}

fn validate_approver(approver: &str) -> Result<(), Error> {
    if approver.trim().is_empty() {
        return Err(Error::InvalidInput("approver identity is required".into()));
    }
    if approver == AUTO_APPROVER {
        return Err(Error::InvalidInput(format!("{AUTO_APPROVER} is reserved for policy-gated commits")));
    }
    Ok(())
}

/// Highest version a caller may claim to have reviewed; the next version must still fit the store.
const MAX_EXPECTED_VERSION: u64 = i64::MAX as u64 - 1;

fn validate_version(expected_version: u64) -> Result<(), Error> {
    if expected_version > MAX_EXPECTED_VERSION {
        return Err(Error::InvalidInput(format!("expected_version {expected_version} is out of range")));
    }
    Ok(())
}

fn validate_score(score: &PolicyScore) -> Result<(), Error> {
    let fields = [
        ("sensitive_data", score.sensitive_data),
        ("genericness", score.genericness),
        ("actionability", score.actionability),
        ("safety", score.safety),
    ];
    for (name, value) in fields {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(Error::InvalidInput(format!("policy score {name} must be within [0, 1], got {value}")));
        }
    }
    Ok(())
}

impl MutationPipeline {
    /// Claim the writer slot on `db`.
    ///
    /// # Errors
    ///
    /// Returns `Error::WriterTaken` if another pipeline already holds this store.
    pub fn open(db: CacheDb, policy: PolicyThresholds, grace: std::time::Duration) -> Result<Self, Error> {
        let grace = chrono::Duration::from_std(grace)
            .map_err(|e| Error::InvalidInput(format!("invalidation grace out of range: {e}")))?;
        let writer = db.claim_writer()?;
        Ok(Self { db, policy, grace, write_lock: Mutex::new(()), _writer: writer })
    }

    /// Read access to the store this pipeline writes.
    pub fn store(&self) -> &CacheDb {
        &self.db
    }

    /// Accept a drafted candidate.
    ///
    /// Candidates that clear every policy threshold commit automatically
    /// against the version current at submission; everything else, including
    /// an automatic commit that lost a race, is queued for review.
    pub async fn submit(&self, candidate: PendingCandidate) -> Result<SubmitOutcome, Error> {
        validate_write(&candidate.key, &candidate.draft_value)?;
        validate_score(&candidate.policy_score)?;

        let _guard = self.write_lock.lock().await;
        let observed = self.db.current_version(&candidate.key).await?;

        let reason = match evaluate(&candidate, &self.policy) {
            PolicyVerdict::Clear => {
                let request = CommitRequest {
                    key: candidate.key.clone(),
                    value: candidate.draft_value.clone(),
                    expected_version: observed,
                    approval: Approval::Auto { score: candidate.policy_score },
                    now: Utc::now(),
                    consume_pending: None,
                };
                match self.db.commit_entry(request).await {
                    Ok(entry) => {
                        tracing::info!(
                            key = %entry.key,
                            version = entry.version,
                            approver = AUTO_APPROVER,
                            "committed entry"
                        );
                        return Ok(SubmitOutcome::Committed(entry));
                    }
                    Err(e @ Error::ConcurrentModification { .. }) => e.to_string(),
                    Err(e) => return Err(e),
                }
            }
            verdict => verdict.reason().unwrap_or_default(),
        };

        let observed = self.db.current_version(&candidate.key).await?;
        let queued = PendingCandidate { failure_reason: Some(reason.clone()), ..candidate };
        let id = self.db.enqueue_candidate(&queued, observed, Utc::now()).await?;
        tracing::info!(key = %queued.key, id, %reason, "candidate queued for review");
        Ok(SubmitOutcome::Queued { id, reason })
    }

    /// Commit a reviewed value on behalf of a human approver.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConcurrentModification` if `expected_version` is no longer current.
    pub async fn commit(
        &self, key: &CanonicalKey, value: &str, expected_version: u64, approver: &str,
    ) -> Result<CacheEntry, Error> {
        validate_write(key, value)?;
        validate_approver(approver)?;
        validate_version(expected_version)?;

        let _guard = self.write_lock.lock().await;
        let entry = self
            .db
            .commit_entry(CommitRequest {
                key: key.clone(),
                value: value.to_string(),
                expected_version,
                approval: Approval::human(approver),
                now: Utc::now(),
                consume_pending: None,
            })
            .await?;
        tracing::info!(key = %entry.key, version = entry.version, approver, "committed entry");
        Ok(entry)
    }

    /// The review queue, oldest first.
    pub async fn pending(&self, limit: u32) -> Result<Vec<QueuedCandidate>, Error> {
        self.db.list_pending(limit).await
    }

    /// Approve a queued candidate as drafted.
    ///
    /// The candidate leaves the queue only if the commit succeeds; on a
    /// conflict it stays queued for re-review.
    pub async fn approve(&self, id: i64, approver: &str, expected_version: u64) -> Result<CacheEntry, Error> {
        validate_approver(approver)?;
        validate_version(expected_version)?;

        let _guard = self.write_lock.lock().await;
        let queued = self
            .db
            .get_pending(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("pending candidate {id}")))?;
        validate_write(&queued.candidate.key, &queued.candidate.draft_value)?;

        let entry = self
            .db
            .commit_entry(CommitRequest {
                key: queued.candidate.key,
                value: queued.candidate.draft_value,
                expected_version,
                approval: Approval::human(approver),
                now: Utc::now(),
                consume_pending: Some(id),
            })
            .await?;
        tracing::info!(key = %entry.key, version = entry.version, approver, id, "approved candidate");
        Ok(entry)
    }

    /// Drop a queued candidate without committing it.
    pub async fn reject(&self, id: i64, approver: &str, reason: &str) -> Result<(), Error> {
        validate_approver(approver)?;

        let _guard = self.write_lock.lock().await;
        self.db.discard_candidate(id).await?;
        tracing::info!(id, approver, reason, "rejected candidate");
        Ok(())
    }

    /// Soft-invalidate the current entry for `key`.
    ///
    /// Writes version `expected_version + 1` with status `INVALID`; the row is
    /// physically removed by [`purge_expired`](Self::purge_expired) once the
    /// grace period has passed.
    pub async fn invalidate(
        &self, key: &CanonicalKey, approver: &str, expected_version: u64,
    ) -> Result<CacheEntry, Error> {
        validate_approver(approver)?;
        validate_version(expected_version)?;

        let _guard = self.write_lock.lock().await;
        let entry = self
            .db
            .invalidate_entry(key, expected_version, approver, Utc::now(), self.grace)
            .await?;
        tracing::info!(key = %entry.key, version = entry.version, approver, "invalidated entry");
        Ok(entry)
    }

    /// Physically remove invalid entries whose grace period has passed.
    pub async fn purge_expired(&self) -> Result<u64, Error> {
        let _guard = self.write_lock.lock().await;
        let purged = self.db.purge_invalidated(Utc::now()).await?;
        if purged > 0 {
            tracing::info!(purged, "purged invalidated entries");
        }
        Ok(purged)
    }
}
