//! Shared data model for the serving path and the mutation path.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical key reserved for inputs that could not be normalized.
pub const UNKNOWN_KEY: &str = "__unknown__";

/// Approver identity recorded for policy-gated commits.
pub const AUTO_APPROVER: &str = "AUTO";

/// Deterministic identifier collapsing semantically-equivalent requests.
///
/// Identity and equality are purely string-based.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(transparent)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The designated key for inputs no normalizer could place.
    pub fn unknown() -> Self {
        Self(UNKNOWN_KEY.to_string())
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_KEY
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CanonicalKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Named values pulled out of a single request.
///
/// Handed back to the caller only. Never part of a key, a stored value, or a log record.
pub type EntityMap = BTreeMap<String, String>;

/// Lifecycle status of a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Active,
    Invalid,
}

impl EntryStatus {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Invalid => "INVALID",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "INVALID" => Some(Self::Invalid),
            _ => None,
        }
    }
}

/// A versioned canonical answer.
///
/// Written only by the mutation pipeline; immutable once read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CacheEntry {
    pub key: CanonicalKey,
    pub value: String,
    pub version: u64,
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
    pub status: EntryStatus,
    pub content_hash: String,
    /// Set when the entry was soft-invalidated.
    pub invalidated_at: Option<DateTime<Utc>>,
    /// Earliest instant at which an invalid entry may be physically removed.
    pub purge_after: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Only active entries may be served.
    pub fn is_servable(&self) -> bool {
        self.status == EntryStatus::Active
    }

    /// Whether an invalid entry has outlived its grace period.
    pub fn is_purgeable(&self, now: DateTime<Utc>) -> bool {
        self.status == EntryStatus::Invalid && self.purge_after.is_some_and(|at| at <= now)
    }
}

/// Automated policy sub-scores, each in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct PolicyScore {
    /// Likelihood that the draft contains sensitive personal data (lower is better).
    pub sensitive_data: f64,
    /// How well the draft applies to every requester of the key (higher is better).
    pub genericness: f64,
    /// Whether the draft gives the requester something to act on (higher is better).
    pub actionability: f64,
    /// Content safety (higher is better).
    pub safety: f64,
}

/// A drafted answer awaiting a commit decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct PendingCandidate {
    pub key: CanonicalKey,
    pub draft_value: String,
    pub policy_score: PolicyScore,
    #[serde(default)]
    pub requires_human: bool,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// A candidate parked in the human review queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct QueuedCandidate {
    pub id: i64,
    pub candidate: PendingCandidate,
    /// Version of the key's current entry when the candidate was queued (0 if none).
    pub observed_version: u64,
    pub submitted_at: DateTime<Utc>,
}

/// Who authorized a write.
#[derive(Debug, Clone, PartialEq)]
pub enum Approval {
    Human { identity: String },
    Auto { score: PolicyScore },
}

impl Approval {
    pub fn human(identity: impl Into<String>) -> Self {
        Self::Human { identity: identity.into() }
    }

    pub fn approver(&self) -> &str {
        match self {
            Self::Human { identity } => identity,
            Self::Auto { .. } => AUTO_APPROVER,
        }
    }

    pub fn policy_score(&self) -> Option<&PolicyScore> {
        match self {
            Self::Human { .. } => None,
            Self::Auto { score } => Some(score),
        }
    }
}

/// Kind of write recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Commit,
    Invalidate,
}

impl AuditAction {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Commit => "COMMIT",
            Self::Invalidate => "INVALIDATE",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "COMMIT" => Some(Self::Commit),
            "INVALIDATE" => Some(Self::Invalidate),
            _ => None,
        }
    }
}

/// One immutable audit log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct AuditRecord {
    pub seq: i64,
    pub key: CanonicalKey,
    pub version: u64,
    pub action: AuditAction,
    pub content_hash: String,
    pub approver: String,
    pub policy_score: Option<PolicyScore>,
    pub recorded_at: DateTime<Utc>,
}
