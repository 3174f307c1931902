//! Review workflow tools.
//!
//! Drafting collaborators call `submit_candidate`; human reviewers list the
//! queue and decide with `approve`, `commit`, `reject` and `invalidate`.
//! Every decision carries the version the reviewer saw, and a stale one is
//! returned as a `CONCURRENT_MODIFICATION` error for re-review.

use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use vetcache_core::model::QueuedCandidate;
use vetcache_core::{CacheEntry, CanonicalKey, Error, MutationPipeline, PendingCandidate, PolicyScore, SubmitOutcome};

use super::json_result;

const DEFAULT_PENDING_LIMIT: u32 = 50;
const MAX_PENDING_LIMIT: u32 = 500;

/// Parameters for the submit_candidate tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SubmitCandidateParams {
    /// Canonical key the draft answers.
    pub key: String,
    /// Drafted answer text.
    pub draft_value: String,
    /// Automated policy sub-scores for the draft.
    pub policy_score: PolicyScore,
    /// Force human review even if every score clears.
    #[serde(default)]
    pub requires_human: bool,
}

/// Output from the submit_candidate tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SubmitCandidateOutput {
    /// `committed` or `queued`.
    pub outcome: String,
    /// The committed entry, if the draft cleared policy.
    pub entry: Option<CacheEntry>,
    /// Review queue id, if the draft was queued.
    pub pending_id: Option<i64>,
    /// Why the draft was queued.
    pub reason: Option<String>,
}

impl From<SubmitOutcome> for SubmitCandidateOutput {
    fn from(outcome: SubmitOutcome) -> Self {
        match outcome {
            SubmitOutcome::Committed(entry) => {
                Self { outcome: "committed".into(), entry: Some(entry), pending_id: None, reason: None }
            }
            SubmitOutcome::Queued { id, reason } => {
                Self { outcome: "queued".into(), entry: None, pending_id: Some(id), reason: Some(reason) }
            }
        }
    }
}

/// Parameters for the list_pending tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ListPendingParams {
    /// Maximum candidates to return (default 50, max 500).
    pub limit: Option<u32>,
}

/// Output from the list_pending tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ListPendingOutput {
    /// Oldest first.
    pub candidates: Vec<QueuedCandidate>,
}

/// Parameters for the approve tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApproveParams {
    /// Review queue id.
    pub id: i64,
    /// Identity of the human approver.
    pub approver: String,
    /// Current version the approver reviewed against (0 if the key had no entry).
    pub expected_version: u64,
}

/// Parameters for the commit tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CommitParams {
    pub key: String,
    /// Reviewed answer text.
    pub value: String,
    /// Identity of the human approver.
    pub approver: String,
    /// Current version the approver reviewed against (0 if the key had no entry).
    pub expected_version: u64,
}

/// Parameters for the reject tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RejectParams {
    /// Review queue id.
    pub id: i64,
    /// Identity of the human reviewer.
    pub approver: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Output from the reject tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RejectOutput {
    pub id: i64,
    pub rejected: bool,
}

/// Parameters for the invalidate tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InvalidateParams {
    pub key: String,
    /// Identity of the human approver.
    pub approver: String,
    /// Current version the approver reviewed against.
    pub expected_version: u64,
}

/// Output for tools that write one entry version.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EntryOutput {
    pub entry: CacheEntry,
}

/// Implementation of the submit_candidate tool.
pub async fn submit_impl(
    pipeline: &MutationPipeline, params: SubmitCandidateParams,
) -> Result<CallToolResult, McpError> {
    let candidate = PendingCandidate {
        key: CanonicalKey::new(params.key),
        draft_value: params.draft_value,
        policy_score: params.policy_score,
        requires_human: params.requires_human,
        failure_reason: None,
    };
    let outcome = pipeline.submit(candidate).await?;
    json_result(&SubmitCandidateOutput::from(outcome))
}

/// Implementation of the list_pending tool.
pub async fn list_pending_impl(
    pipeline: &MutationPipeline, params: ListPendingParams,
) -> Result<CallToolResult, McpError> {
    let limit = params.limit.unwrap_or(DEFAULT_PENDING_LIMIT);
    if limit == 0 || limit > MAX_PENDING_LIMIT {
        return Err(Error::InvalidInput(format!("limit must be between 1 and {MAX_PENDING_LIMIT}")).into());
    }

    let candidates = pipeline.pending(limit).await?;
    json_result(&ListPendingOutput { candidates })
}

/// Implementation of the approve tool.
pub async fn approve_impl(pipeline: &MutationPipeline, params: ApproveParams) -> Result<CallToolResult, McpError> {
    let entry = pipeline.approve(params.id, &params.approver, params.expected_version).await?;
    json_result(&EntryOutput { entry })
}

/// Implementation of the commit tool.
pub async fn commit_impl(pipeline: &MutationPipeline, params: CommitParams) -> Result<CallToolResult, McpError> {
    let key = CanonicalKey::new(params.key);
    let entry = pipeline
        .commit(&key, &params.value, params.expected_version, &params.approver)
        .await?;
    json_result(&EntryOutput { entry })
}

/// Implementation of the reject tool.
pub async fn reject_impl(pipeline: &MutationPipeline, params: RejectParams) -> Result<CallToolResult, McpError> {
    let reason = params.reason.as_deref().unwrap_or("rejected by reviewer");
    pipeline.reject(params.id, &params.approver, reason).await?;
    json_result(&RejectOutput { id: params.id, rejected: true })
}

/// Implementation of the invalidate tool.
pub async fn invalidate_impl(
    pipeline: &MutationPipeline, params: InvalidateParams,
) -> Result<CallToolResult, McpError> {
    let key = CanonicalKey::new(params.key);
    let entry = pipeline
        .invalidate(&key, &params.approver, params.expected_version)
        .await?;
    json_result(&EntryOutput { entry })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{fixture, parse_output};
    use vetcache_core::model::{AUTO_APPROVER, EntryStatus};

    fn clear_score() -> PolicyScore {
        PolicyScore { sensitive_data: 0.0, genericness: 0.9, actionability: 0.9, safety: 1.0 }
    }

    fn submit(key: &str, score: PolicyScore) -> SubmitCandidateParams {
        SubmitCandidateParams {
            key: key.into(),
            draft_value: format!("answer for {key}"),
            policy_score: score,
            requires_human: false,
        }
    }

    #[tokio::test]
    async fn test_submit_clear_commits_as_auto() {
        let fx = fixture().await;
        let result = submit_impl(&fx.pipeline, submit("reset_password", clear_score()))
            .await
            .unwrap();
        let output: SubmitCandidateOutput = parse_output(&result);
        assert_eq!(output.outcome, "committed");
        let entry = output.entry.unwrap();
        assert_eq!(entry.version, 1);
        assert_eq!(entry.approved_by, AUTO_APPROVER);
    }

    #[tokio::test]
    async fn test_review_flow_queue_then_approve() {
        let fx = fixture().await;
        let risky = PolicyScore { sensitive_data: 0.8, ..clear_score() };
        let result = submit_impl(&fx.pipeline, submit("cancel_order", risky)).await.unwrap();
        let output: SubmitCandidateOutput = parse_output(&result);
        assert_eq!(output.outcome, "queued");
        let id = output.pending_id.unwrap();

        let result = list_pending_impl(&fx.pipeline, ListPendingParams::default()).await.unwrap();
        let pending: ListPendingOutput = parse_output(&result);
        assert_eq!(pending.candidates.len(), 1);
        assert_eq!(pending.candidates[0].id, id);
        assert!(pending.candidates[0].candidate.failure_reason.is_some());

        let params = ApproveParams { id, approver: "alice".into(), expected_version: 0 };
        let result = approve_impl(&fx.pipeline, params).await.unwrap();
        let approved: EntryOutput = parse_output(&result);
        assert_eq!(approved.entry.version, 1);
        assert_eq!(approved.entry.approved_by, "alice");

        let result = list_pending_impl(&fx.pipeline, ListPendingParams::default()).await.unwrap();
        let pending: ListPendingOutput = parse_output(&result);
        assert!(pending.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_stale_commit_surfaces_conflict() {
        let fx = fixture().await;
        let first = CommitParams {
            key: "cancel_order".into(),
            value: "v1".into(),
            approver: "alice".into(),
            expected_version: 0,
        };
        commit_impl(&fx.pipeline, first.clone()).await.unwrap();

        let stale = CommitParams { approver: "bob".into(), value: "v1 edited".into(), ..first };
        let err = commit_impl(&fx.pipeline, stale).await.unwrap_err();
        assert_eq!(err.code.0, -32009);
    }

    #[tokio::test]
    async fn test_reject_removes_candidate() {
        let fx = fixture().await;
        let queued = SubmitCandidateParams { requires_human: true, ..submit("refund_status", clear_score()) };
        let result = submit_impl(&fx.pipeline, queued).await.unwrap();
        let id = parse_output::<SubmitCandidateOutput>(&result).pending_id.unwrap();

        let params = RejectParams { id, approver: "alice".into(), reason: None };
        let result = reject_impl(&fx.pipeline, params.clone()).await.unwrap();
        let output: RejectOutput = parse_output(&result);
        assert!(output.rejected);

        let err = reject_impl(&fx.pipeline, params).await.unwrap_err();
        assert_eq!(err.code.0, -32001);
    }

    #[tokio::test]
    async fn test_invalidate_writes_invalid_version() {
        let fx = fixture().await;
        let params = CommitParams {
            key: "cancel_order".into(),
            value: "v1".into(),
            approver: "alice".into(),
            expected_version: 0,
        };
        commit_impl(&fx.pipeline, params).await.unwrap();

        let params = InvalidateParams { key: "cancel_order".into(), approver: "alice".into(), expected_version: 1 };
        let result = invalidate_impl(&fx.pipeline, params).await.unwrap();
        let output: EntryOutput = parse_output(&result);
        assert_eq!(output.entry.version, 2);
        assert_eq!(output.entry.status, EntryStatus::Invalid);
    }

    #[tokio::test]
    async fn test_auto_approver_is_reserved() {
        let fx = fixture().await;
        let params = CommitParams {
            key: "cancel_order".into(),
            value: "v1".into(),
            approver: AUTO_APPROVER.into(),
            expected_version: 0,
        };
        let err = commit_impl(&fx.pipeline, params).await.unwrap_err();
        assert_eq!(err.code.0, -32602);
    }

    #[tokio::test]
    async fn test_list_pending_limit_bounds() {
        let fx = fixture().await;
        assert!(list_pending_impl(&fx.pipeline, ListPendingParams { limit: Some(0) }).await.is_err());
        assert!(
            list_pending_impl(&fx.pipeline, ListPendingParams { limit: Some(MAX_PENDING_LIMIT + 1) })
                .await
                .is_err()
        );
    }
}
