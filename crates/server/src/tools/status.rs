//! audit_log and replica_status tool implementations.

use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use vetcache_client::{Orchestrator, OrchestratorStats};
use vetcache_core::model::AuditRecord;
use vetcache_core::{CacheDb, CanonicalKey, Error, ReplicaReader, ReplicaStatus};

use super::json_result;

const DEFAULT_AUDIT_LIMIT: u32 = 100;
const MAX_AUDIT_LIMIT: u32 = 1000;

/// Parameters for the audit_log tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AuditLogParams {
    /// Only records for this key. Ignores paging when set.
    pub key: Option<String>,
    /// Return records with a sequence number above this one.
    pub after_seq: Option<i64>,
    /// Maximum records to return (default 100, max 1000).
    pub limit: Option<u32>,
}

/// Output from the audit_log tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AuditLogOutput {
    pub records: Vec<AuditRecord>,
    /// Pass as `after_seq` to continue paging.
    pub next_seq: Option<i64>,
}

/// Breaker state of one provider.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitOutput {
    pub provider: String,
    pub state: &'static str,
}

/// Output from the replica_status tool.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaStatusOutput {
    pub replica: ReplicaStatus,
    pub circuits: Vec<CircuitOutput>,
    /// Keys with a fallback call currently in flight.
    pub in_flight: usize,
    pub stats: OrchestratorStats,
}

/// Implementation of the audit_log tool.
pub async fn audit_log_impl(db: &CacheDb, params: AuditLogParams) -> Result<CallToolResult, McpError> {
    let records = match params.key {
        Some(key) if key.trim().is_empty() => {
            return Err(Error::InvalidInput("key cannot be empty".into()).into());
        }
        Some(key) => db.audit_for_key(&CanonicalKey::new(key)).await?,
        None => {
            let limit = params.limit.unwrap_or(DEFAULT_AUDIT_LIMIT);
            if limit == 0 || limit > MAX_AUDIT_LIMIT {
                return Err(Error::InvalidInput(format!("limit must be between 1 and {MAX_AUDIT_LIMIT}")).into());
            }
            db.audit_log(params.after_seq.unwrap_or(0), limit).await?
        }
    };

    let next_seq = records.last().map(|r| r.seq);
    json_result(&AuditLogOutput { records, next_seq })
}

/// Implementation of the replica_status tool.
pub fn replica_status_impl(replica: &ReplicaReader, orchestrator: &Orchestrator) -> Result<CallToolResult, McpError> {
    let circuits = orchestrator
        .fallback()
        .circuit_states()
        .into_iter()
        .map(|(provider, state)| CircuitOutput { provider, state: state.as_str() })
        .collect();

    json_result(&ReplicaStatusOutput {
        replica: replica.status(),
        circuits,
        in_flight: orchestrator.coalescer().in_flight(),
        stats: orchestrator.stats(),
    })
}
