//! MCP server handler implementation.
//!
//! This module defines the main server handler that
//! routes tool calls to the appropriate implementations.
use std::sync::Arc;

use crate::tools::ask::{AskParams, ask_impl};
use crate::tools::review::{
    ApproveParams, CommitParams, InvalidateParams, ListPendingParams, RejectParams, SubmitCandidateParams,
    approve_impl, commit_impl, invalidate_impl, list_pending_impl, reject_impl, submit_impl,
};
use crate::tools::status::{AuditLogParams, audit_log_impl, replica_status_impl};

use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::{
        tool::{ToolCallContext, ToolRouter},
        wrapper::Parameters,
    },
    model::{
        CallToolRequestParam, CallToolResult, Implementation, ListToolsResult, PaginatedRequestParam, ProtocolVersion,
        ServerCapabilities, ServerInfo,
    },
    service::{RequestContext, RoleServer},
    tool, tool_router,
};
use vetcache_client::Orchestrator;
use vetcache_core::{MutationPipeline, ReplicaReader};

/// The main MCP server handler for vetcache.
#[derive(Clone)]
pub struct VetcacheServer {
    orchestrator: Arc<Orchestrator>,
    pipeline: Arc<MutationPipeline>,
    replica: ReplicaReader,
    tool_router: ToolRouter<Self>,
}

/// Tool router implementation using the #[tool_router] macro.
#[tool_router]
impl VetcacheServer {
    pub fn new(orchestrator: Arc<Orchestrator>, pipeline: Arc<MutationPipeline>, replica: ReplicaReader) -> Self {
        Self { orchestrator, pipeline, replica, tool_router: Self::tool_router() }
    }

    #[tool(description = "Answer a request from the canonical cache, falling back to a generative provider on a miss. \
                          Returns the canonical key, answer text, per-request entities and the answer source.")]
    async fn ask(&self, params: Parameters<AskParams>) -> Result<CallToolResult, McpError> {
        ask_impl(&self.orchestrator, params.0).await
    }

    #[tool(description = "Submit a drafted canonical answer with its policy scores. \
                          Drafts that clear every policy threshold commit automatically; \
                          the rest are queued for review.")]
    async fn submit_candidate(&self, params: Parameters<SubmitCandidateParams>) -> Result<CallToolResult, McpError> {
        submit_impl(&self.pipeline, params.0).await
    }

    #[tool(description = "List drafts waiting for human review, oldest first.")]
    async fn list_pending(&self, params: Parameters<ListPendingParams>) -> Result<CallToolResult, McpError> {
        list_pending_impl(&self.pipeline, params.0).await
    }

    #[tool(description = "Approve a queued draft as written. expected_version must be the current version you \
                          reviewed; a stale version fails with CONCURRENT_MODIFICATION.")]
    async fn approve(&self, params: Parameters<ApproveParams>) -> Result<CallToolResult, McpError> {
        approve_impl(&self.pipeline, params.0).await
    }

    #[tool(description = "Commit a reviewed answer for a key. expected_version must be the current version you \
                          reviewed (0 for a new key); a stale version fails with CONCURRENT_MODIFICATION.")]
    async fn commit(&self, params: Parameters<CommitParams>) -> Result<CallToolResult, McpError> {
        commit_impl(&self.pipeline, params.0).await
    }

    #[tool(description = "Reject a queued draft without committing it.")]
    async fn reject(&self, params: Parameters<RejectParams>) -> Result<CallToolResult, McpError> {
        reject_impl(&self.pipeline, params.0).await
    }

    #[tool(description = "Invalidate the current answer for a key. The key misses immediately after replication; \
                          the entry is removed once its grace period passes.")]
    async fn invalidate(&self, params: Parameters<InvalidateParams>) -> Result<CallToolResult, McpError> {
        invalidate_impl(&self.pipeline, params.0).await
    }

    #[tool(description = "Read the append-only audit log, paged by sequence number or filtered to one key.")]
    async fn audit_log(&self, params: Parameters<AuditLogParams>) -> Result<CallToolResult, McpError> {
        audit_log_impl(self.pipeline.store(), params.0).await
    }

    #[tool(description = "Report edge replica lag and health, provider circuit states and serving counters.")]
    async fn replica_status(&self) -> Result<CallToolResult, McpError> {
        replica_status_impl(&self.replica, &self.orchestrator)
    }
}

impl ServerHandler for VetcacheServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "vetcache".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                ..Default::default()
            },
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self, _request: Option<PaginatedRequestParam>, _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, rmcp::model::ErrorData> {
        Ok(ListToolsResult { meta: None, tools: self.tool_router.list_all(), next_cursor: None })
    }

    async fn call_tool(
        &self, request: CallToolRequestParam, context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, rmcp::model::ErrorData> {
        self.tool_router
            .call(ToolCallContext::new(self, request, context))
            .await
    }
}
