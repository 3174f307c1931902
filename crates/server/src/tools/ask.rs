//! ask tool implementation.
//!
//! Runs one request through the serving path and returns the envelope.

use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use vetcache_client::{Envelope, Orchestrator};
use vetcache_core::{EntityMap, Error};

use super::json_result;

/// Parameters for the ask tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AskParams {
    /// Raw request text.
    pub text: String,
}

/// Output from the ask tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AskOutput {
    /// Canonical key the request normalized to.
    pub key: String,
    /// Answer text.
    pub text: String,
    /// Entities pulled from this request only.
    pub entities: EntityMap,
    /// Tier label, `FALLBACK` or `FALLBACK_DEGRADED`.
    pub source: String,
    pub latency_ms: u64,
}

impl From<Envelope> for AskOutput {
    fn from(envelope: Envelope) -> Self {
        Self {
            key: envelope.key.to_string(),
            text: envelope.text,
            entities: envelope.entities,
            source: envelope.source.as_str().to_string(),
            latency_ms: envelope.latency_ms,
        }
    }
}

/// Implementation of the ask tool.
pub async fn ask_impl(orchestrator: &Orchestrator, params: AskParams) -> Result<CallToolResult, McpError> {
    if params.text.trim().is_empty() {
        return Err(Error::InvalidInput("text cannot be empty".into()).into());
    }

    let envelope = orchestrator.handle(&params.text).await;
    json_result(&AskOutput::from(envelope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{fixture, parse_output};
    use vetcache_core::CanonicalKey;

    #[tokio::test]
    async fn test_ask_serves_replicated_answer() {
        let mut fx = fixture().await;
        fx.pipeline
            .commit(&CanonicalKey::new("cancel_order"), "Open Orders and press Cancel.", 0, "alice")
            .await
            .unwrap();
        fx.replicator.sync_once().await.unwrap();

        let result = ask_impl(&fx.orchestrator, AskParams { text: "cancel_order".into() }).await.unwrap();
        let output: AskOutput = parse_output(&result);
        assert_eq!(output.key, "cancel_order");
        assert_eq!(output.text, "Open Orders and press Cancel.");
        assert_eq!(output.source, "TIER0");
    }

    #[tokio::test]
    async fn test_ask_miss_without_providers_degrades() {
        let mut fx = fixture().await;
        fx.replicator.sync_once().await.unwrap();

        let result = ask_impl(&fx.orchestrator, AskParams { text: "track_parcel".into() }).await.unwrap();
        let output: AskOutput = parse_output(&result);
        assert_eq!(output.source, "FALLBACK_DEGRADED");
        assert!(!output.text.is_empty());
    }

    #[tokio::test]
    async fn test_ask_empty_text() {
        let fx = fixture().await;
        let result = ask_impl(&fx.orchestrator, AskParams { text: "  ".into() }).await;
        assert!(result.is_err());
    }
}
