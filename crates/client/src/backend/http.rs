//! JSON-over-HTTP backend provider.
//!
//! ### Wire format
//!
//! - **Request**: `POST {endpoint}` with body `{"input": "...", "model": "..."}`
//! - **Authentication**: `Authorization: Bearer <api_key>` when a key is configured
//! - **Response**: `{"text": "..."}`
//!
//! ### Status mapping
//!
//! | Status                         | Error                     |
//! |--------------------------------|---------------------------|
//! | 429                            | `RateLimited`             |
//! | 502, 504, timeout              | `Transient`               |
//! | 503, 401, 403, connect failure | `Unavailable` / `Network` |
//! | other 4xx/5xx                  | `Unavailable`             |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, header};
use serde::{Deserialize, Serialize};
use url::Url;
use vetcache_core::config::ProviderConfig;

use super::{Backend, BackendError, CallOptions};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

const DEFAULT_USER_AGENT: &str = "vetcache/0.1";

/// HTTP backend configuration.
#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    pub id: String,
    pub endpoint: Url,
    pub api_key: Option<String>,
    pub model: Option<String>,
    /// Transport-level timeout; the invoker applies its own per-call budget as well.
    pub timeout: Duration,
    pub user_agent: String,
}

impl HttpBackendConfig {
    /// Build from a provider entry in the application config.
    pub fn from_provider(provider: &ProviderConfig) -> Result<Self, BackendError> {
        let endpoint = Url::parse(&provider.endpoint)
            .map_err(|e| BackendError::Unavailable(format!("invalid endpoint for {}: {e}", provider.id)))?;
        Ok(Self {
            id: provider.id.clone(),
            endpoint,
            api_key: provider.api_key.clone(),
            model: provider.model.clone(),
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    input: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    text: String,
}

/// Map a non-success status to the error the invoker acts on.
fn status_error(status: StatusCode) -> BackendError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => BackendError::RateLimited,
        StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => {
            BackendError::Transient(format!("HTTP {}", status.as_u16()))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BackendError::Unavailable(format!("authentication failed (HTTP {})", status.as_u16()))
        }
        _ => BackendError::Unavailable(format!("HTTP {}", status.as_u16())),
    }
}

/// Backend reached over HTTP with a JSON body.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
    config: Arc<HttpBackendConfig>,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| BackendError::Network(Arc::new(e)))?;
        Ok(Self { http, config: Arc::new(config) })
    }

    pub fn from_provider(provider: &ProviderConfig) -> Result<Self, BackendError> {
        Self::new(HttpBackendConfig::from_provider(provider)?)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn call(&self, raw_text: &str, options: &CallOptions) -> Result<String, BackendError> {
        let body = CompletionRequest {
            input: raw_text,
            model: options.model.as_deref().or(self.config.model.as_deref()),
        };

        let mut request = self
            .http
            .post(self.config.endpoint.clone())
            .header(header::ACCEPT, "application/json")
            .json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        tracing::debug!(provider = %self.config.id, status = status.as_u16(), "backend responded");

        if !status.is_success() {
            return Err(status_error(status));
        }

        let bytes = response.bytes().await?;
        let parsed: CompletionResponse =
            serde_json::from_slice(&bytes).map_err(|e| BackendError::Parse(e.to_string()))?;
        Ok(parsed.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendErrorKind;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_error(StatusCode::TOO_MANY_REQUESTS).kind(), BackendErrorKind::RateLimited);
        assert_eq!(status_error(StatusCode::BAD_GATEWAY).kind(), BackendErrorKind::Transient);
        assert_eq!(status_error(StatusCode::GATEWAY_TIMEOUT).kind(), BackendErrorKind::Transient);
        assert_eq!(status_error(StatusCode::SERVICE_UNAVAILABLE).kind(), BackendErrorKind::Unavailable);
        assert_eq!(status_error(StatusCode::UNAUTHORIZED).kind(), BackendErrorKind::Unavailable);
        assert_eq!(status_error(StatusCode::BAD_REQUEST).kind(), BackendErrorKind::Unavailable);
    }

    #[test]
    fn test_from_provider_rejects_bad_endpoint() {
        let provider = ProviderConfig {
            id: "primary".into(),
            endpoint: "not a url".into(),
            api_key: None,
            model: None,
        };
        assert!(matches!(HttpBackendConfig::from_provider(&provider), Err(BackendError::Unavailable(_))));
    }

    #[test]
    fn test_request_body_omits_missing_model() {
        let body = CompletionRequest { input: "hello", model: None };
        assert_eq!(serde_json::to_string(&body).unwrap(), r#"{"input":"hello"}"#);
    }

    #[tokio::test]
    async fn test_connection_failure_is_unavailable() {
        let provider = ProviderConfig {
            id: "local".into(),
            endpoint: "http://127.0.0.1:9/complete".into(),
            api_key: Some("secret".into()),
            model: Some("small".into()),
        };
        let backend = HttpBackend::from_provider(&provider).unwrap();
        assert_eq!(backend.id(), "local");

        let err = backend.call("hello", &CallOptions::default()).await.unwrap_err();
        assert!(matches!(err, BackendError::Network(_)));
        assert_eq!(err.kind(), BackendErrorKind::Unavailable);
    }
}
