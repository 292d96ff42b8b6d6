//! Model execution.
//!
//! The dispatch queue hands a scheduled request to a [`ModelExecutor`]. The
//! HTTP executor posts the request payload to the model endpoint and reports
//! any rate-limit headers back so the provider's quota stays current.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::capacity::quota_from_headers;
use crate::types::{Model, Provider};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("{0}")]
    Failed(String),
}

/// Remaining-quota figures observed on a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaHint {
    pub remaining_requests: Option<i64>,
    pub remaining_tokens: Option<i64>,
}

impl QuotaHint {
    pub fn is_empty(&self) -> bool {
        self.remaining_requests.is_none() && self.remaining_tokens.is_none()
    }
}

/// What a model run produced.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutput {
    pub body: serde_json::Value,
    pub quota: QuotaHint,
}

/// Everything an executor needs for one call.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub request_id: String,
    pub provider: Provider,
    pub model: Model,
    pub payload: serde_json::Value,
}

/// Failure detail plus whatever quota the provider reported with it.
#[derive(Debug)]
pub struct ExecutionFailure {
    pub error: ExecutionError,
    pub quota: QuotaHint,
}

impl From<ExecutionError> for ExecutionFailure {
    fn from(error: ExecutionError) -> Self {
        Self {
            error,
            quota: QuotaHint::default(),
        }
    }
}

#[async_trait]
pub trait ModelExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, ExecutionFailure>;
}

/// Executes requests over HTTP. Deadlines are enforced by the dispatch
/// queue, so the client itself only bounds connection setup.
#[derive(Clone)]
pub struct HttpExecutor {
    http: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(connect_timeout: Duration) -> Result<Self, ExecutionError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ModelExecutor for HttpExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, ExecutionFailure> {
        let url = request.provider.url(&request.model.endpoint_path);
        let mut req = self
            .http
            .post(url)
            .header("X-Request-ID", &request.request_id)
            .json(&request.payload);
        if let Some(token) = request.provider.resolve_credential() {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(ExecutionError::from)?;
        let (remaining_requests, remaining_tokens) = quota_from_headers(resp.headers());
        let quota = QuotaHint {
            remaining_requests,
            remaining_tokens,
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExecutionFailure {
                error: ExecutionError::Status {
                    status: status.as_u16(),
                    body: body.chars().take(512).collect(),
                },
                quota,
            });
        }

        let body = resp
            .json::<serde_json::Value>()
            .await
            .map_err(|e| ExecutionFailure {
                error: ExecutionError::Http(e),
                quota,
            })?;
        Ok(ExecutionOutput { body, quota })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PerCriterion, PrivacyClass, ProviderKind};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};

    /// Serve `app` on an ephemeral port and return its base URL.
    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn request_for(base_url: String) -> ExecutionRequest {
        ExecutionRequest {
            request_id: "req-1".into(),
            provider: Provider {
                id: "acme".into(),
                name: "Acme".into(),
                kind: ProviderKind::RateLimited,
                base_url,
                credential_ref: None,
                capacity_mb: None,
            },
            model: Model {
                id: "gpt".into(),
                provider_id: "acme".into(),
                endpoint_path: "/v1/chat/completions".into(),
                tags: Default::default(),
                max_parallel: 1,
                privacy: PrivacyClass::CloudInRegionTrusted,
                footprint_mb: None,
                better_than: PerCriterion::default(),
            },
            payload: serde_json::json!({ "prompt": "hi" }),
        }
    }

    #[tokio::test]
    async fn test_success_returns_body_and_quota() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
                let id = headers
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                (
                    [("x-ratelimit-remaining-requests", "41"), ("x-ratelimit-remaining-tokens", "9000")],
                    Json(serde_json::json!({ "id": id, "echo": body })),
                )
            }),
        );
        let base = serve(app).await;

        let executor = HttpExecutor::new(Duration::from_secs(2)).unwrap();
        let output = executor.execute(request_for(base)).await.unwrap();
        assert_eq!(output.body["id"], "req-1");
        assert_eq!(output.body["echo"]["prompt"], "hi");
        assert_eq!(output.quota.remaining_requests, Some(41));
        assert_eq!(output.quota.remaining_tokens, Some(9000));
    }

    #[tokio::test]
    async fn test_error_status_keeps_reported_quota() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [("x-ratelimit-remaining-requests", "0")],
                    "slow down",
                )
            }),
        );
        let base = serve(app).await;

        let executor = HttpExecutor::new(Duration::from_secs(2)).unwrap();
        let failure = executor.execute(request_for(base)).await.unwrap_err();
        assert!(matches!(failure.error, ExecutionError::Status { status: 429, .. }));
        assert_eq!(failure.quota.remaining_requests, Some(0));
        assert!(!failure.quota.is_empty());
    }
}
