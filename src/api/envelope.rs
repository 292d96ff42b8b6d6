//! Consistent response envelope for all API endpoints.
//!
//! Every response is wrapped in either [`ApiResponse`] (success) or
//! [`ApiErrorResponse`] (error), ensuring a uniform JSON shape. Domain errors
//! map onto status codes here so handlers can stay `?`-free.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Serialize;

use crate::catalog::CatalogError;
use crate::dispatch::SchedulerError;
use crate::ledger::LedgerError;
use crate::stats::StatsError;

/// Metadata included in every response.
#[derive(Debug, Serialize)]
pub struct ResponseMeta {
    pub timestamp: String,
    pub version: &'static str,
}

impl Default for ResponseMeta {
    fn default() -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            version: "1",
        }
    }
}

/// Successful response: `{ "data": T, "meta": { ... } }`
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub data: T,
    pub meta: ResponseMeta,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn with_status(status: StatusCode, data: T) -> Response {
        let body = Self {
            data,
            meta: ResponseMeta::default(),
        };
        (status, axum::Json(body)).into_response()
    }

    pub fn ok(data: T) -> Response {
        Self::with_status(StatusCode::OK, data)
    }

    pub fn created(data: T) -> Response {
        Self::with_status(StatusCode::CREATED, data)
    }

    pub fn accepted(data: T) -> Response {
        Self::with_status(StatusCode::ACCEPTED, data)
    }
}

/// Error detail inside [`ApiErrorResponse`].
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// Error response: `{ "error": { "code": "...", "message": "..." }, "meta": { ... } }`
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub error: ErrorDetail,
    pub meta: ResponseMeta,
}

impl ApiErrorResponse {
    pub fn build(status: StatusCode, code: &str, msg: impl Into<String>) -> Response {
        let body = Self {
            error: ErrorDetail {
                code: code.to_string(),
                message: msg.into(),
            },
            meta: ResponseMeta::default(),
        };
        (status, axum::Json(body)).into_response()
    }

    pub fn not_found(msg: impl Into<String>) -> Response {
        Self::build(StatusCode::NOT_FOUND, "NOT_FOUND", msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Response {
        Self::build(StatusCode::BAD_REQUEST, "BAD_REQUEST", msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Response {
        Self::build(StatusCode::CONFLICT, "CONFLICT", msg)
    }

    pub fn internal(msg: impl Into<String>) -> Response {
        Self::build(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg)
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Response {
        Self::build(StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", msg)
    }

    /// Catalog write and delete failures.
    pub fn catalog(err: &CatalogError) -> Response {
        match err {
            CatalogError::UnknownModel(_) | CatalogError::UnknownPolicy(_) => {
                Self::not_found(err.to_string())
            }
            CatalogError::ProviderImmutable(_) | CatalogError::InUse { .. } => {
                Self::conflict(err.to_string())
            }
            CatalogError::Storage(_) => Self::internal(err.to_string()),
            _ => Self::build(StatusCode::UNPROCESSABLE_ENTITY, "INVALID_CATALOG", err.to_string()),
        }
    }

    pub fn scheduler(err: &SchedulerError) -> Response {
        match err {
            SchedulerError::Rejected { reason, .. } => Self::build(
                StatusCode::UNPROCESSABLE_ENTITY,
                &reason.code().to_uppercase(),
                err.to_string(),
            ),
            SchedulerError::Closed => Self::service_unavailable(err.to_string()),
        }
    }

    pub fn ledger(err: &LedgerError) -> Response {
        Self::service_unavailable(err.to_string())
    }

    pub fn stats(err: &StatsError) -> Response {
        match err {
            StatsError::InvalidRange(_) => Self::bad_request(err.to_string()),
            StatsError::Ledger(_) | StatsError::Storage(_) => Self::service_unavailable(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RejectReason;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_ok_response_shape() {
        let resp = ApiResponse::ok(serde_json::json!({"hello": "world"}));
        assert_eq!(resp.status(), StatusCode::OK);

        let v = body_json(resp).await;
        assert!(v.get("data").is_some());
        assert_eq!(v["meta"]["version"], "1");
    }

    #[tokio::test]
    async fn test_rejection_carries_reason_code() {
        let resp = ApiErrorResponse::scheduler(&SchedulerError::Rejected {
            request_id: "r1".into(),
            reason: RejectReason::NoTagMatch,
        });
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let v = body_json(resp).await;
        assert_eq!(v["error"]["code"], "NO_TAG_MATCH");
    }

    #[tokio::test]
    async fn test_catalog_conflicts() {
        let resp = ApiErrorResponse::catalog(&CatalogError::InUse {
            id: "m".into(),
            by: "policy 'p'".into(),
        });
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let resp = ApiErrorResponse::catalog(&CatalogError::UnknownPolicy("p".into()));
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
