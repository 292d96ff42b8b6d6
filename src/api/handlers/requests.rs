//! Request submission and ledger lookups

use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::ApiState;
use crate::api::envelope::{ApiErrorResponse, ApiResponse};
use crate::dispatch::SubmitRequest;
use crate::types::{RequestEvent, RequestState};

#[derive(Debug, Deserialize)]
pub struct SubmitQuery {
    /// Hold the connection until the request is terminal
    #[serde(default = "default_wait")]
    pub wait: bool,
}

fn default_wait() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct SubmitAccepted {
    pub request_id: String,
    pub state: RequestState,
}

#[derive(Debug, Serialize)]
pub struct SubmitCompleted {
    /// Id the caller submitted under
    pub request_id: String,
    /// Terminal row of the final attempt (a failover has its own id)
    pub event: RequestEvent,
    pub output: Option<serde_json::Value>,
}

/// POST /api/v1/requests
pub async fn submit_request(
    State(state): State<ApiState>,
    Query(query): Query<SubmitQuery>,
    Json(request): Json<SubmitRequest>,
) -> Response {
    let ticket = match state.scheduler.submit(request) {
        Ok(ticket) => ticket,
        Err(e) => return ApiErrorResponse::scheduler(&e),
    };

    if !query.wait {
        return ApiResponse::accepted(SubmitAccepted {
            request_id: ticket.request_id,
            state: ticket.state,
        });
    }

    match ticket.outcome.await {
        Ok(outcome) => ApiResponse::ok(SubmitCompleted {
            request_id: ticket.request_id,
            event: outcome.event,
            output: outcome.output,
        }),
        Err(_) => ApiErrorResponse::service_unavailable(format!(
            "request {} was not completed before shutdown",
            ticket.request_id
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/requests/latest?limit=N - newest first
pub async fn latest_requests(State(state): State<ApiState>, Query(query): Query<LatestQuery>) -> Response {
    let max = state.config.ledger.latest_limit_max;
    let limit = query.limit.unwrap_or(50).clamp(1, max.max(1));
    match state.ledger.latest(limit) {
        Ok(events) => ApiResponse::ok(events),
        Err(e) => ApiErrorResponse::ledger(&e),
    }
}

/// GET /api/v1/requests/:id - current row for one request
pub async fn get_request(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.ledger.get(&id) {
        Ok(Some(event)) => ApiResponse::ok(event),
        Ok(None) => ApiErrorResponse::not_found(format!("unknown request '{id}'")),
        Err(e) => ApiErrorResponse::ledger(&e),
    }
}
