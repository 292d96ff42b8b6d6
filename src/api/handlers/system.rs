//! System health and dispatch occupancy

use axum::extract::State;
use axum::response::Response;
use chrono::Utc;
use serde::Serialize;

use super::ApiState;
use crate::api::envelope::ApiResponse;
use crate::health::SystemHealth;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    #[serde(flatten)]
    pub health: SystemHealth,
    pub uptime_secs: i64,
}

/// GET /api/v1/system/health
///
/// Always 200: degraded observability never means the scheduler is down.
pub async fn system_health(State(state): State<ApiState>) -> Response {
    let health = SystemHealth::collect(
        &state.catalog.snapshot(),
        &state.board,
        state.ledger.health(),
        state.config.capacity.stale_after_secs,
    );
    ApiResponse::ok(HealthResponse {
        health,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

/// GET /api/v1/system/lanes - queued and in-flight counts per model
pub async fn lane_status(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.scheduler.lane_status())
}
