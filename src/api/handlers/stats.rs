//! Aggregated statistics endpoints

use axum::extract::{Query, State};
use axum::response::Response;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Deserialize;

use super::ApiState;
use crate::api::envelope::{ApiErrorResponse, ApiResponse};
use crate::config::defaults::DEFAULT_BUCKETS;

#[derive(Debug, Deserialize)]
pub struct RequestStatsQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub buckets: Option<u32>,
}

/// GET /api/v1/stats/requests?start=&end=&buckets=
///
/// Defaults to the last 24 hours in [`DEFAULT_BUCKETS`] buckets.
pub async fn request_stats(State(state): State<ApiState>, Query(query): Query<RequestStatsQuery>) -> Response {
    let end = query.end.unwrap_or_else(Utc::now);
    let start = query.start.unwrap_or(end - Duration::hours(24));
    let buckets = query.buckets.unwrap_or(DEFAULT_BUCKETS);
    match state.stats.requests(start, end, buckets) {
        Ok(stats) => ApiResponse::ok(stats),
        Err(e) => ApiErrorResponse::stats(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CapacityStatsQuery {
    /// `YYYY-MM-DD`, UTC. Defaults to today.
    pub day: Option<NaiveDate>,
    pub provider: Option<String>,
    pub buckets: Option<u32>,
}

/// GET /api/v1/stats/capacity?day=&provider=&buckets=
pub async fn capacity_stats(State(state): State<ApiState>, Query(query): Query<CapacityStatsQuery>) -> Response {
    let day = query.day.unwrap_or_else(|| Utc::now().date_naive());
    let buckets = query.buckets.unwrap_or(DEFAULT_BUCKETS);
    match state.stats.capacity_day(day, query.provider.as_deref(), buckets) {
        Ok(view) => ApiResponse::ok(view),
        Err(e) => ApiErrorResponse::stats(&e),
    }
}
