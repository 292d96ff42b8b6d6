//! API route table.

use axum::routing::{delete, get, post};
use axum::Router;

use super::feed;
use super::handlers::{self, ApiState};

/// Build the `/api/v1` router.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/system/health", get(handlers::system_health))
        .route("/system/lanes", get(handlers::lane_status))
        // Catalog
        .route("/providers", get(handlers::list_providers).post(handlers::create_provider))
        .route("/providers/:id", delete(handlers::delete_provider))
        .route("/providers/:id/credential", post(handlers::rotate_credential))
        .route("/models", get(handlers::list_models).post(handlers::upsert_model))
        .route("/models/:id", delete(handlers::delete_model))
        .route("/policies", get(handlers::list_policies).post(handlers::upsert_policy))
        .route("/policies/:id", delete(handlers::delete_policy))
        // Requests (latest before parameterized route to avoid capture)
        .route("/requests", post(handlers::submit_request))
        .route("/requests/latest", get(handlers::latest_requests))
        .route("/requests/:id", get(handlers::get_request))
        // Stats
        .route("/stats/requests", get(handlers::request_stats))
        .route("/stats/capacity", get(handlers::capacity_stats))
        .route("/feed", get(feed::feed_handler))
        .with_state(state)
}
