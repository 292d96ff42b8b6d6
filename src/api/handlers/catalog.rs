//! Catalog administration endpoints

use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use tracing::info;

use super::ApiState;
use crate::api::envelope::{ApiErrorResponse, ApiResponse};
use crate::catalog::CatalogError;
use crate::types::{Model, Policy, Provider};

// ============================================================================
// Providers
// ============================================================================

/// GET /api/v1/providers
pub async fn list_providers(State(state): State<ApiState>) -> Response {
    let catalog = state.catalog.snapshot();
    ApiResponse::ok(catalog.providers().cloned().collect::<Vec<_>>())
}

/// POST /api/v1/providers - create a provider (providers are immutable afterwards)
pub async fn create_provider(State(state): State<ApiState>, Json(provider): Json<Provider>) -> Response {
    let id = provider.id.clone();
    match state.catalog.upsert_provider(provider) {
        Ok(catalog) => {
            info!(provider = %id, version = catalog.version(), "Provider created");
            ApiResponse::created(serde_json::json!({
                "version": catalog.version(),
                "provider": catalog.provider(&id),
            }))
        }
        Err(e) => ApiErrorResponse::catalog(&e),
    }
}

/// DELETE /api/v1/providers/:id
pub async fn delete_provider(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.catalog.remove_provider(&id) {
        Ok(catalog) => {
            info!(provider = %id, version = catalog.version(), "Provider removed");
            ApiResponse::ok(serde_json::json!({ "version": catalog.version(), "removed": id }))
        }
        Err(CatalogError::UnknownProvider(id)) => ApiErrorResponse::not_found(format!("unknown provider '{id}'")),
        Err(e) => ApiErrorResponse::catalog(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct RotateCredentialRequest {
    pub credential_ref: Option<String>,
}

/// POST /api/v1/providers/:id/credential
///
/// Points the provider at a different credential environment variable. The
/// provider's monitor restarts on the next reconcile.
pub async fn rotate_credential(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<RotateCredentialRequest>,
) -> Response {
    match state.catalog.rotate_credential(&id, request.credential_ref) {
        Ok(catalog) => {
            info!(provider = %id, version = catalog.version(), "Provider credential rotated");
            ApiResponse::ok(serde_json::json!({ "version": catalog.version(), "provider": catalog.provider(&id) }))
        }
        Err(CatalogError::UnknownProvider(id)) => ApiErrorResponse::not_found(format!("unknown provider '{id}'")),
        Err(e) => ApiErrorResponse::catalog(&e),
    }
}

// ============================================================================
// Models
// ============================================================================

/// GET /api/v1/models
pub async fn list_models(State(state): State<ApiState>) -> Response {
    let catalog = state.catalog.snapshot();
    ApiResponse::ok(catalog.models().cloned().collect::<Vec<_>>())
}

/// POST /api/v1/models - create or replace a model
pub async fn upsert_model(State(state): State<ApiState>, Json(model): Json<Model>) -> Response {
    let id = model.id.clone();
    match state.catalog.upsert_model(model) {
        Ok(catalog) => {
            info!(model = %id, version = catalog.version(), "Model saved");
            ApiResponse::created(serde_json::json!({ "version": catalog.version(), "model": catalog.model(&id) }))
        }
        Err(e) => ApiErrorResponse::catalog(&e),
    }
}

/// DELETE /api/v1/models/:id
pub async fn delete_model(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.catalog.remove_model(&id) {
        Ok(catalog) => {
            info!(model = %id, version = catalog.version(), "Model removed");
            // Anything still queued on it is settled by the next pump.
            state.scheduler.pump(&id);
            ApiResponse::ok(serde_json::json!({ "version": catalog.version(), "removed": id }))
        }
        Err(e) => ApiErrorResponse::catalog(&e),
    }
}

// ============================================================================
// Policies
// ============================================================================

/// GET /api/v1/policies
pub async fn list_policies(State(state): State<ApiState>) -> Response {
    let catalog = state.catalog.snapshot();
    ApiResponse::ok(catalog.policies().cloned().collect::<Vec<_>>())
}

/// POST /api/v1/policies - create or replace a policy
pub async fn upsert_policy(State(state): State<ApiState>, Json(policy): Json<Policy>) -> Response {
    let id = policy.id.clone();
    match state.catalog.upsert_policy(policy) {
        Ok(catalog) => {
            info!(policy = %id, version = catalog.version(), "Policy saved");
            ApiResponse::created(serde_json::json!({ "version": catalog.version(), "policy": catalog.policy(&id) }))
        }
        Err(e) => ApiErrorResponse::catalog(&e),
    }
}

/// DELETE /api/v1/policies/:id
pub async fn delete_policy(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.catalog.remove_policy(&id) {
        Ok(catalog) => {
            info!(policy = %id, version = catalog.version(), "Policy removed");
            ApiResponse::ok(serde_json::json!({ "version": catalog.version(), "removed": id }))
        }
        Err(e) => ApiErrorResponse::catalog(&e),
    }
}
