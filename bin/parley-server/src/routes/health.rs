//! Liveness and health endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use utoipa::OpenApi;

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(get_root, get_health))]
pub struct HealthApi;

/// Register liveness / health routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
}

/// Liveness probe used by the hosting adapter.
#[utoipa::path(
    get,
    path = "/",
    tag = "health",
    responses(
        (status = 200, description = "Process is up", body = Value)
    )
)]
pub async fn get_root() -> Json<Value> {
    Json(json!({ "message": "OK" }))
}

/// Heartbeat endpoint.
///
/// Returns the version together with the active store and agent backends.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Server is healthy", body = Value)
    )
)]
pub async fn get_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status":  "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "store":   state.coordinator.store_name(),
        "agent":   state.coordinator.agent_name(),
    }))
}

// ── Tests ──────────────────────────────────────────────────────────────────────
