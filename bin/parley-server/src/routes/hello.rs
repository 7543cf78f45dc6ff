//! Stateless greeting stream.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use utoipa::OpenApi;

use super::chat::sse_body;
use crate::state::AppState;

const GREETING_PROMPT: &str = "Reply to the user with a friendly greeting.";

#[derive(OpenApi)]
#[openapi(paths(get_hello))]
pub struct HelloApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/hello", get(get_hello))
}

/// Stream a friendly greeting from the agent.  Nothing is loaded or saved.
#[utoipa::path(
    get,
    path = "/hello",
    tag = "chat",
    responses(
        (status = 200, description = "SSE stream of greeting fragments", body = String, content_type = "text/event-stream"),
    )
)]
pub async fn get_hello(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    sse_body(state.coordinator.stream_stateless(GREETING_PROMPT))
}
