//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors become a JSON-body HTTP
//! response `{"error": "..."}` with an appropriate status code.
//!
//! Store failures are logged with full detail; callers only get a generic
//! message so bucket paths and SQL never reach a client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use parley_core::ChatError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// The session could not be loaded before streaming started.
    #[error(transparent)]
    Chat(#[from] ChatError),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, client_message) = match &self {
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),

            ServerError::Chat(ChatError::Store { session_id, source }) => {
                error!(session_id = %session_id, error = %source, "session store error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to load conversation history".to_owned(),
                )
            }
        };
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}

#[cfg(test)]
mod test {
    use http_body_util::BodyExt;
    use parley_core::StoreError;
    use tracing_test::traced_test;

    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn bad_request_exposes_message() {
        let response = ServerError::BadRequest("prompt must not be empty".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "prompt must not be empty");
    }

    #[tokio::test]
    #[traced_test]
    async fn store_errors_are_generic_for_clients() {
        let err = ServerError::from(ChatError::Store {
            session_id: "s".into(),
            source: StoreError::Backend("disk /var/lib/secret is full".into()),
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert!(!body["error"].as_str().unwrap().contains("/var/lib/secret"));
        assert!(logs_contain("/var/lib/secret is full"));
    }
}
