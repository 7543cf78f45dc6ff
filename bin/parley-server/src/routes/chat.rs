//! Stateful chat routes.
//!
//! The session id travels in the `session_id` cookie (or an `x-session-id`
//! header for clients without a cookie jar).  Both routes resolve it, mint a
//! new one when it is absent or malformed, and set the cookie on the response.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{AppendHeaders, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use http::header::{COOKIE, SET_COOKIE};
use http::HeaderMap;
use parley_core::session::is_valid_session_id;
use parley_core::{ChatFrame, ChatStream};
use tracing::debug;
use utoipa::OpenApi;
use validator::Validate;

use crate::error::ServerError;
use crate::schemas::chat::{ChatRequest, HistoryMessage, HistoryResponse, StreamError};
use crate::state::AppState;

pub const SESSION_COOKIE: &str = "session_id";
pub const SESSION_HEADER: &str = "x-session-id";

#[derive(OpenApi)]
#[openapi(
    paths(get_chat_history, post_chat),
    components(schemas(ChatRequest, HistoryResponse, HistoryMessage, StreamError))
)]
pub struct ChatApi;

/// Register chat routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/chat", get(get_chat_history).post(post_chat))
}

// ── Session cookie ────────────────────────────────────────────────────────────

fn cookie_value<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        (name.trim() == cookie_name).then(|| value.trim())
    })
}

/// Session id supplied by the caller: the cookie if it holds a well-formed
/// id, otherwise the header.
fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
    let cookie = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|raw| cookie_value(raw, SESSION_COOKIE));
    let header = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok());

    [cookie, header]
        .into_iter()
        .flatten()
        .find(|id| is_valid_session_id(id))
        .map(str::to_owned)
}

fn session_cookie(session_id: &str, secure: bool) -> String {
    let mut cookie = format!("{SESSION_COOKIE}={session_id}; Path=/; HttpOnly; SameSite=Lax");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

// ── SSE framing ───────────────────────────────────────────────────────────────

fn frame_to_event(frame: ChatFrame) -> Event {
    match frame {
        ChatFrame::Data(value) => Event::default().data(value.to_string()),
        ChatFrame::Error(message) => {
            let payload = serde_json::to_string(&StreamError { error: message })
                .unwrap_or_else(|_| r#"{"error":"stream failed"}"#.to_owned());
            Event::default().event("error").data(payload)
        }
    }
}

/// Wrap a chat turn as an SSE body.  Dropping the body drops the turn,
/// which the coordinator observes as a disconnect.
pub(super) fn sse_body(
    chat: ChatStream,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    let events = chat.map(|frame| Ok::<Event, Infallible>(frame_to_event(frame)));
    Sse::new(events).keep_alive(KeepAlive::default())
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// Conversation history of the caller's session.
///
/// Each turn is reduced to its first content part, and turns whose first part
/// is not text are left out.
#[utoipa::path(
    get,
    path = "/chat",
    tag = "chat",
    responses(
        (status = 200, description = "Session history", body = HistoryResponse),
        (status = 500, description = "Session store error"),
    )
)]
pub async fn get_chat_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let (session_id, created) = state
        .coordinator
        .resolve_session_id(session_id_from_headers(&headers).as_deref());
    debug!(session_id = %session_id, created, "history request");

    let messages = state
        .coordinator
        .get_history(&session_id)
        .await?
        .into_iter()
        .map(HistoryMessage::from)
        .collect();

    let cookie = session_cookie(&session_id, state.config.cookie_secure);
    Ok((
        AppendHeaders([(SET_COOKIE, cookie)]),
        Json(HistoryResponse { messages }),
    )
        .into_response())
}

/// Send a prompt and stream the reply.
///
/// Each fragment is an SSE `data:` event holding a JSON string.  A failure
/// during generation is a single `error` event with an `{"error": ...}` body.
#[utoipa::path(
    post,
    path = "/chat",
    tag = "chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "SSE stream of reply fragments", body = String, content_type = "text/event-stream"),
        (status = 400, description = "Empty or oversized prompt"),
        (status = 500, description = "Session store error"),
    )
)]
pub async fn post_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ServerError> {
    req.validate()
        .map_err(|e| ServerError::BadRequest(e.to_string()))?;
    if req.prompt.trim().is_empty() {
        return Err(ServerError::BadRequest("prompt must not be blank".into()));
    }

    let (session_id, created) = state
        .coordinator
        .resolve_session_id(session_id_from_headers(&headers).as_deref());
    debug!(session_id = %session_id, created, prompt_len = req.prompt.len(), "chat request");

    let chat = state.coordinator.handle_chat(&session_id, &req.prompt).await?;

    let cookie = session_cookie(&session_id, state.config.cookie_secure);
    Ok((AppendHeaders([(SET_COOKIE, cookie)]), sse_body(chat)).into_response())
}
