//! OpenAI-compatible streaming agent.
//!
//! Sends the session history plus the new prompt to `<base_url>/chat/completions`
//! with `stream: true`.  The response head is awaited up front; the SSE body
//! is then turned into [`AgentEvent`]s lazily, one event per coordinator pull.
//! Dropping the stream drops the [`EventSource`] and with it the connection.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{Client, Response, StatusCode};
use reqwest_eventsource::retry::Never;
use reqwest_eventsource::{Error as EventSourceError, Event as SseEvent, EventSource};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Agent, AgentContext, AgentEvent, AgentStream};
use crate::error::AgentError;
use crate::session::{Message, Role};

/// Longest upstream error body kept in an [`AgentError::Api`] message.
const MAX_API_ERROR_CHARS: usize = 200;

pub struct OpenAiAgent {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiAgent {
    pub fn new(base_url: &str, api_key: Option<&str>) -> Result<Self, AgentError> {
        Self::with_client(Client::new(), base_url, api_key)
    }

    pub fn with_client(client: Client, base_url: &str, api_key: Option<&str>) -> Result<Self, AgentError> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(AgentError::Config("agent base URL is empty".into()));
        }
        Ok(Self {
            client,
            base_url: base_url.to_owned(),
            api_key: api_key
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_owned),
        })
    }

    fn chat_completions_url(&self) -> String {
        if self.base_url.ends_with("/chat/completions") {
            self.base_url.clone()
        } else {
            format!("{}/chat/completions", self.base_url)
        }
    }
}

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
}

#[derive(Debug, Serialize, PartialEq)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(default)]
    message: Option<String>,
}

fn wire_messages(context: &AgentContext) -> Vec<WireMessage> {
    let mut messages = Vec::with_capacity(context.history.len() + 2);
    if let Some(directive) = context.system_directive.as_deref().filter(|d| !d.is_empty()) {
        messages.push(WireMessage {
            role: "system",
            content: directive.to_owned(),
        });
    }
    for turn in &context.history {
        let text = flatten_text(turn);
        if text.is_empty() {
            continue;
        }
        messages.push(WireMessage {
            role: match turn.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: text,
        });
    }
    messages.push(WireMessage {
        role: "user",
        content: context.prompt.clone(),
    });
    messages
}

/// Concatenate the text parts of a turn; non-text parts have no wire form here.
fn flatten_text(message: &Message) -> String {
    message
        .content
        .iter()
        .filter_map(|part| part.as_text())
        .collect::<Vec<_>>()
        .join("")
}

// ── Streaming state machine ──────────────────────────────────────────────────

/// Pull side of one upstream SSE response.
struct Upstream {
    source: EventSource,
    pending: VecDeque<AgentEvent>,
    finished: bool,
}

impl Upstream {
    fn new(mut source: EventSource) -> Self {
        source.set_retry_policy(Box::new(Never));
        Self {
            source,
            pending: VecDeque::new(),
            finished: false,
        }
    }

    /// Wait for the response head so HTTP failures surface as [`AgentError`]
    /// before the first fragment.
    async fn open(&mut self, provider: &str) -> Result<(), AgentError> {
        match self.source.next().await {
            Some(Ok(SseEvent::Open)) => Ok(()),
            Some(Ok(SseEvent::Message(message))) => {
                self.handle(&message.data);
                Ok(())
            }
            Some(Err(EventSourceError::InvalidStatusCode(status, response))) => {
                Err(api_error(provider, status, response).await)
            }
            Some(Err(EventSourceError::InvalidContentType(_, response))) => {
                let status = response.status();
                Err(api_error(provider, status, response).await)
            }
            Some(Err(EventSourceError::Transport(e))) => Err(AgentError::Http(e)),
            Some(Err(e)) => Err(AgentError::Stream(e.to_string())),
            None => Err(AgentError::Stream("upstream closed before responding".into())),
        }
    }

    fn finish(&mut self, event: AgentEvent) {
        self.pending.push_back(event);
        self.finished = true;
        self.source.close();
    }

    fn handle(&mut self, data: &str) {
        if self.finished {
            return;
        }
        if data.trim() == "[DONE]" {
            self.finish(AgentEvent::Complete { message: None });
            return;
        }
        for event in chunk_events(data) {
            if matches!(event, AgentEvent::Fragment(_)) {
                self.pending.push_back(event);
            } else {
                self.finish(event);
                return;
            }
        }
    }

    async fn next_event(&mut self) -> Option<AgentEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.finished {
                return None;
            }
            match self.source.next().await {
                Some(Ok(SseEvent::Open)) => {}
                Some(Ok(SseEvent::Message(message))) => self.handle(&message.data),
                // A body that ends without `[DONE]` still counts as complete.
                Some(Err(EventSourceError::StreamEnded)) | None => {
                    self.finish(AgentEvent::Complete { message: None });
                }
                Some(Err(e)) => {
                    warn!(error = %e, "upstream stream failed");
                    self.finish(AgentEvent::Error(sanitize_api_error(&format!(
                        "upstream stream failed: {e}"
                    ))));
                }
            }
        }
    }
}

async fn api_error(provider: &str, status: StatusCode, response: Response) -> AgentError {
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read upstream error body>".to_owned());
    AgentError::Api {
        provider: provider.to_owned(),
        status: status.as_u16(),
        message: sanitize_api_error(&body),
    }
}

/// Events carried by one upstream JSON chunk.
fn chunk_events(json: &str) -> Vec<AgentEvent> {
    let chunk: StreamChunk = match serde_json::from_str(json) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "skipping undecodable upstream chunk");
            return Vec::new();
        }
    };
    if let Some(err) = chunk.error {
        let message = err.message.unwrap_or_else(|| "upstream reported an error".into());
        return vec![AgentEvent::Error(sanitize_api_error(&message))];
    }

    let mut events = Vec::new();
    for choice in chunk.choices {
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            events.push(AgentEvent::Fragment(content));
        }
        if let Some(reason) = choice.finish_reason {
            debug!(finish_reason = %reason, "upstream finished");
        }
    }
    events
}

#[async_trait]
impl Agent for OpenAiAgent {
    async fn stream(&self, context: AgentContext) -> Result<AgentStream, AgentError> {
        let request = ChatRequest {
            model: context.model.clone(),
            messages: wire_messages(&context),
            stream: true,
        };

        let mut builder = self.client.post(self.chat_completions_url()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let source = EventSource::new(builder)
            .map_err(|e| AgentError::Config(format!("cannot build upstream request: {e}")))?;

        let mut upstream = Upstream::new(source);
        upstream.open(self.name()).await?;

        let events = stream::unfold(upstream, |mut upstream| async move {
            let event = upstream.next_event().await?;
            Some((event, upstream))
        });
        Ok(events.boxed())
    }

    fn name(&self) -> &str {
        "openai"
    }
}

// ── Error sanitizing ─────────────────────────────────────────────────────────

/// Replace credential-looking tokens (`sk-…`, `ghp_…`, …) with `[REDACTED]`.
pub fn redact_secrets(input: &str) -> String {
    const PREFIXES: [&str; 6] = ["sk-", "ghp_", "gho_", "github_pat_", "xoxb-", "xoxp-"];
    let is_token_char = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while !rest.is_empty() {
        let hit = PREFIXES
            .iter()
            .filter_map(|p| rest.find(p).map(|at| (at, p.len())))
            .min_by_key(|(at, _)| *at);
        let Some((at, prefix_len)) = hit else {
            out.push_str(rest);
            break;
        };
        let token_start = at + prefix_len;
        let token_len = rest[token_start..]
            .find(|c: char| !is_token_char(c))
            .unwrap_or(rest.len() - token_start);
        out.push_str(&rest[..at]);
        if token_len == 0 {
            out.push_str(&rest[at..token_start]);
        } else {
            out.push_str("[REDACTED]");
        }
        rest = &rest[token_start + token_len..];
    }
    out
}

/// Redact secrets and cap the length of upstream error text.
pub fn sanitize_api_error(input: &str) -> String {
    let redacted = redact_secrets(input.trim());
    if redacted.chars().count() <= MAX_API_ERROR_CHARS {
        return redacted;
    }
    let cut: String = redacted.chars().take(MAX_API_ERROR_CHARS).collect();
    format!("{cut}...")
}
