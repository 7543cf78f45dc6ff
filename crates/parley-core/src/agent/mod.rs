//! The external agent capability.
//!
//! An [`Agent`] turns a prompt plus prior turns into a lazy, finite,
//! non-restartable [`AgentStream`] of tagged [`AgentEvent`]s.  The coordinator
//! pulls from it one event at a time, which lets it stop as soon as the
//! caller goes away: dropping the stream cancels the upstream request.

pub mod echo;
pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::AgentError;
use crate::session::Message;

pub use echo::EchoAgent;
pub use openai::OpenAiAgent;

/// Output of an agent, one pull at a time.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Incremental text, forwarded to the caller verbatim.
    Fragment(String),
    /// Generation finished.  When the agent reports the full assistant turn
    /// (which may carry non-text parts) it replaces the accumulated fragments.
    Complete { message: Option<Message> },
    /// The agent failed mid-stream.
    Error(String),
}

pub type AgentStream = BoxStream<'static, AgentEvent>;

/// Everything an agent needs for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentContext {
    pub model: String,
    pub system_directive: Option<String>,
    /// Prior turns, oldest first.  Does not include `prompt`.
    pub history: Vec<Message>,
    pub prompt: String,
}

#[async_trait]
pub trait Agent: Send + Sync + 'static {
    /// Start generating a reply for `context.prompt`.
    ///
    /// An `Err` means the agent could not be invoked at all; failures after
    /// the first event arrive in-band as [`AgentEvent::Error`].
    async fn stream(&self, context: AgentContext) -> Result<AgentStream, AgentError>;

    fn name(&self) -> &str;
}

/// Which agent backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum AgentKind {
    /// Any OpenAI-compatible `/chat/completions` endpoint.
    #[strum(serialize = "openai")]
    OpenAi,
    /// Offline agent that echoes the prompt.
    Echo,
}

/// Construction parameters for [`build_agent`].
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub kind: AgentKind,
    pub base_url: String,
    pub api_key: Option<String>,
}

/// Factory: create the configured agent backend.
pub fn build_agent(settings: &AgentSettings) -> Result<Arc<dyn Agent>, AgentError> {
    let agent: Arc<dyn Agent> = match settings.kind {
        AgentKind::OpenAi => Arc::new(OpenAiAgent::new(&settings.base_url, settings.api_key.as_deref())?),
        AgentKind::Echo => Arc::new(EchoAgent::new()),
    };
    Ok(agent)
}
