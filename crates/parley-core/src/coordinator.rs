//! Streaming Chat Coordinator.
//!
//! One [`ChatCoordinator::handle_chat`] call drives a single turn:
//!
//! ```text
//! START → SESSION_RESOLVED → HISTORY_LOADED → STREAMING
//!       → { COMPLETED_SAVED | COMPLETED_DISCONNECTED | FAILED }
//! ```
//!
//! Loading happens before the caller sees anything so store failures can
//! still become a conventional error response.  Everything after that runs
//! on a spawned task that relays agent fragments through a bounded channel.
//! The receiving half of that channel *is* the caller: once it is dropped
//! the task stops pulling from the agent and the record is not saved.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentContext, AgentEvent};
use crate::error::ChatError;
use crate::session::{is_valid_session_id, ContentBlock, Message, SessionRecord, SessionStore};

/// Frames buffered between the turn task and a slow caller.
const FRAME_BUFFER: usize = 32;

/// Immutable per-process settings, built once at startup.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Model identifier handed to the agent.
    pub model: String,
    /// Directive stored with sessions that have none yet.
    pub default_directive: Option<String>,
    /// Total save attempts after a completed turn, at least 1.
    pub save_attempts: u32,
    /// Delay before the first save retry; doubles on each further retry.
    pub save_backoff: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_owned(),
            default_directive: None,
            save_attempts: 3,
            save_backoff: Duration::from_millis(100),
        }
    }
}

/// One unit delivered to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatFrame {
    /// A generated fragment, JSON-encoded for the wire.
    Data(Value),
    /// The turn failed; no further frames follow.
    Error(String),
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatOutcome {
    /// The agent finished.  `saved` is false when every save attempt failed.
    Completed { saved: bool },
    /// The caller went away before the agent finished; nothing was saved.
    Disconnected,
    /// The agent failed; nothing was saved.
    Failed { reason: String },
}

/// Frames of one turn plus the handle of the task producing them.
///
/// Polling it as a [`Stream`] yields the frames.  Dropping it disconnects.
pub struct ChatStream {
    frames: ReceiverStream<ChatFrame>,
    outcome: JoinHandle<ChatOutcome>,
}

impl ChatStream {
    pub fn into_parts(self) -> (ReceiverStream<ChatFrame>, JoinHandle<ChatOutcome>) {
        (self.frames, self.outcome)
    }
}

impl Stream for ChatStream {
    type Item = ChatFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ChatFrame>> {
        Pin::new(&mut self.frames).poll_next(cx)
    }
}

#[derive(Debug, Clone, Copy, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
enum TurnState {
    SessionResolved,
    HistoryLoaded,
    Streaming,
    CompletedSaved,
    CompletedDisconnected,
    Failed,
}

fn transition(session_id: &str, state: TurnState) {
    debug!(session_id, state = %state, "chat turn state");
}

fn transition_saved(session_id: &str, saved: bool) {
    debug!(session_id, state = %TurnState::CompletedSaved, saved, "chat turn state");
}

#[derive(Clone)]
pub struct ChatCoordinator {
    store: Arc<dyn SessionStore>,
    agent: Arc<dyn Agent>,
    options: Arc<CoordinatorOptions>,
}

impl ChatCoordinator {
    pub fn new(store: Arc<dyn SessionStore>, agent: Arc<dyn Agent>, options: CoordinatorOptions) -> Self {
        Self {
            store,
            agent,
            options: Arc::new(options),
        }
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    pub fn agent_name(&self) -> &str {
        self.agent.name()
    }

    /// Use the caller's session id when it is a safe storage key, otherwise
    /// mint a new one.  The flag is true when the id was generated here.
    pub fn resolve_session_id(&self, candidate: Option<&str>) -> (String, bool) {
        match candidate.map(str::trim) {
            Some(id) if is_valid_session_id(id) => (id.to_owned(), false),
            Some(rejected) => {
                warn!(
                    len = rejected.len(),
                    "ignoring malformed session id, issuing a new one"
                );
                (Uuid::new_v4().to_string(), true)
            }
            None => (Uuid::new_v4().to_string(), true),
        }
    }

    /// Run one chat turn.
    ///
    /// Returns an error only when the session cannot be loaded.  Agent
    /// failures arrive in-band as a single [`ChatFrame::Error`].
    pub async fn handle_chat(&self, session_id: &str, prompt: &str) -> Result<ChatStream, ChatError> {
        transition(session_id, TurnState::SessionResolved);

        let loaded = self
            .store
            .load(session_id)
            .await
            .map_err(|source| ChatError::Store {
                session_id: session_id.to_owned(),
                source,
            })?;
        let is_new = !loaded.is_found();
        let mut record = loaded.into_record(self.options.default_directive.as_deref());
        info!(
            session_id,
            store = self.store.name(),
            is_new,
            history = record.messages.len(),
            "session loaded"
        );
        transition(session_id, TurnState::HistoryLoaded);

        let context = AgentContext {
            model: self.options.model.clone(),
            system_directive: record.system_directive.clone(),
            history: record.messages.clone(),
            prompt: prompt.to_owned(),
        };
        record.messages.push(Message::user(prompt));

        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let this = self.clone();
        let session_id = session_id.to_owned();
        let outcome = tokio::spawn(async move { this.run_turn(session_id, record, context, tx).await });

        Ok(ChatStream {
            frames: ReceiverStream::new(rx),
            outcome,
        })
    }

    /// Stream a reply to `prompt` with no history and no persistence.
    pub fn stream_stateless(&self, prompt: &str) -> ChatStream {
        let context = AgentContext {
            model: self.options.model.clone(),
            system_directive: self.options.default_directive.clone(),
            history: Vec::new(),
            prompt: prompt.to_owned(),
        };
        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let agent = Arc::clone(&self.agent);
        let outcome = tokio::spawn(async move {
            match relay(agent.as_ref(), context, &tx).await {
                Relay::Finished(_) => ChatOutcome::Completed { saved: false },
                Relay::Disconnected => ChatOutcome::Disconnected,
                Relay::Failed(reason) => ChatOutcome::Failed { reason },
            }
        });
        ChatStream {
            frames: ReceiverStream::new(rx),
            outcome,
        }
    }

    /// History for display: each turn reduced to its first part, kept only
    /// when that part is text.
    pub async fn get_history(&self, session_id: &str) -> Result<Vec<Message>, ChatError> {
        let loaded = self
            .store
            .load(session_id)
            .await
            .map_err(|source| ChatError::Store {
                session_id: session_id.to_owned(),
                source,
            })?;
        let record = loaded.into_record(None);
        Ok(project_history(&record.messages))
    }

    async fn run_turn(
        self,
        session_id: String,
        mut record: SessionRecord,
        context: AgentContext,
        tx: mpsc::Sender<ChatFrame>,
    ) -> ChatOutcome {
        transition(&session_id, TurnState::Streaming);

        match relay(self.agent.as_ref(), context, &tx).await {
            Relay::Finished(reply) => {
                record.messages.push(reply);
                let saved = self.save_with_retry(&session_id, &record).await;
                transition_saved(&session_id, saved);
                ChatOutcome::Completed { saved }
            }
            Relay::Disconnected => {
                info!(session_id = %session_id, "caller disconnected, turn discarded");
                transition(&session_id, TurnState::CompletedDisconnected);
                ChatOutcome::Disconnected
            }
            Relay::Failed(reason) => {
                transition(&session_id, TurnState::Failed);
                ChatOutcome::Failed { reason }
            }
        }
    }

    async fn save_with_retry(&self, session_id: &str, record: &SessionRecord) -> bool {
        let attempts = self.options.save_attempts.max(1);
        let mut delay = self.options.save_backoff;

        for attempt in 1..=attempts {
            match self.store.save(session_id, record).await {
                Ok(()) => {
                    info!(
                        session_id,
                        attempt,
                        messages = record.messages.len(),
                        "session saved"
                    );
                    return true;
                }
                Err(e) if attempt < attempts => {
                    warn!(session_id, attempt, error = %e, "session save failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => {
                    error!(
                        session_id,
                        attempts,
                        error = %e,
                        "session save failed, turn not persisted"
                    );
                }
            }
        }
        false
    }
}

enum Relay {
    Finished(Message),
    Disconnected,
    Failed(String),
}

/// Pull the agent stream and forward fragments to `tx` until it ends, fails
/// or the receiver is dropped.
async fn relay(agent: &dyn Agent, context: AgentContext, tx: &mpsc::Sender<ChatFrame>) -> Relay {
    let started = tokio::select! {
        _ = tx.closed() => return Relay::Disconnected,
        started = agent.stream(context) => started,
    };
    let mut events = match started {
        Ok(events) => events,
        Err(e) => {
            error!(agent = agent.name(), error = %e, "agent invocation failed");
            let reason = e.to_string();
            let _ = tx.send(ChatFrame::Error(reason.clone())).await;
            return Relay::Failed(reason);
        }
    };

    let mut text = String::new();
    loop {
        let next = tokio::select! {
            _ = tx.closed() => return Relay::Disconnected,
            next = events.next() => next,
        };
        if tx.is_closed() {
            return Relay::Disconnected;
        }

        match next {
            Some(AgentEvent::Fragment(fragment)) => {
                text.push_str(&fragment);
                if tx.send(ChatFrame::Data(Value::String(fragment))).await.is_err() {
                    return Relay::Disconnected;
                }
            }
            Some(AgentEvent::Complete { message }) => {
                return Relay::Finished(message.unwrap_or_else(|| Message::assistant(text)));
            }
            Some(AgentEvent::Error(reason)) => {
                warn!(agent = agent.name(), %reason, "agent stream failed");
                let _ = tx.send(ChatFrame::Error(reason.clone())).await;
                return Relay::Failed(reason);
            }
            None => return Relay::Finished(Message::assistant(text)),
        }
    }
}

fn project_history(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .filter_map(|m| {
            let text = m.first_text()?;
            Some(Message {
                role: m.role,
                content: vec![ContentBlock::text(text)],
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures::stream;
    use serde_json::json;
    use tracing_test::traced_test;

    use super::*;
    use crate::agent::{AgentStream, EchoAgent};
    use crate::error::{AgentError, StoreError};
    use crate::session::{InMemorySessionStore, LoadOutcome, Role};

    /// Agent double replaying a fixed script.
    struct ScriptedAgent {
        events: Vec<AgentEvent>,
        hang_after_script: bool,
        refuse: Option<String>,
        seen: Mutex<Vec<AgentContext>>,
    }

    impl ScriptedAgent {
        fn new(events: Vec<AgentEvent>) -> Self {
            Self {
                events,
                hang_after_script: false,
                refuse: None,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn hanging(events: Vec<AgentEvent>) -> Self {
            Self {
                hang_after_script: true,
                ..Self::new(events)
            }
        }

        fn refusing(message: &str) -> Self {
            Self {
                refuse: Some(message.to_owned()),
                ..Self::new(Vec::new())
            }
        }

        fn contexts(&self) -> Vec<AgentContext> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Agent for ScriptedAgent {
        async fn stream(&self, context: AgentContext) -> Result<AgentStream, AgentError> {
            self.seen.lock().unwrap().push(context);
            if let Some(msg) = &self.refuse {
                return Err(AgentError::Config(msg.clone()));
            }
            let scripted = stream::iter(self.events.clone());
            if self.hang_after_script {
                Ok(scripted.chain(stream::pending()).boxed())
            } else {
                Ok(scripted.boxed())
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn fragments(parts: &[&str]) -> Vec<AgentEvent> {
        let mut events: Vec<AgentEvent> =
            parts.iter().map(|p| AgentEvent::Fragment((*p).to_owned())).collect();
        events.push(AgentEvent::Complete { message: None });
        events
    }

    fn options() -> CoordinatorOptions {
        CoordinatorOptions {
            model: "test-model".into(),
            default_directive: Some("be helpful".into()),
            save_attempts: 3,
            save_backoff: Duration::from_millis(1),
        }
    }

    fn coordinator(
        store: &Arc<InMemorySessionStore>,
        agent: &Arc<ScriptedAgent>,
    ) -> ChatCoordinator {
        let store: Arc<dyn SessionStore> = store.clone();
        let agent: Arc<dyn Agent> = agent.clone();
        ChatCoordinator::new(store, agent, options())
    }

    async fn drain(stream: ChatStream) -> (Vec<ChatFrame>, ChatOutcome) {
        let (frames, outcome) = stream.into_parts();
        let frames: Vec<ChatFrame> = frames.collect().await;
        (frames, outcome.await.unwrap())
    }

    #[tokio::test]
    async fn new_session_streams_and_saves_both_turns() {
        let store = Arc::new(InMemorySessionStore::new());
        let agent = Arc::new(ScriptedAgent::new(fragments(&["Hel", "lo"])));
        let chat = coordinator(&store, &agent);

        let (id, created) = chat.resolve_session_id(None);
        assert!(created);
        let (frames, outcome) = drain(chat.handle_chat(&id, "hi").await.unwrap()).await;

        assert_eq!(
            frames,
            vec![ChatFrame::Data(json!("Hel")), ChatFrame::Data(json!("lo"))]
        );
        assert_eq!(outcome, ChatOutcome::Completed { saved: true });

        let record = store.load(&id).await.unwrap().into_record(None);
        assert_eq!(
            record.messages,
            vec![Message::user("hi"), Message::assistant("Hello")]
        );
        assert_eq!(record.system_directive.as_deref(), Some("be helpful"));
    }

    #[tokio::test]
    async fn not_found_session_starts_with_empty_history() {
        let store = Arc::new(InMemorySessionStore::new());
        let agent = Arc::new(ScriptedAgent::new(fragments(&["ok"])));
        let chat = coordinator(&store, &agent);

        drain(chat.handle_chat("fresh", "first").await.unwrap()).await;

        let seen = agent.contexts();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].history.is_empty());
        assert_eq!(seen[0].prompt, "first");
        assert_eq!(seen[0].model, "test-model");
        assert_eq!(seen[0].system_directive.as_deref(), Some("be helpful"));
    }

    #[tokio::test]
    async fn existing_history_is_passed_to_agent() {
        let store = Arc::new(InMemorySessionStore::new());
        let agent = Arc::new(ScriptedAgent::new(fragments(&["two"])));
        let chat = coordinator(&store, &agent);
        store
            .save(
                "s1",
                &SessionRecord {
                    messages: vec![Message::user("one"), Message::assistant("uno")],
                    system_directive: Some("stored".into()),
                },
            )
            .await
            .unwrap();

        drain(chat.handle_chat("s1", "dos").await.unwrap()).await;

        let seen = agent.contexts();
        assert_eq!(seen[0].history.len(), 2);
        assert_eq!(seen[0].system_directive.as_deref(), Some("stored"));
        let record = store.load("s1").await.unwrap().into_record(None);
        assert_eq!(record.messages.len(), 4);
        assert_eq!(record.messages[3], Message::assistant("two"));
    }

    #[tokio::test]
    async fn complete_message_replaces_accumulated_text() {
        let store = Arc::new(InMemorySessionStore::new());
        let full = Message {
            role: Role::Assistant,
            content: vec![
                ContentBlock::from_object(json!({"toolUse": {"name": "weather"}}).as_object().unwrap().clone()),
                ContentBlock::text("Sunny"),
            ],
        };
        let agent = Arc::new(ScriptedAgent::new(vec![
            AgentEvent::Fragment("Sunny".into()),
            AgentEvent::Complete { message: Some(full.clone()) },
        ]));
        let chat = coordinator(&store, &agent);

        drain(chat.handle_chat("s", "weather?").await.unwrap()).await;

        let record = store.load("s").await.unwrap().into_record(None);
        assert_eq!(record.messages[1], full);
    }

    #[tokio::test]
    async fn exhausted_stream_counts_as_completion() {
        let store = Arc::new(InMemorySessionStore::new());
        let agent = Arc::new(ScriptedAgent::new(vec![AgentEvent::Fragment("partial".into())]));
        let chat = coordinator(&store, &agent);

        let (_, outcome) = drain(chat.handle_chat("s", "q").await.unwrap()).await;
        assert_eq!(outcome, ChatOutcome::Completed { saved: true });
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn disconnect_mid_stream_skips_save() {
        let store = Arc::new(InMemorySessionStore::new());
        let agent = Arc::new(ScriptedAgent::hanging(vec![AgentEvent::Fragment("first".into())]));
        let chat = coordinator(&store, &agent);

        let (mut frames, outcome) = chat.handle_chat("s", "q").await.unwrap().into_parts();
        assert_eq!(frames.next().await, Some(ChatFrame::Data(json!("first"))));
        drop(frames);

        assert_eq!(outcome.await.unwrap(), ChatOutcome::Disconnected);
        assert_eq!(store.save_count(), 0);
        assert_eq!(store.load("s").await.unwrap(), LoadOutcome::NotFound);
    }

    #[tokio::test]
    async fn disconnect_before_first_fragment_skips_save() {
        let store = Arc::new(InMemorySessionStore::new());
        let agent = Arc::new(ScriptedAgent::hanging(Vec::new()));
        let chat = coordinator(&store, &agent);

        let (frames, outcome) = chat.handle_chat("s", "q").await.unwrap().into_parts();
        drop(frames);

        assert_eq!(outcome.await.unwrap(), ChatOutcome::Disconnected);
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn save_failure_is_logged_not_streamed() {
        let store = Arc::new(InMemorySessionStore::new());
        store.set_fail_saves(true);
        let agent = Arc::new(ScriptedAgent::new(fragments(&["a", "b"])));
        let chat = coordinator(&store, &agent);

        let (frames, outcome) = drain(chat.handle_chat("s", "q").await.unwrap()).await;

        assert_eq!(frames, vec![ChatFrame::Data(json!("a")), ChatFrame::Data(json!("b"))]);
        assert_eq!(outcome, ChatOutcome::Completed { saved: false });
        assert_eq!(store.save_count(), 3);
        assert!(logs_contain("session save failed, retrying"));
        assert!(logs_contain("session save failed, turn not persisted"));
        assert!(logs_contain("state=COMPLETED_SAVED saved=false"));
        assert!(!logs_contain("state=FAILED"));
    }

    #[tokio::test]
    async fn mid_stream_agent_error_yields_one_error_frame_and_no_save() {
        let store = Arc::new(InMemorySessionStore::new());
        let agent = Arc::new(ScriptedAgent::new(vec![
            AgentEvent::Fragment("par".into()),
            AgentEvent::Error("model overloaded".into()),
            AgentEvent::Fragment("never".into()),
        ]));
        let chat = coordinator(&store, &agent);

        let (frames, outcome) = drain(chat.handle_chat("s", "q").await.unwrap()).await;

        assert_eq!(
            frames,
            vec![
                ChatFrame::Data(json!("par")),
                ChatFrame::Error("model overloaded".into())
            ]
        );
        assert_eq!(outcome, ChatOutcome::Failed { reason: "model overloaded".into() });
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn agent_invocation_error_is_surfaced_in_band() {
        let store = Arc::new(InMemorySessionStore::new());
        let agent = Arc::new(ScriptedAgent::refusing("no credentials"));
        let chat = coordinator(&store, &agent);

        let (frames, outcome) = drain(chat.handle_chat("s", "q").await.unwrap()).await;

        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], ChatFrame::Error(msg) if msg.contains("no credentials")));
        assert!(matches!(outcome, ChatOutcome::Failed { .. }));
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn load_failure_is_returned_before_streaming() {
        let store = Arc::new(InMemorySessionStore::new());
        store.set_fail_loads(true);
        let agent = Arc::new(ScriptedAgent::new(fragments(&["x"])));
        let chat = coordinator(&store, &agent);

        let err = match chat.handle_chat("s", "q").await {
            Err(e) => e,
            Ok(_) => panic!("expected a store error"),
        };
        let ChatError::Store { session_id, source } = err;
        assert_eq!(session_id, "s");
        assert!(matches!(source, StoreError::Backend(_)));
        assert!(agent.contexts().is_empty());
    }

    #[tokio::test]
    async fn history_keeps_only_first_text_part() {
        let store = Arc::new(InMemorySessionStore::new());
        let agent = Arc::new(ScriptedAgent::new(Vec::new()));
        let chat = coordinator(&store, &agent);
        let tool = ContentBlock::from_object(json!({"toolUse": {"name": "t"}}).as_object().unwrap().clone());
        store
            .save(
                "h",
                &SessionRecord {
                    messages: vec![
                        Message {
                            role: Role::User,
                            content: vec![ContentBlock::text("question"), tool.clone()],
                        },
                        Message {
                            role: Role::Assistant,
                            content: vec![tool.clone(), ContentBlock::text("hidden")],
                        },
                        Message {
                            role: Role::Assistant,
                            content: vec![ContentBlock::text("answer"), ContentBlock::text("more")],
                        },
                    ],
                    system_directive: None,
                },
            )
            .await
            .unwrap();

        let history = chat.get_history("h").await.unwrap();
        assert_eq!(
            history,
            vec![Message::user("question"), Message::assistant("answer")]
        );
    }

    #[tokio::test]
    async fn history_of_unknown_session_is_empty() {
        let store = Arc::new(InMemorySessionStore::new());
        let agent = Arc::new(ScriptedAgent::new(Vec::new()));
        let chat = coordinator(&store, &agent);
        assert!(chat.get_history("nobody").await.unwrap().is_empty());
    }

    #[test]
    fn resolve_session_id_keeps_valid_and_replaces_malformed() {
        let store = Arc::new(InMemorySessionStore::new());
        let agent = Arc::new(ScriptedAgent::new(Vec::new()));
        let chat = coordinator(&store, &agent);

        assert_eq!(chat.resolve_session_id(Some("abc-123")), ("abc-123".to_owned(), false));

        let (id, created) = chat.resolve_session_id(Some("../../etc/passwd"));
        assert!(created);
        assert!(Uuid::parse_str(&id).is_ok());

        let (a, _) = chat.resolve_session_id(None);
        let (b, _) = chat.resolve_session_id(None);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn stateless_stream_never_touches_the_store() {
        let store = Arc::new(InMemorySessionStore::new());
        let store_dyn: Arc<dyn SessionStore> = store.clone();
        let chat = ChatCoordinator::new(store_dyn, Arc::new(EchoAgent::new()), options());

        let (frames, outcome) = drain(chat.stream_stateless("hello")).await;
        assert_eq!(
            frames,
            vec![
                ChatFrame::Data(json!("You ")),
                ChatFrame::Data(json!("said: ")),
                ChatFrame::Data(json!("hello")),
            ]
        );
        assert_eq!(outcome, ChatOutcome::Completed { saved: false });
        assert_eq!(store.save_count(), 0);
        assert!(store.keys().await.is_empty());
    }
}
