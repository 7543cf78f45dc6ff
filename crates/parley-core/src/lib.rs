//! parley-core – session persistence and streaming chat coordination.
//!
//! The crate is split along the three collaborators of a chat request:
//!
//! - [`session`]: the durable [`SessionRecord`] and the [`SessionStore`]
//!   adapter with its backends (filesystem bucket, SQLite, in-memory).
//! - [`agent`]: the external model capability, modelled as a lazy stream of
//!   [`AgentEvent`]s.
//! - [`coordinator`]: the per-request [`ChatCoordinator`] that loads history,
//!   relays fragments while watching for caller disconnects, and saves the
//!   updated record once generation finishes.

pub mod agent;
pub mod coordinator;
pub mod error;
pub mod session;

pub use agent::{Agent, AgentContext, AgentEvent, AgentKind, AgentStream};
pub use coordinator::{ChatCoordinator, ChatFrame, ChatOutcome, ChatStream, CoordinatorOptions};
pub use error::{AgentError, ChatError, StoreError};
pub use session::{
    ContentBlock, LoadOutcome, Message, Role, SessionRecord, SessionStore, StoreLocation,
};
