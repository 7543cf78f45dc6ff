//! Session Store Adapter.
//!
//! [`SessionStore`] maps a session id to its durable [`SessionRecord`].  Every
//! backend stores one JSON object per session under
//! `<prefix><session_id>.json`, mirroring an object-store layout, and
//! overwrites it wholesale on save (last writer wins).
//!
//! Backends:
//! - [`FsSessionStore`]: a local directory used as the bucket.
//! - [`SqliteSessionStore`]: a key/value table through `sqlx`.
//! - [`InMemorySessionStore`]: process-local, for development and tests.
//!
//! Pick one at runtime from a [`StoreLocation`] with [`StoreLocation::connect`].

pub mod fs;
pub mod memory;
pub mod sqlite;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;

pub use fs::FsSessionStore;
pub use memory::InMemorySessionStore;
pub use sqlite::SqliteSessionStore;

/// Default key prefix for session objects.
pub const DEFAULT_PREFIX: &str = "sessions/";

/// Longest caller-supplied session id accepted as a storage key component.
pub const MAX_SESSION_ID_LEN: usize = 128;

// ── Data model ───────────────────────────────────────────────────────────────

/// Author of a conversation turn.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One content part of a turn.
///
/// Stored as the raw JSON object so that parts this crate does not interpret
/// (tool use, images, ...) survive a load/save cycle untouched.  A text part
/// is `{"text": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentBlock(Map<String, Value>);

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("text".to_owned(), Value::String(text.into()));
        Self(map)
    }

    pub fn from_object(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// The text of this part, if it is a text part.
    pub fn as_text(&self) -> Option<&str> {
        self.0.get("text").and_then(Value::as_str)
    }
}

/// A single conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::text(text)],
        }
    }

    /// Text of the first content part, when that part is text.
    pub fn first_text(&self) -> Option<&str> {
        self.content.first().and_then(ContentBlock::as_text)
    }
}

/// Durable conversation state for one session.
///
/// The session id is the storage key and is deliberately not part of the body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Directive configuring agent behaviour.  Older records call it
    /// `system_prompt`.
    #[serde(default, alias = "system_prompt")]
    pub system_directive: Option<String>,
}

impl SessionRecord {
    /// An empty record for a first-contact session.
    pub fn fresh(system_directive: Option<String>) -> Self {
        Self {
            messages: Vec::new(),
            system_directive,
        }
    }
}

/// Result of [`SessionStore::load`].
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Found(SessionRecord),
    /// No record exists yet under this id; the routine state of a new session.
    NotFound,
}

impl LoadOutcome {
    /// Resolve to a record, treating absence as a fresh session.
    pub fn into_record(self, default_directive: Option<&str>) -> SessionRecord {
        match self {
            LoadOutcome::Found(record) => record,
            LoadOutcome::NotFound => SessionRecord::fresh(default_directive.map(str::to_owned)),
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, LoadOutcome::Found(_))
    }
}

// ── Store trait ──────────────────────────────────────────────────────────────

/// Durable key/value persistence for [`SessionRecord`]s.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Fetch the record for `session_id`.
    ///
    /// Returns [`LoadOutcome::NotFound`] when nothing is stored yet; every
    /// other failure is a [`StoreError`].
    async fn load(&self, session_id: &str) -> Result<LoadOutcome, StoreError>;

    /// Serialize `record` and overwrite whatever is stored for `session_id`.
    async fn save(&self, session_id: &str, record: &SessionRecord) -> Result<(), StoreError>;

    /// Backend name, for logs.
    fn name(&self) -> &str;
}

/// Storage key of a session object: `<prefix><session_id>.json`.
pub fn object_key(prefix: &str, session_id: &str) -> String {
    format!("{prefix}{session_id}.json")
}

/// Normalize a key prefix so that it is empty or ends with `/`.
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_start_matches('/');
    if trimmed.is_empty() || trimmed.ends_with('/') {
        trimmed.to_owned()
    } else {
        format!("{trimmed}/")
    }
}

/// Whether a caller-supplied id is safe to use as a storage key component.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

pub(crate) fn encode_record(record: &SessionRecord) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec_pretty(record)?)
}

pub(crate) fn decode_record(bytes: &[u8]) -> Result<SessionRecord, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

// ── Store location ───────────────────────────────────────────────────────────

/// Where session objects live ("bucket").
///
/// Accepted forms: `memory://`, `sqlite://<path>`, `file://<dir>` or a bare
/// directory path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Memory,
    Sqlite(String),
    Filesystem(PathBuf),
}

impl FromStr for StoreLocation {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(StoreError::InvalidLocation("location is empty".into()));
        }
        if s == "memory://" || s == "memory" {
            return Ok(StoreLocation::Memory);
        }
        if s.starts_with("sqlite:") {
            return Ok(StoreLocation::Sqlite(s.to_owned()));
        }
        if let Some(path) = s.strip_prefix("file://") {
            if path.is_empty() {
                return Err(StoreError::InvalidLocation(format!("'{s}' has no directory")));
            }
            return Ok(StoreLocation::Filesystem(PathBuf::from(path)));
        }
        if let Some((scheme, _)) = s.split_once("://") {
            return Err(StoreError::InvalidLocation(format!(
                "unsupported scheme '{scheme}' (expected memory, sqlite or file)"
            )));
        }
        Ok(StoreLocation::Filesystem(PathBuf::from(s)))
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreLocation::Memory => write!(f, "memory://"),
            StoreLocation::Sqlite(url) => write!(f, "{url}"),
            StoreLocation::Filesystem(path) => write!(f, "file://{}", path.display()),
        }
    }
}

impl StoreLocation {
    /// Open the backend for this location.
    pub async fn connect(&self, prefix: &str) -> Result<Arc<dyn SessionStore>, StoreError> {
        let store: Arc<dyn SessionStore> = match self {
            StoreLocation::Memory => Arc::new(InMemorySessionStore::with_prefix(prefix)),
            StoreLocation::Sqlite(url) => Arc::new(SqliteSessionStore::connect(url, prefix).await?),
            StoreLocation::Filesystem(root) => Arc::new(FsSessionStore::open(root, prefix).await?),
        };
        Ok(store)
    }
}
