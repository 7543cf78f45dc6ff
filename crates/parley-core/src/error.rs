use thiserror::Error;

/// Failures of the durable session store.
///
/// A missing record is *not* an error; see [`crate::LoadOutcome::NotFound`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem access to the bucket directory failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored object could not be decoded, or a record could not be encoded.
    #[error("session JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The SQLite backend reported an error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The configured store location is not usable.
    #[error("invalid store location: {0}")]
    InvalidLocation(String),

    /// Backend-specific failure without a more precise variant.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Failures raised while invoking the external agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Transport-level failure talking to the upstream endpoint.
    #[error("agent request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The upstream endpoint answered with a non-success status.
    #[error("{provider} API error ({status}): {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },

    /// The event stream broke before the upstream endpoint answered.
    #[error("agent stream failed: {0}")]
    Stream(String),

    /// The agent is not usable with the current configuration.
    #[error("agent misconfigured: {0}")]
    Config(String),
}

/// Errors that abort a chat request before any response byte is sent.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("failed to load session '{session_id}': {source}")]
    Store {
        session_id: String,
        #[source]
        source: StoreError,
    },
}
