//! Server configuration, loaded from environment variables at startup.

use std::fmt;
use std::time::Duration;

use parley_core::agent::{AgentKind, AgentSettings};
use parley_core::session::DEFAULT_PREFIX;
use parley_core::CoordinatorOptions;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// No durable store was configured; the server refuses to start without one.
    #[error("PARLEY_STATE_BUCKET (or STATE_BUCKET) must name a session store location")]
    MissingBucket,

    #[error("unknown agent backend '{0}' (expected openai or echo)")]
    UnknownAgent(String),

    #[error("{key}='{value}' is not valid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime configuration for parley-server.
///
/// Only the store location is mandatory; everything else has a default.
#[derive(Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:$PORT"`).
    pub bind_address: String,

    /// Session store location: `memory://`, `sqlite://…`, `file://…` or a path.
    pub state_bucket: String,

    /// Key prefix for session objects (default: `"sessions/"`).
    pub state_prefix: String,

    pub agent_kind: AgentKind,

    /// Model identifier sent to the agent.
    pub model_id: String,

    /// Base URL of the OpenAI-compatible endpoint.
    pub agent_url: String,

    pub api_key: Option<String>,

    /// Directive stored with new sessions.
    pub system_prompt: Option<String>,

    /// Save attempts after a completed turn.
    pub save_attempts: u32,

    /// Add `Secure` to the session cookie.
    pub cookie_secure: bool,

    /// Comma-separated CORS allow list; `None` allows any origin.
    pub cors_allowed_origins: Option<String>,

    /// Mount Swagger UI and the OpenAPI document.
    pub enable_swagger: bool,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("state_bucket", &self.state_bucket)
            .field("state_prefix", &self.state_prefix)
            .field("agent_kind", &self.agent_kind)
            .field("model_id", &self.model_id)
            .field("agent_url", &self.agent_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("system_prompt", &self.system_prompt)
            .field("save_attempts", &self.save_attempts)
            .field("cookie_secure", &self.cookie_secure)
            .field("cors_allowed_origins", &self.cors_allowed_origins)
            .field("enable_swagger", &self.enable_swagger)
            .field("log_level", &self.log_level)
            .field("log_json", &self.log_json)
            .finish()
    }
}

impl Config {
    /// Build [`Config`] from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build [`Config`] from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .filter_map(|k| lookup(k))
                .map(|v| v.trim().to_owned())
                .find(|v| !v.is_empty())
        };

        let state_bucket = var(&["PARLEY_STATE_BUCKET", "STATE_BUCKET"]).ok_or(ConfigError::MissingBucket)?;

        let bind_address = match var(&["PARLEY_BIND"]) {
            Some(bind) => bind,
            None => {
                let port: u16 = parse_var(&var, "PORT", 8080)?;
                format!("0.0.0.0:{port}")
            }
        };

        let agent_kind = match var(&["PARLEY_AGENT"]) {
            Some(raw) => raw.parse().map_err(|_| ConfigError::UnknownAgent(raw))?,
            None => AgentKind::OpenAi,
        };

        let save_attempts: u32 = parse_var(&var, "PARLEY_SAVE_ATTEMPTS", 3)?;
        if save_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "PARLEY_SAVE_ATTEMPTS",
                value: "0".into(),
                reason: "at least one attempt is required".into(),
            });
        }

        Ok(Self {
            bind_address,
            state_bucket,
            state_prefix: var(&["PARLEY_STATE_PREFIX"]).unwrap_or_else(|| DEFAULT_PREFIX.to_owned()),
            agent_kind,
            model_id: var(&["PARLEY_MODEL_ID", "MODEL_ID"]).unwrap_or_else(|| "gpt-4o-mini".to_owned()),
            agent_url: var(&["PARLEY_AGENT_URL"])
                .unwrap_or_else(|| "https://api.openai.com/v1".to_owned()),
            api_key: var(&["PARLEY_API_KEY", "OPENAI_API_KEY"]),
            system_prompt: var(&["PARLEY_SYSTEM_PROMPT"]),
            save_attempts,
            cookie_secure: flag(var(&["PARLEY_COOKIE_SECURE"]), false),
            cors_allowed_origins: var(&["PARLEY_CORS_ORIGINS"]),
            enable_swagger: flag(var(&["PARLEY_ENABLE_SWAGGER"]), true),
            log_level: var(&["PARLEY_LOG"]).unwrap_or_else(|| "info".to_owned()),
            log_json: flag(var(&["PARLEY_LOG_JSON"]), false),
        })
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            model: self.model_id.clone(),
            default_directive: self.system_prompt.clone(),
            save_attempts: self.save_attempts,
            save_backoff: Duration::from_millis(100),
        }
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            kind: self.agent_kind,
            base_url: self.agent_url.clone(),
            api_key: self.api_key.clone(),
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn flag(value: Option<String>, default: bool) -> bool {
    match value {
        Some(v) => v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"),
        None => default,
    }
}

fn parse_var<T, V>(var: &V, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    V: Fn(&[&str]) -> Option<String>,
{
    match var(&[key]) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}
