//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use anyhow::Context;
use parley_core::agent::build_agent;
use parley_core::{ChatCoordinator, StoreLocation};
use tracing::info;

use crate::config::Config;

/// State shared across all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Loads, streams and saves chat turns.
    pub coordinator: ChatCoordinator,
}

impl AppState {
    /// Open the configured session store and agent backend.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let location: StoreLocation = config
            .state_bucket
            .parse()
            .with_context(|| format!("invalid session store location '{}'", config.state_bucket))?;
        let store = location
            .connect(&config.state_prefix)
            .await
            .with_context(|| format!("failed to open session store at {location}"))?;
        info!(location = %location, backend = store.name(), prefix = %config.state_prefix, "session store ready");

        let agent = build_agent(&config.agent_settings()).context("failed to build agent")?;
        info!(agent = agent.name(), model = %config.model_id, "agent ready");

        let coordinator = ChatCoordinator::new(store, agent, config.coordinator_options());
        Ok(Self {
            config: Arc::new(config),
            coordinator,
        })
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned()).unwrap()
    }

    #[tokio::test]
    async fn filesystem_bucket_and_echo_agent() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = dir.path().join("bucket");
        let state = AppState::from_config(config(&[
            ("STATE_BUCKET", bucket.to_str().unwrap()),
            ("PARLEY_AGENT", "echo"),
        ]))
        .await
        .unwrap();

        assert_eq!(state.coordinator.store_name(), "filesystem");
        assert_eq!(state.coordinator.agent_name(), "echo");
        assert!(bucket.join("sessions").is_dir());
    }

    #[tokio::test]
    async fn unsupported_scheme_fails_startup() {
        let result = AppState::from_config(config(&[("STATE_BUCKET", "s3://bucket")])).await;
        let err = match result {
            Err(e) => e,
            Ok(_) => panic!("expected startup failure"),
        };
        assert!(err.to_string().contains("s3://bucket"));
    }
}
