//! Filesystem "bucket" backend.
//!
//! Each session object is a file at `<root>/<prefix><session_id>.json`.
//! Saves write a uniquely named temporary sibling first and rename it over
//! the target, so a concurrent reader sees either the old or the new object.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    decode_record, encode_record, normalize_prefix, object_key, LoadOutcome, SessionRecord,
    SessionStore,
};
use crate::error::StoreError;

#[derive(Debug, Clone)]
pub struct FsSessionStore {
    root: PathBuf,
    prefix: String,
}

impl FsSessionStore {
    /// Open the bucket at `root`, creating the prefix directory if needed.
    pub async fn open(root: impl AsRef<Path>, prefix: &str) -> Result<Self, StoreError> {
        let store = Self {
            root: root.as_ref().to_path_buf(),
            prefix: normalize_prefix(prefix),
        };
        tokio::fs::create_dir_all(store.root.join(&store.prefix)).await?;
        info!(root = %store.root.display(), prefix = %store.prefix, "filesystem session store ready");
        Ok(store)
    }

    fn object_path(&self, session_id: &str) -> PathBuf {
        self.root.join(object_key(&self.prefix, session_id))
    }
}

#[async_trait]
impl SessionStore for FsSessionStore {
    async fn load(&self, session_id: &str) -> Result<LoadOutcome, StoreError> {
        let path = self.object_path(session_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let record = decode_record(&bytes)?;
                debug!(session_id, messages = record.messages.len(), "loaded session object");
                Ok(LoadOutcome::Found(record))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(LoadOutcome::NotFound),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn save(&self, session_id: &str, record: &SessionRecord) -> Result<(), StoreError> {
        let path = self.object_path(session_id);
        let body = encode_record(record)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        if let Err(e) = tokio::fs::write(&tmp, &body).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(session_id, bytes = body.len(), "wrote session object");
        Ok(())
    }

    fn name(&self) -> &str {
        "filesystem"
    }
}
