//! In-memory session store.
//!
//! Objects are kept as serialized JSON so the store exercises the same
//! encode/decode path as the durable backends.  Failure switches and a save
//! counter make it usable as a test double for the coordinator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    decode_record, encode_record, normalize_prefix, object_key, LoadOutcome, SessionRecord,
    SessionStore, DEFAULT_PREFIX,
};
use crate::error::StoreError;

#[derive(Debug)]
pub struct InMemorySessionStore {
    prefix: String,
    objects: RwLock<HashMap<String, Vec<u8>>>,
    save_calls: AtomicUsize,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }

    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            prefix: normalize_prefix(prefix),
            objects: RwLock::new(HashMap::new()),
            save_calls: AtomicUsize::new(0),
            fail_loads: AtomicBool::new(false),
            fail_saves: AtomicBool::new(false),
        }
    }

    /// Number of `save` calls made so far, failed ones included.
    pub fn save_count(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    /// Make every subsequent `load` fail with a backend error.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `save` fail with a backend error.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Keys currently stored, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, session_id: &str) -> Result<LoadOutcome, StoreError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("in-memory store: load failure injected".into()));
        }
        let key = object_key(&self.prefix, session_id);
        match self.objects.read().await.get(&key) {
            Some(bytes) => Ok(LoadOutcome::Found(decode_record(bytes)?)),
            None => Ok(LoadOutcome::NotFound),
        }
    }

    async fn save(&self, session_id: &str, record: &SessionRecord) -> Result<(), StoreError> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("in-memory store: save failure injected".into()));
        }
        let body = encode_record(record)?;
        let key = object_key(&self.prefix, session_id);
        self.objects.write().await.insert(key, body);
        Ok(())
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Message;

    #[tokio::test]
    async fn get_returns_not_found_for_missing_session() {
        let store = InMemorySessionStore::new();
        assert_eq!(store.load("missing").await.unwrap(), LoadOutcome::NotFound);
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let store = InMemorySessionStore::new();
        let record = SessionRecord {
            messages: vec![Message::user("a"), Message::assistant("b")],
            system_directive: None,
        };
        store.save("s", &record).await.unwrap();

        assert_eq!(store.load("s").await.unwrap(), LoadOutcome::Found(record));
        assert_eq!(store.keys().await, vec!["sessions/s.json".to_string()]);
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_store_errors() {
        let store = InMemorySessionStore::new();
        store.set_fail_saves(true);
        assert!(store.save("s", &SessionRecord::default()).await.is_err());
        assert_eq!(store.save_count(), 1);

        store.set_fail_loads(true);
        assert!(matches!(store.load("s").await, Err(StoreError::Backend(_))));
    }
}
