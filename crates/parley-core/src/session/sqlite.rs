//! SQLite backend.
//!
//! Session objects live in the `session_objects` table, keyed exactly like
//! the object-store layout (`sessions/<id>.json`).  Migrations are embedded
//! at compile time from `./migrations` and run on [`SqliteSessionStore::connect`].
//!
//! Queries use the runtime-checked `sqlx::query` form so no `DATABASE_URL`
//! is needed at build time.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use super::{
    decode_record, encode_record, normalize_prefix, object_key, LoadOutcome, SessionRecord,
    SessionStore,
};
use crate::error::StoreError;

#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
    prefix: String,
}

impl SqliteSessionStore {
    /// Open (or create) the database at `url` and run pending migrations.
    ///
    /// `url` is a sqlx SQLite URL such as `"sqlite://parley.db"`.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(sqlx::Error::from)?;
        info!(url, "sqlite session store ready");
        Ok(Self {
            pool,
            prefix: normalize_prefix(prefix),
        })
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, session_id: &str) -> Result<LoadOutcome, StoreError> {
        let key = object_key(&self.prefix, session_id);
        let row: Option<(String,)> =
            sqlx::query_as("SELECT body FROM session_objects WHERE key = ?1")
                .bind(&key)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((body,)) => {
                let record = decode_record(body.as_bytes())?;
                debug!(session_id, messages = record.messages.len(), "loaded session row");
                Ok(LoadOutcome::Found(record))
            }
            None => Ok(LoadOutcome::NotFound),
        }
    }

    async fn save(&self, session_id: &str, record: &SessionRecord) -> Result<(), StoreError> {
        let key = object_key(&self.prefix, session_id);
        let body = String::from_utf8(encode_record(record)?)
            .map_err(|e| StoreError::Backend(format!("encoded record is not UTF-8: {e}")))?;
        let updated_at = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO session_objects (key, body, content_type, updated_at) \
             VALUES (?1, ?2, 'application/json', ?3) \
             ON CONFLICT(key) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
        )
        .bind(&key)
        .bind(&body)
        .bind(&updated_at)
        .execute(&self.pool)
        .await?;

        debug!(session_id, bytes = body.len(), "upserted session row");
        Ok(())
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}
