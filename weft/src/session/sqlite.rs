//! SQLite-backed session store. Persistent across process restarts.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use crate::session::{SessionError, SessionKey, SessionRecord, SessionStore, ThreadInfo};

fn storage(e: impl std::fmt::Display) -> SessionError {
    SessionError::Storage(e.to_string())
}

fn decode_blob(key: &SessionKey, column: &str, text: &str) -> Result<Value, SessionError> {
    serde_json::from_str(text).map_err(|e| SessionError::Corrupt {
        key: key.to_string(),
        message: format!("{}: {}", column, e),
    })
}

/// One row per `(user_id, thread_id)` in table `user_threads`; blobs are JSON text.
///
/// Uses `spawn_blocking` and a connection per call.
///
/// **Interaction**: Used as `Arc<dyn SessionStore>` by the
/// [`Compiler`](crate::compiler::Compiler).
pub struct SqliteSessionStore {
    db_path: PathBuf,
}

impl SqliteSessionStore {
    /// Opens (or creates) the database and ensures the table exists.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = rusqlite::Connection::open(&db_path).map_err(storage)?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS user_threads (
                user_id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                context TEXT NOT NULL,
                checkpoint TEXT NOT NULL,
                store TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, thread_id)
            )
            "#,
            [],
        )
        .map_err(storage)?;
        Ok(Self { db_path })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, key: &SessionKey) -> Result<Option<SessionRecord>, SessionError> {
        let db_path = self.db_path.clone();
        let (user_id, thread_id) = (key.user_id.clone(), key.thread_id.clone());
        let row = tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage)?;
            conn.query_row(
                "SELECT context, checkpoint, store FROM user_threads
                 WHERE user_id = ?1 AND thread_id = ?2",
                params![user_id, thread_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(storage)
        })
        .await
        .map_err(storage)??;

        let Some((context, checkpoint, store)) = row else {
            return Ok(None);
        };
        Ok(Some(SessionRecord {
            context: decode_blob(key, "context", &context)?,
            checkpoint: decode_blob(key, "checkpoint", &checkpoint)?,
            store: decode_blob(key, "store", &store)?,
        }))
    }

    async fn save(&self, key: &SessionKey, record: &SessionRecord) -> Result<(), SessionError> {
        let encode = |v: &Value| {
            serde_json::to_string(v).map_err(|e| SessionError::Serialization(e.to_string()))
        };
        let context = encode(&record.context)?;
        let checkpoint = encode(&record.checkpoint)?;
        let store = encode(&record.store)?;
        let now = Utc::now().timestamp_millis();
        let db_path = self.db_path.clone();
        let (user_id, thread_id) = (key.user_id.clone(), key.thread_id.clone());
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage)?;
            conn.execute(
                r#"
                INSERT INTO user_threads
                (user_id, thread_id, context, checkpoint, store, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                ON CONFLICT (user_id, thread_id) DO UPDATE SET
                    context = excluded.context,
                    checkpoint = excluded.checkpoint,
                    store = excluded.store,
                    updated_at = excluded.updated_at
                "#,
                params![user_id, thread_id, context, checkpoint, store, now],
            )
            .map_err(storage)?;
            Ok::<(), SessionError>(())
        })
        .await
        .map_err(storage)?
    }

    async fn list_threads(&self, user_id: &str) -> Result<Vec<ThreadInfo>, SessionError> {
        let db_path = self.db_path.clone();
        let user_id = user_id.to_string();
        let rows = tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage)?;
            let mut stmt = conn
                .prepare(
                    "SELECT thread_id, updated_at FROM user_threads WHERE user_id = ?1
                     ORDER BY updated_at DESC, thread_id ASC",
                )
                .map_err(storage)?;
            let rows = stmt
                .query_map(params![user_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(storage)?;
            let threads = rows.collect::<Result<Vec<_>, _>>().map_err(storage)?;
            Ok::<_, SessionError>(threads)
        })
        .await
        .map_err(storage)??;

        Ok(rows
            .into_iter()
            .map(|(thread_id, ms)| ThreadInfo {
                thread_id,
                updated_at: DateTime::from_timestamp_millis(ms).unwrap_or_default(),
            })
            .collect())
    }
}
