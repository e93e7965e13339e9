//! Per-thread state that survives between turns.
//!
//! A [`Session`] is decoded from a [`SessionRecord`] (three JSON blobs) at the start of a
//! turn and encoded back at turn boundaries. Stores only move records; they never look inside.
//!
//! **Interaction**: Loaded and saved by the [`Compiler`](crate::compiler::Compiler);
//! [`SessionLocks`] keeps two turns of one thread from overlapping.

mod locks;
mod memory;
mod sqlite;

pub use locks::{SessionLocks, TurnGuard};
pub use memory::InMemorySessionStore;
pub use sqlite::SqliteSessionStore;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::context::ExecutionContext;
use crate::task::TaskIndex;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: String,
    pub thread_id: String,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            thread_id: thread_id.into(),
        }
    }

    /// A key for a fresh thread with a random id.
    pub fn new_thread(user_id: impl Into<String>) -> Self {
        Self::new(user_id, uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.thread_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session storage error: {0}")]
    Storage(String),
    #[error("session serialization error: {0}")]
    Serialization(String),
    #[error("session {key} is corrupt: {message}")]
    Corrupt { key: String, message: String },
}

/// What a store persists for one thread.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub context: Value,
    pub checkpoint: Value,
    /// Application data carried through unchanged.
    pub store: Value,
}

/// One of a user's threads, as listed by [`SessionStore::list_threads`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub thread_id: String,
    pub updated_at: DateTime<Utc>,
}

/// Turn bookkeeping stored in the checkpoint blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnCheckpoint {
    /// First index the next round may use.
    pub next_index: TaskIndex,
    /// Completed turns.
    pub turns: u32,
    pub last_answer: Option<String>,
    /// Replan feedback of every turn, oldest first.
    #[serde(default)]
    pub feedback_history: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub key: SessionKey,
    pub context: ExecutionContext,
    pub checkpoint: TurnCheckpoint,
    pub store: Value,
}

impl Session {
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            context: ExecutionContext::new(),
            checkpoint: TurnCheckpoint {
                next_index: 1,
                ..TurnCheckpoint::default()
            },
            store: Value::Null,
        }
    }

    pub fn feedback_history(&self) -> &[String] {
        &self.checkpoint.feedback_history
    }

    /// Decodes a stored record. Null blobs decode as empty state.
    pub fn from_record(key: SessionKey, record: SessionRecord) -> Result<Self, SessionError> {
        let corrupt = |what: &str, e: serde_json::Error| SessionError::Corrupt {
            key: key.to_string(),
            message: format!("{}: {}", what, e),
        };
        let context = match record.context {
            Value::Null => ExecutionContext::new(),
            v => serde_json::from_value(v).map_err(|e| corrupt("context", e))?,
        };
        let mut checkpoint: TurnCheckpoint = match record.checkpoint {
            Value::Null => TurnCheckpoint::default(),
            v => serde_json::from_value(v).map_err(|e| corrupt("checkpoint", e))?,
        };
        let floor = context.max_index().map_or(1, |i| i + 1);
        checkpoint.next_index = checkpoint.next_index.max(floor);
        Ok(Self {
            key,
            context,
            checkpoint,
            store: record.store,
        })
    }

    pub fn to_record(&self) -> Result<SessionRecord, SessionError> {
        let encode = |v: Result<Value, serde_json::Error>| {
            v.map_err(|e| SessionError::Serialization(e.to_string()))
        };
        Ok(SessionRecord {
            context: encode(serde_json::to_value(&self.context))?,
            checkpoint: encode(serde_json::to_value(&self.checkpoint))?,
            store: self.store.clone(),
        })
    }
}

/// Persistence for session records, keyed by `(user_id, thread_id)`.
///
/// Last writer wins; callers serialize turns per thread (see [`SessionLocks`]).
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, key: &SessionKey) -> Result<Option<SessionRecord>, SessionError>;

    async fn save(&self, key: &SessionKey, record: &SessionRecord) -> Result<(), SessionError>;

    /// Threads of `user_id`, most recently updated first.
    async fn list_threads(&self, user_id: &str) -> Result<Vec<ThreadInfo>, SessionError>;
}
