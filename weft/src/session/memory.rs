//! In-memory session store. Not persistent.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::session::{SessionError, SessionKey, SessionRecord, SessionStore, ThreadInfo};

/// Records in a shared map. Clones share the same map.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    inner: Arc<RwLock<HashMap<SessionKey, (SessionRecord, DateTime<Utc>)>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, key: &SessionKey) -> Result<Option<SessionRecord>, SessionError> {
        Ok(self.inner.read().await.get(key).map(|(r, _)| r.clone()))
    }

    async fn save(&self, key: &SessionKey, record: &SessionRecord) -> Result<(), SessionError> {
        self.inner
            .write()
            .await
            .insert(key.clone(), (record.clone(), Utc::now()));
        Ok(())
    }

    async fn list_threads(&self, user_id: &str) -> Result<Vec<ThreadInfo>, SessionError> {
        let guard = self.inner.read().await;
        let mut threads: Vec<ThreadInfo> = guard
            .iter()
            .filter(|(k, _)| k.user_id == user_id)
            .map(|(k, (_, at))| ThreadInfo {
                thread_id: k.thread_id.clone(),
                updated_at: *at,
            })
            .collect();
        threads.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.thread_id.cmp(&b.thread_id))
        });
        Ok(threads)
    }
}
