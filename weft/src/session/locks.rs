//! Per-thread turn locks.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::session::SessionKey;

/// One async mutex per `(user_id, thread_id)`. A turn holds the guard from session load until
/// its final save, so the next turn of the same thread starts from the saved state.
#[derive(Default)]
pub struct SessionLocks {
    locks: DashMap<SessionKey, Arc<Mutex<()>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &SessionKey) -> TurnGuard<'_> {
        let lock = Arc::clone(&self.locks.entry(key.clone()).or_default());
        TurnGuard {
            locks: self,
            key: key.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Threads with a turn running or waiting.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held for the duration of a turn. On drop the thread's entry is removed once nobody else
/// holds or waits on it.
pub struct TurnGuard<'a> {
    locks: &'a SessionLocks,
    key: SessionKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_thread_waits_other_thread_does_not() {
        let locks = Arc::new(SessionLocks::new());
        let a = SessionKey::new("u", "a");
        let guard = locks.acquire(&a).await;

        let other = tokio::time::timeout(
            Duration::from_millis(50),
            locks.acquire(&SessionKey::new("u", "b")),
        )
        .await;
        assert!(other.is_ok());

        let blocked = tokio::time::timeout(Duration::from_millis(50), locks.acquire(&a)).await;
        assert!(blocked.is_err());

        drop(guard);
        let again = tokio::time::timeout(Duration::from_millis(50), locks.acquire(&a)).await;
        assert!(again.is_ok());
    }

    /// **Scenario**: entries go away after their last turn, so the map tracks only live threads.
    #[tokio::test]
    async fn released_threads_are_forgotten() {
        let locks = SessionLocks::new();
        for n in 0..100 {
            let _turn = locks.acquire(&SessionKey::new("u", format!("t{}", n))).await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    /// **Scenario**: a waiter keeps the entry alive, so it locks the same mutex the holder released.
    #[tokio::test]
    async fn entry_survives_while_a_turn_waits() {
        let locks = Arc::new(SessionLocks::new());
        let key = SessionKey::new("u", "a");
        let first = locks.acquire(&key).await;

        let waiter = {
            let locks = Arc::clone(&locks);
            let key = key.clone();
            tokio::spawn(async move {
                let _turn = locks.acquire(&key).await;
                locks.len()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);
        assert_eq!(locks.len(), 1);

        assert_eq!(waiter.await.unwrap(), 1);
        assert!(locks.is_empty());
    }
}
