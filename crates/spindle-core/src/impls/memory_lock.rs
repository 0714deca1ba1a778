//! InMemoryLockStore - single-process stand-in for the Redis lock.
//!
//! Expiry is measured with `tokio::time::Instant`, so tests running with a
//! paused clock can let a lock lapse by advancing time.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::ports::{LockError, LockStore};

struct Held {
    owner: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct InMemoryLockStore {
    locks: Mutex<HashMap<String, Held>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn live<'a>(locks: &'a HashMap<String, Held>, key: &str) -> Option<&'a Held> {
    locks.get(key).filter(|held| held.expires_at > Instant::now())
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut locks = self.locks.lock().await;
        if live(&locks, key).is_some() {
            return Ok(false);
        }
        locks.insert(
            key.to_string(),
            Held {
                owner: owner.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn extend(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut locks = self.locks.lock().await;
        if live(&locks, key).is_none_or(|held| held.owner != owner) {
            return Ok(false);
        }
        if let Some(held) = locks.get_mut(key) {
            held.expires_at = Instant::now() + ttl;
        }
        Ok(true)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool, LockError> {
        let mut locks = self.locks.lock().await;
        if live(&locks, key).is_none_or(|held| held.owner != owner) {
            return Ok(false);
        }
        locks.remove(key);
        Ok(true)
    }

    async fn holder(&self, key: &str) -> Result<Option<String>, LockError> {
        let locks = self.locks.lock().await;
        Ok(live(&locks, key).map(|held| held.owner.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "spindle:reaper:leader";

    #[tokio::test(start_paused = true)]
    async fn only_one_owner_until_expiry() {
        let store = InMemoryLockStore::new();
        let ttl = Duration::from_secs(30);

        assert!(store.try_acquire(KEY, "a", ttl).await.unwrap());
        assert!(!store.try_acquire(KEY, "b", ttl).await.unwrap());
        assert!(!store.extend(KEY, "b", ttl).await.unwrap());
        assert!(!store.release(KEY, "b").await.unwrap());
        assert_eq!(store.holder(KEY).await.unwrap().as_deref(), Some("a"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.try_acquire(KEY, "b", ttl).await.unwrap());
        assert!(!store.extend(KEY, "a", ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn extend_keeps_lock_alive() {
        let store = InMemoryLockStore::new();
        let ttl = Duration::from_secs(10);
        assert!(store.try_acquire(KEY, "a", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.extend(KEY, "a", ttl).await.unwrap());
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.holder(KEY).await.unwrap().as_deref(), Some("a"));

        assert!(store.release(KEY, "a").await.unwrap());
        assert_eq!(store.holder(KEY).await.unwrap(), None);
    }
}
