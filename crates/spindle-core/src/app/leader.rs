//! LeaderElector - TTL ロックによるリーダー選出
//!
//! Best-effort mutual exclusion: the lock value is this elector's worker id,
//! the lock expires after `ttl` unless renewed, and renewal runs every
//! `ttl / 2` only while the value still matches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::ports::{LockError, LockStore};

pub const REAPER_LEADER_KEY: &str = "spindle:reaper:leader";

pub struct LeaderElector {
    store: Arc<dyn LockStore>,
    key: String,
    owner: String,
    ttl: Duration,
    is_leader: Arc<AtomicBool>,
    renewal: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderElector {
    pub fn new(store: Arc<dyn LockStore>, owner: impl Into<String>, ttl: Duration) -> Self {
        Self::with_key(store, REAPER_LEADER_KEY, owner, ttl)
    }

    pub fn with_key(
        store: Arc<dyn LockStore>,
        key: impl Into<String>,
        owner: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            owner: owner.into(),
            ttl,
            is_leader: Arc::new(AtomicBool::new(false)),
            renewal: Mutex::new(None),
        }
    }

    /// Acquire the lock if nobody holds it. On success a renewal timer is
    /// started; calling again while already leader returns `true`.
    pub async fn try_become_leader(&self) -> Result<bool, LockError> {
        if self.is_leader() {
            return Ok(true);
        }
        if !self.store.try_acquire(&self.key, &self.owner, self.ttl).await? {
            return Ok(false);
        }
        self.is_leader.store(true, Ordering::SeqCst);
        info!(key = %self.key, owner = %self.owner, "acquired leadership");
        self.spawn_renewal();
        Ok(true)
    }

    fn spawn_renewal(&self) {
        let store = self.store.clone();
        let key = self.key.clone();
        let owner = self.owner.clone();
        let ttl = self.ttl;
        let is_leader = self.is_leader.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval((ttl / 2).max(Duration::from_millis(1)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.extend(&key, &owner, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(%key, %owner, "leadership lost, stopping renewal");
                        is_leader.store(false, Ordering::SeqCst);
                        return;
                    }
                    // Transient; the next tick retries before the TTL runs out.
                    Err(e) => warn!(%key, error = %e, "leadership renewal failed"),
                }
            }
        });

        let mut slot = self.renewal.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Stop renewing and delete the lock if we still own it.
    pub async fn release_leadership(&self) -> Result<(), LockError> {
        let renewal = self
            .renewal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = renewal {
            handle.abort();
        }
        if self.is_leader.swap(false, Ordering::SeqCst) {
            self.store.release(&self.key, &self.owner).await?;
            info!(key = %self.key, owner = %self.owner, "released leadership");
        }
        Ok(())
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Drop for LeaderElector {
    fn drop(&mut self) {
        if let Some(handle) = self
            .renewal
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}
