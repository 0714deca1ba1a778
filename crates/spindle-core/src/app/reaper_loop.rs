//! ReaperLoop - クラッシュしたワーカーのタスク回収
//!
//! Heartbeat silence is the only crash signal. Only the leader sweeps; a
//! standby instance retries leadership on every tick so the sweep resumes
//! when the leader goes away.
//!
//! # フロー
//! 1. `requeue_stale`: stale and retries left → pending, retry_count += 1
//! 2. `fail_exhausted`: stale and budget spent → failed (MAX_RETRIES_EXCEEDED)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::ReaperConfig;
use super::leader::LeaderElector;
use crate::domain::{ErrorInfo, ReapedTask, StoreError};
use crate::ports::{LockError, TaskStore};

/// What one sweep touched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReapReport {
    pub requeued: Vec<ReapedTask>,
    pub failed: Vec<ReapedTask>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

struct Inner {
    store: Arc<dyn TaskStore>,
    elector: Arc<LeaderElector>,
    config: ReaperConfig,
    reaping: AtomicBool,
}

pub struct ReaperLoop {
    inner: Arc<Inner>,
    shutdown_tx: watch::Sender<bool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ReaperLoop {
    pub fn new(store: Arc<dyn TaskStore>, elector: Arc<LeaderElector>, config: ReaperConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store,
                elector,
                config,
                reaping: AtomicBool::new(false),
            }),
            shutdown_tx,
            join: Mutex::new(None),
        }
    }

    /// Try to become leader and start the sweep timer.
    ///
    /// Returns whether this instance is leader right now. The timer runs
    /// either way; a standby only sweeps after winning a later election.
    pub async fn start(&self) -> Result<bool, LockError> {
        if !self.spawn_timer() {
            return Ok(self.inner.elector.is_leader());
        }

        let leader = self.inner.elector.try_become_leader().await?;
        if leader {
            info!(owner = %self.inner.elector.owner(), "reaper started as leader");
        } else {
            info!(owner = %self.inner.elector.owner(), "reaper started in standby");
        }
        Ok(leader)
    }

    /// false when the timer was already running.
    fn spawn_timer(&self) -> bool {
        let mut join = self.join.lock().unwrap_or_else(|e| e.into_inner());
        if join.is_some() {
            return false;
        }
        let _ = self.shutdown_tx.send(false);

        let inner = self.inner.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *join = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => continue,
                    _ = ticker.tick() => {}
                }
                if !inner.elector.is_leader() {
                    match inner.elector.try_become_leader().await {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(e) => {
                            warn!(error = %e, "leader election failed");
                            continue;
                        }
                    }
                }
                if let Err(e) = inner.reap().await {
                    error!(error = %e, "reap cycle failed");
                }
            }
        }));
        true
    }

    /// One sweep. Concurrent calls return an empty report while a sweep is
    /// already in flight.
    pub async fn reap(&self) -> Result<ReapReport, StoreError> {
        self.inner.reap().await
    }

    pub fn is_leader(&self) -> bool {
        self.inner.elector.is_leader()
    }

    /// Stop the timer and give up leadership.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let join = self.join.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(join) = join {
            let _ = join.await;
        }
        if let Err(e) = self.inner.elector.release_leadership().await {
            warn!(error = %e, "failed to release reaper leadership");
        }
    }
}

impl Inner {
    async fn reap(&self) -> Result<ReapReport, StoreError> {
        if self
            .reaping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("reap already in progress, skipping");
            return Ok(ReapReport::default());
        }
        let result = self.sweep().await;
        self.reaping.store(false, Ordering::Release);
        result
    }

    async fn sweep(&self) -> Result<ReapReport, StoreError> {
        let threshold = self.config.stale_threshold;
        let requeued = self.store.requeue_stale(threshold).await?;
        for task in &requeued {
            warn!(
                task_id = %task.id,
                workflow = %task.workflow_name,
                retry_count = task.retry_count,
                "requeued stale task"
            );
        }

        let failed = self
            .store
            .fail_exhausted(threshold, &ErrorInfo::max_retries_exceeded())
            .await?;
        for task in &failed {
            error!(
                task_id = %task.id,
                workflow = %task.workflow_name,
                retry_count = task.retry_count,
                "stale task exhausted its retries"
            );
        }

        if !requeued.is_empty() || !failed.is_empty() {
            info!(requeued = requeued.len(), failed = failed.len(), "reap cycle finished");
        }
        Ok(ReapReport { requeued, failed })
    }
}
