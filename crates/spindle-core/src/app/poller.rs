//! Poller - タスクの取得と配送
//!
//! One loop per worker process:
//! 1. backpressure check (skip the claim and cool down if tripped)
//! 2. `dequeue(batch_size)` claims a batch atomically
//! 3. every claimed task is handed to the [`Dispatcher`] on its own tokio
//!    task, tracked in a `JoinSet` so shutdown can wait for it
//! 4. sleep for the adaptive interval

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::config::PollerConfig;
use crate::domain::{Task, WorkerId};
use crate::ports::TaskStore;

/// Receives claimed tasks. Failures are the dispatcher's to log.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, task: Task);
}

pub type BackpressureCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Adaptive poll interval.
///
/// - nonempty claim: reset to `min`
/// - empty claim: double, capped at `max`
/// - claim error: jump to `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollInterval {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl PollInterval {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn on_claimed(&mut self, count: usize) -> Duration {
        self.current = if count > 0 {
            self.min
        } else {
            (self.current * 2).min(self.max)
        };
        self.current
    }

    pub fn on_error(&mut self) -> Duration {
        self.current = self.max;
        self.current
    }
}

struct Shared {
    store: Arc<dyn TaskStore>,
    dispatcher: Arc<dyn Dispatcher>,
    backpressure: OnceLock<BackpressureCheck>,
    config: PollerConfig,
    worker_id: WorkerId,
    in_flight: Mutex<JoinSet<()>>,
}

pub struct Poller {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Poller {
    pub fn new(
        store: Arc<dyn TaskStore>,
        dispatcher: Arc<dyn Dispatcher>,
        config: PollerConfig,
        worker_id: WorkerId,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                store,
                dispatcher,
                backpressure: OnceLock::new(),
                config,
                worker_id,
                in_flight: Mutex::new(JoinSet::new()),
            }),
            shutdown_tx,
            join: Mutex::new(None),
        }
    }

    /// Skip claims while `check` returns true. Only the first check is kept.
    pub fn with_backpressure(self, check: BackpressureCheck) -> Self {
        if self.shared.backpressure.set(check).is_err() {
            warn!(worker_id = %self.shared.worker_id, "backpressure check already set, ignoring");
        }
        self
    }

    /// Idempotent.
    pub fn start(&self) {
        let mut join = self.join.lock().unwrap_or_else(|e| e.into_inner());
        if join.is_some() {
            return;
        }
        let _ = self.shutdown_tx.send(false);
        let shared = self.shared.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        info!(worker_id = %shared.worker_id, batch_size = shared.config.batch_size, "poller started");
        *join = Some(tokio::spawn(poll_loop(shared, shutdown_rx)));
    }

    /// Cancel the next poll. Already dispatched tasks keep running.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let join = self.join.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(join) = join {
            let _ = join.await;
            info!(worker_id = %self.shared.worker_id, "poller stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.join
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|j| !j.is_finished())
    }

    /// Claim and dispatch one batch. Returns the number claimed.
    pub async fn poll_once(&self) -> Result<usize, crate::domain::StoreError> {
        self.shared.poll_once().await
    }

    /// Wait for every dispatched task to finish.
    pub async fn drain(&self) {
        let mut set = {
            let mut in_flight = self.shared.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *in_flight)
        };
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(error = %e, "dispatched task panicked");
                }
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.shared
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Shared {
    async fn poll_once(&self) -> Result<usize, crate::domain::StoreError> {
        let tasks = self
            .store
            .dequeue(self.config.batch_size, &self.worker_id)
            .await?;
        let count = tasks.len();
        if count > 0 {
            debug!(count, worker_id = %self.worker_id, "claimed tasks");
        }

        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        // reap finished entries so the set does not grow without bound
        while let Some(joined) = in_flight.try_join_next() {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(error = %e, "dispatched task panicked");
                }
            }
        }
        for task in tasks {
            let dispatcher = self.dispatcher.clone();
            in_flight.spawn(async move { dispatcher.dispatch(task).await });
        }
        Ok(count)
    }

    fn overloaded(&self) -> bool {
        self.backpressure.get().is_some_and(|check| check())
    }
}

async fn poll_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut interval = PollInterval::new(shared.config.min_interval, shared.config.max_interval);
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let wait = if shared.overloaded() {
            warn!(worker_id = %shared.worker_id, "backpressure, skipping poll");
            shared.config.backpressure_cooldown
        } else {
            match shared.poll_once().await {
                Ok(count) => interval.on_claimed(count),
                Err(e) => {
                    error!(worker_id = %shared.worker_id, error = %e, "claim failed");
                    interval.on_error()
                }
            }
        };

        tokio::select! {
            _ = shutdown_rx.changed() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
