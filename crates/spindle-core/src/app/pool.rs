//! ExecutionPool - ハンドラ専用の実行ランタイム
//!
//! Workflow bodies are user code; they run on a dedicated multi-thread
//! runtime so a CPU-heavy handler cannot starve the poller, heartbeats or
//! the step broker. At most `threads` handlers run at once, at most
//! `max_queue` wait for a slot.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info};

use super::config::PoolConfig;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("execution queue is full ({0} waiting)")]
    QueueFull(usize),

    #[error("execution pool is shut down")]
    Closed,

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("failed to build execution runtime: {0}")]
    Build(String),
}

pub struct ExecutionPool {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    permits: Arc<Semaphore>,
    threads: usize,
    max_queue: usize,
    queued: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    /// `run` calls that have not returned to their caller yet.
    inflight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    closed: AtomicBool,
}

/// Decrements a counter when dropped, panics included.
struct Gauge(Arc<AtomicUsize>);

impl Gauge {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for Gauge {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Inflight<'a>(&'a ExecutionPool);

impl Drop for Inflight<'_> {
    fn drop(&mut self) {
        if self.0.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl ExecutionPool {
    pub fn new(config: &PoolConfig) -> Result<Self, PoolError> {
        let threads = config.threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("spindle-exec")
            .enable_all()
            .build()
            .map_err(|e| PoolError::Build(e.to_string()))?;
        info!(threads, max_queue = config.max_queue, "execution pool started");
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            permits: Arc::new(Semaphore::new(threads)),
            threads,
            max_queue: config.max_queue,
            queued: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            inflight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Run `fut` on the pool and wait for its output.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }
        let waiting = self.queued.load(Ordering::SeqCst);
        if waiting >= self.max_queue {
            return Err(PoolError::QueueFull(waiting));
        }

        self.inflight.fetch_add(1, Ordering::SeqCst);
        let _inflight = Inflight(self);
        let permits = self.permits.clone();
        let queued = Gauge::enter(&self.queued);
        let active = self.active.clone();
        let join = self.handle.spawn(async move {
            let permit = permits.acquire_owned().await;
            drop(queued);
            let _permit = permit.map_err(|_| PoolError::Closed)?;
            let _active = Gauge::enter(&active);
            Ok::<T, PoolError>(fut.await)
        });

        match join.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(PoolError::Panicked(panic_message(e.into_panic()))),
            Err(_) => Err(PoolError::Closed),
        }
    }

    /// Handlers waiting for a slot.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Refuse new work, wait for queued and running handlers to finish,
    /// then tear the runtime down. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(queued = self.queued(), active = self.active(), "draining execution pool");
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inflight.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
        self.permits.close();

        let runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
        info!("execution pool stopped");
    }
}

impl Drop for ExecutionPool {
    fn drop(&mut self) {
        // Dropping a runtime blocks, which panics inside async code.
        if let Some(runtime) = self.runtime.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            runtime.shutdown_background();
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
