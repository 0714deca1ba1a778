//! Backpressure - ポーリングを止めるべきかの判定
//!
//! Two signals: handlers waiting for an execution-pool slot, and the p99
//! scheduling lag of the orchestration runtime. The poller consults
//! [`Backpressure::is_overloaded`] before every claim.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::config::BackpressureConfig;

const LAG_WINDOW: usize = 128;

/// Samples how late a fixed-period timer fires.
///
/// A timer that should fire every `resolution` but shows up 80ms late means
/// something is hogging the runtime.
pub struct LagMonitor {
    samples: Arc<Mutex<VecDeque<Duration>>>,
    sampler: Mutex<Option<JoinHandle<()>>>,
    resolution: Duration,
}

impl LagMonitor {
    pub fn new(resolution: Duration) -> Self {
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(LAG_WINDOW))),
            sampler: Mutex::new(None),
            resolution,
        }
    }

    /// Start sampling on the current runtime; no-op when already running.
    pub fn start(&self) {
        let mut sampler = self.sampler.lock().unwrap_or_else(|e| e.into_inner());
        if sampler.is_some() {
            return;
        }
        let samples = self.samples.clone();
        let resolution = self.resolution;
        *sampler = Some(tokio::spawn(async move {
            loop {
                let expected = Instant::now() + resolution;
                tokio::time::sleep_until(expected).await;
                let late = Instant::now().saturating_duration_since(expected);
                record(&samples, late);
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .sampler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    /// 99th percentile of the recent samples, zero before the first one.
    pub fn p99(&self) -> Duration {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        percentile(samples.iter().copied().collect(), 0.99)
    }

    #[cfg(test)]
    fn record(&self, late: Duration) {
        record(&self.samples, late);
    }
}

impl Drop for LagMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn record(samples: &Mutex<VecDeque<Duration>>, late: Duration) {
    let mut samples = samples.lock().unwrap_or_else(|e| e.into_inner());
    if samples.len() == LAG_WINDOW {
        samples.pop_front();
    }
    samples.push_back(late);
}

fn percentile(mut values: Vec<Duration>, q: f64) -> Duration {
    if values.is_empty() {
        return Duration::ZERO;
    }
    values.sort_unstable();
    let rank = ((values.len() as f64) * q).ceil() as usize;
    values[rank.clamp(1, values.len()) - 1]
}

pub struct Backpressure {
    config: BackpressureConfig,
    lag: Arc<LagMonitor>,
    queue_depth: Box<dyn Fn() -> usize + Send + Sync>,
}

impl Backpressure {
    pub fn new<F>(config: BackpressureConfig, lag: Arc<LagMonitor>, queue_depth: F) -> Self
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        Self {
            config,
            lag,
            queue_depth: Box::new(queue_depth),
        }
    }

    pub fn is_overloaded(&self) -> bool {
        let depth = (self.queue_depth)();
        if depth >= self.config.max_queue_depth {
            debug!(depth, max = self.config.max_queue_depth, "execution queue is full");
            return true;
        }
        let lag = self.lag.p99();
        if lag > self.config.max_lag {
            debug!(lag_ms = lag.as_millis() as u64, "scheduling lag too high");
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn p99_of_empty_window_is_zero() {
        assert_eq!(LagMonitor::new(Duration::from_millis(10)).p99(), Duration::ZERO);
    }

    #[test]
    fn p99_picks_the_tail() {
        let monitor = LagMonitor::new(Duration::from_millis(10));
        for _ in 0..99 {
            monitor.record(Duration::from_millis(1));
        }
        monitor.record(Duration::from_millis(500));
        assert_eq!(monitor.p99(), Duration::from_millis(1));

        monitor.record(Duration::from_millis(500));
        assert_eq!(monitor.p99(), Duration::from_millis(500));
    }

    #[test]
    fn window_is_bounded() {
        let monitor = LagMonitor::new(Duration::from_millis(10));
        for _ in 0..LAG_WINDOW {
            monitor.record(Duration::from_secs(1));
        }
        for _ in 0..LAG_WINDOW {
            monitor.record(Duration::ZERO);
        }
        assert_eq!(monitor.p99(), Duration::ZERO);
    }

    #[test]
    fn trips_on_queue_depth_or_lag() {
        let depth = Arc::new(AtomicUsize::new(0));
        let lag = Arc::new(LagMonitor::new(Duration::from_millis(10)));
        let probe = depth.clone();
        let bp = Backpressure::new(
            BackpressureConfig {
                max_queue_depth: 5,
                max_lag: Duration::from_millis(100),
            },
            lag.clone(),
            move || probe.load(Ordering::SeqCst),
        );
        assert!(!bp.is_overloaded());

        depth.store(5, Ordering::SeqCst);
        assert!(bp.is_overloaded());

        depth.store(0, Ordering::SeqCst);
        for _ in 0..10 {
            lag.record(Duration::from_millis(250));
        }
        assert!(bp.is_overloaded());
    }
}
