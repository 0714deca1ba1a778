//! EngineConfig - 実行時パラメータ
//!
//! Every tunable has a default; `from_env` overrides them from `SPINDLE_*`
//! environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `SPINDLE_WORKER_ID` | `worker-<ulid>` |
//! | `SPINDLE_BATCH_SIZE` | 10 |
//! | `SPINDLE_POLL_MIN_MS` / `SPINDLE_POLL_MAX_MS` | 100 / 500 |
//! | `SPINDLE_STALE_THRESHOLD_SECS` | 300 |
//! | `SPINDLE_REAP_INTERVAL_MS` | 10000 |
//! | `SPINDLE_LEADER_TTL_SECS` | 30 |
//! | `SPINDLE_HEARTBEAT_INTERVAL_MS` | 5000 |
//! | `SPINDLE_MAX_QUEUE_DEPTH` | 1000 |
//! | `SPINDLE_MAX_LOOP_LAG_MS` | 100 |
//! | `SPINDLE_BACKOFF_INITIAL_MS` / `_MULTIPLIER` / `_MAX_MS` | 1000 / 4.0 / 60000 |
//! | `SPINDLE_BRIDGE_TIMEOUT_MS` | 30000 |
//! | `SPINDLE_POOL_THREADS` | max(2, cpus - 1) |
//! | `SPINDLE_POOL_MAX_QUEUE` | 10000 |

use std::str::FromStr;
use std::time::Duration;

use super::backoff::BackoffPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    pub batch_size: usize,
    pub min_interval: Duration,
    pub max_interval: Duration,
    /// Wait after a poll skipped for backpressure.
    pub backpressure_cooldown: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(500),
            backpressure_cooldown: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReaperConfig {
    /// A running task whose heartbeat is older than this is presumed dead.
    pub stale_threshold: Duration,
    pub interval: Duration,
    pub leader_ttl: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(300),
            interval: Duration::from_secs(10),
            leader_ttl: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackpressureConfig {
    /// Handlers waiting for a pool slot.
    pub max_queue_depth: usize,
    /// p99 scheduling lag of the orchestration runtime.
    pub max_lag: Duration,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 1000,
            max_lag: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub threads: usize,
    pub max_queue: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            threads: cpus.saturating_sub(1).max(2),
            max_queue: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EngineConfig {
    /// Fixed worker identity; generated when `None`.
    pub worker_id: Option<String>,
    pub poller: PollerConfig,
    pub reaper: ReaperConfig,
    pub heartbeat_interval: HeartbeatInterval,
    pub backpressure: BackpressureConfig,
    pub backoff: BackoffPolicy,
    pub bridge_timeout: BridgeTimeout,
    pub pool: PoolConfig,
}

/// Newtype so `EngineConfig` can derive `Default`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatInterval(pub Duration);

impl Default for HeartbeatInterval {
    fn default() -> Self {
        Self(Duration::from_millis(5000))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BridgeTimeout(pub Duration);

impl Default for BridgeTimeout {
    fn default() -> Self {
        Self(Duration::from_millis(30_000))
    }
}

impl EngineConfig {
    /// Defaults overridden by `SPINDLE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let mut cfg = EngineConfig::default();

        cfg.worker_id = env.string("SPINDLE_WORKER_ID");

        env.set("SPINDLE_BATCH_SIZE", &mut cfg.poller.batch_size)?;
        env.set_millis("SPINDLE_POLL_MIN_MS", &mut cfg.poller.min_interval)?;
        env.set_millis("SPINDLE_POLL_MAX_MS", &mut cfg.poller.max_interval)?;

        env.set_secs("SPINDLE_STALE_THRESHOLD_SECS", &mut cfg.reaper.stale_threshold)?;
        env.set_millis("SPINDLE_REAP_INTERVAL_MS", &mut cfg.reaper.interval)?;
        env.set_secs("SPINDLE_LEADER_TTL_SECS", &mut cfg.reaper.leader_ttl)?;

        env.set_millis("SPINDLE_HEARTBEAT_INTERVAL_MS", &mut cfg.heartbeat_interval.0)?;

        env.set("SPINDLE_MAX_QUEUE_DEPTH", &mut cfg.backpressure.max_queue_depth)?;
        env.set_millis("SPINDLE_MAX_LOOP_LAG_MS", &mut cfg.backpressure.max_lag)?;

        env.set_millis("SPINDLE_BACKOFF_INITIAL_MS", &mut cfg.backoff.initial)?;
        env.set("SPINDLE_BACKOFF_MULTIPLIER", &mut cfg.backoff.multiplier)?;
        env.set_millis("SPINDLE_BACKOFF_MAX_MS", &mut cfg.backoff.max)?;

        env.set_millis("SPINDLE_BRIDGE_TIMEOUT_MS", &mut cfg.bridge_timeout.0)?;

        env.set("SPINDLE_POOL_THREADS", &mut cfg.pool.threads)?;
        env.set("SPINDLE_POOL_MAX_QUEUE", &mut cfg.pool.max_queue)?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the timers cannot run with. `EngineBuilder::build`
    /// calls this for hand-built configs too.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, value: String, reason: &str| ConfigError::Invalid {
            key: key.to_string(),
            value,
            reason: reason.to_string(),
        };
        if self.poller.batch_size == 0 {
            return Err(invalid("SPINDLE_BATCH_SIZE", "0".into(), "must be positive"));
        }
        if self.poller.min_interval.is_zero() {
            return Err(invalid("SPINDLE_POLL_MIN_MS", "0".into(), "must be positive"));
        }
        if self.poller.min_interval > self.poller.max_interval {
            return Err(invalid(
                "SPINDLE_POLL_MIN_MS",
                self.poller.min_interval.as_millis().to_string(),
                "must not exceed SPINDLE_POLL_MAX_MS",
            ));
        }
        if self.reaper.interval.is_zero() {
            return Err(invalid("SPINDLE_REAP_INTERVAL_MS", "0".into(), "must be positive"));
        }
        if self.reaper.leader_ttl.is_zero() {
            return Err(invalid("SPINDLE_LEADER_TTL_SECS", "0".into(), "must be positive"));
        }
        if self.heartbeat_interval.0.is_zero() {
            return Err(invalid("SPINDLE_HEARTBEAT_INTERVAL_MS", "0".into(), "must be positive"));
        }
        // a live task must beat at least once per stale window
        if self.heartbeat_interval.0 >= self.reaper.stale_threshold {
            return Err(invalid(
                "SPINDLE_HEARTBEAT_INTERVAL_MS",
                self.heartbeat_interval.0.as_millis().to_string(),
                "must be shorter than SPINDLE_STALE_THRESHOLD_SECS",
            ));
        }
        if self.bridge_timeout.0.is_zero() {
            return Err(invalid("SPINDLE_BRIDGE_TIMEOUT_MS", "0".into(), "must be positive"));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(invalid(
                "SPINDLE_BACKOFF_MULTIPLIER",
                self.backoff.multiplier.to_string(),
                "must be at least 1.0",
            ));
        }
        if self.pool.threads == 0 {
            return Err(invalid("SPINDLE_POOL_THREADS", "0".into(), "must be positive"));
        }
        Ok(())
    }
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = self.string(key) else {
            return Ok(None);
        };
        raw.parse::<T>().map(Some).map_err(|e| ConfigError::Invalid {
            key: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        })
    }

    fn set<T>(&self, key: &str, slot: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(v) = self.parse(key)? {
            *slot = v;
        }
        Ok(())
    }

    fn set_millis(&self, key: &str, slot: &mut Duration) -> Result<(), ConfigError> {
        if let Some(ms) = self.parse::<u64>(key)? {
            *slot = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn set_secs(&self, key: &str, slot: &mut Duration) -> Result<(), ConfigError> {
        if let Some(secs) = self.parse::<u64>(key)? {
            *slot = Duration::from_secs(secs);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.poller.batch_size, 10);
        assert_eq!(cfg.reaper.stale_threshold, Duration::from_secs(300));
        assert_eq!(cfg.reaper.interval, Duration::from_secs(10));
        assert_eq!(cfg.heartbeat_interval.0, Duration::from_secs(5));
        assert_eq!(cfg.bridge_timeout.0, Duration::from_secs(30));
        assert!(cfg.pool.threads >= 2);
        assert_eq!(cfg.worker_id, None);
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("SPINDLE_BATCH_SIZE", "25"),
            ("SPINDLE_STALE_THRESHOLD_SECS", "2"),
            ("SPINDLE_HEARTBEAT_INTERVAL_MS", "500"),
            ("SPINDLE_BACKOFF_MULTIPLIER", "2.5"),
            ("SPINDLE_WORKER_ID", "worker-a"),
        ]))
        .unwrap();
        assert_eq!(cfg.poller.batch_size, 25);
        assert_eq!(cfg.reaper.stale_threshold, Duration::from_secs(2));
        assert_eq!(cfg.heartbeat_interval.0, Duration::from_millis(500));
        assert_eq!(cfg.backoff.multiplier, 2.5);
        assert_eq!(cfg.worker_id.as_deref(), Some("worker-a"));
    }

    #[test]
    fn garbage_is_reported_with_key() {
        let err = EngineConfig::from_lookup(lookup(&[("SPINDLE_REAP_INTERVAL_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == "SPINDLE_REAP_INTERVAL_MS"));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(EngineConfig::from_lookup(lookup(&[("SPINDLE_BATCH_SIZE", "0")])).is_err());
    }

    #[rstest]
    #[case::heartbeat_zero(&[("SPINDLE_HEARTBEAT_INTERVAL_MS", "0")], "SPINDLE_HEARTBEAT_INTERVAL_MS")]
    #[case::reap_interval_zero(&[("SPINDLE_REAP_INTERVAL_MS", "0")], "SPINDLE_REAP_INTERVAL_MS")]
    #[case::bridge_timeout_zero(&[("SPINDLE_BRIDGE_TIMEOUT_MS", "0")], "SPINDLE_BRIDGE_TIMEOUT_MS")]
    #[case::poll_min_zero(&[("SPINDLE_POLL_MIN_MS", "0")], "SPINDLE_POLL_MIN_MS")]
    #[case::heartbeat_equals_stale(
        &[("SPINDLE_HEARTBEAT_INTERVAL_MS", "2000"), ("SPINDLE_STALE_THRESHOLD_SECS", "2")],
        "SPINDLE_HEARTBEAT_INTERVAL_MS"
    )]
    #[case::heartbeat_beyond_stale(
        &[("SPINDLE_HEARTBEAT_INTERVAL_MS", "5000"), ("SPINDLE_STALE_THRESHOLD_SECS", "1")],
        "SPINDLE_HEARTBEAT_INTERVAL_MS"
    )]
    fn timer_settings_that_cannot_run_are_rejected(
        #[case] vars: &[(&str, &str)],
        #[case] expected_key: &str,
    ) {
        let err = EngineConfig::from_lookup(lookup(vars)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == expected_key), "{err}");
    }

    #[test]
    fn hand_built_config_is_validated_too() {
        let cfg = EngineConfig {
            heartbeat_interval: HeartbeatInterval(Duration::ZERO),
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
        assert!(EngineConfig::default().validate().is_ok());
    }
}
