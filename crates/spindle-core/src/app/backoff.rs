//! Backoff policy: decides step retry delays.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with ±10% jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay for the first retry.
    pub initial: Duration,

    pub multiplier: f64,

    /// Cap applied before jitter.
    pub max: Duration,

    /// Relative jitter (0.1 = ±10%).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1000),
            multiplier: 4.0,
            max: Duration::from_millis(60_000),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the retry of a step that just failed on `attempt`
    /// (1-indexed).
    ///
    /// `min(initial * multiplier^(attempt - 1), max)`, shifted by a uniform
    /// random jitter and floored to whole milliseconds. With the defaults:
    /// - attempt 1: ~1s
    /// - attempt 2: ~4s
    /// - attempt 3: ~16s
    /// - attempt 5+: ~60s
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_ms(attempt);
        let spread = base * self.jitter;
        let offset = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((base + offset).max(0.0).floor() as u64)
    }

    /// The un-jittered delay in milliseconds.
    fn base_ms(&self, attempt: u32) -> f64 {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        raw.min(self.max.as_millis() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 900, 1100)]
    #[case(2, 3600, 4400)]
    #[case(3, 14_400, 17_600)]
    #[case(4, 54_000, 66_000)]
    #[case(10, 54_000, 66_000)]
    fn default_delays_stay_in_jitter_band(#[case] attempt: u32, #[case] lo: u64, #[case] hi: u64) {
        let policy = BackoffPolicy::default();
        for _ in 0..200 {
            let ms = policy.delay(attempt).as_millis() as u64;
            assert!((lo..=hi).contains(&ms), "attempt {attempt}: {ms}ms");
        }
    }

    #[test]
    fn never_exceeds_cap_plus_jitter() {
        let policy = BackoffPolicy::default();
        for attempt in 1..=30 {
            assert!(policy.delay(attempt) <= Duration::from_millis(66_000));
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.delay(1), Duration::from_millis(1000));
        assert_eq!(policy.delay(2), Duration::from_millis(4000));
        assert_eq!(policy.delay(0), Duration::from_millis(1000));
    }
}
