//! Exponential backoff with jitter for failed deliveries.
//!
//! `delay = base * multiplier^(attempt - 1) * U[1 - jitter, 1 + jitter]`,
//! rounded to whole seconds. With the defaults this gives roughly 8-12s,
//! 24-36s, 72-108s and 216-324s for attempts 1 through 4.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};

// Far beyond any sane schedule; keeps timestamp arithmetic in range.
const MAX_DELAY_SECS: i64 = 100 * 365 * 24 * 60 * 60;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry, before jitter
    pub base_delay_secs: u64,
    /// Growth factor per additional failure
    pub multiplier: f64,
    /// Relative jitter (0.0-1.0); 0.2 means +/-20%
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 10,
            multiplier: 3.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    /// Un-jittered delay for a 1-based attempt number.
    pub fn base_delay_for(&self, attempt: u32) -> f64 {
        let exp = attempt.max(1) - 1;
        self.base_delay_secs as f64 * self.multiplier.powi(exp.min(i32::MAX as u32) as i32)
    }

    fn jitter_bounds(&self) -> (f64, f64) {
        (1.0 - self.jitter_factor, 1.0 + self.jitter_factor)
    }
}

/// One row of [`RetryStrategy::describe_schedule`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledRetry {
    pub attempt: u32,
    pub base_delay_seconds: u64,
    pub min_seconds: u64,
    pub max_seconds: u64,
}

/// Computes retry delays and timestamps.
///
/// Both the random source and the clock are injected; use
/// [`RetryStrategy::seeded`] for reproducible delays.
#[derive(Debug)]
pub struct RetryStrategy {
    config: RetryConfig,
    rng: Mutex<StdRng>,
    clock: Arc<dyn Clock>,
}

impl RetryStrategy {
    /// Entropy-seeded strategy on the system clock.
    pub fn new(config: RetryConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Entropy-seeded strategy on the given clock.
    pub fn with_clock(config: RetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_parts(config, StdRng::from_entropy(), clock)
    }

    /// Deterministic strategy for tests.
    pub fn seeded(config: RetryConfig, seed: u64, clock: Arc<dyn Clock>) -> Self {
        Self::with_parts(config, StdRng::seed_from_u64(seed), clock)
    }

    fn with_parts(config: RetryConfig, rng: StdRng, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            rng: Mutex::new(rng),
            clock,
        }
    }

    /// Jittered delay in whole seconds for the failure numbered `attempt` (1-based).
    pub fn delay_seconds(&self, attempt: u32) -> u64 {
        let base = self.config.base_delay_for(attempt);
        let (lo, hi) = self.config.jitter_bounds();
        let factor = if hi > lo {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            rng.gen_range(lo..=hi)
        } else {
            1.0
        };
        (base * factor).round().max(0.0) as u64
    }

    /// When the event that just failed for the `attempt`-th time may be claimed again.
    pub fn next_retry_at(&self, attempt: u32) -> DateTime<Utc> {
        let delay = self.delay_seconds(attempt);
        let secs = i64::try_from(delay).unwrap_or(i64::MAX).min(MAX_DELAY_SECS);
        self.clock.now() + chrono::Duration::seconds(secs)
    }

    /// Expected delay windows for every retry an event with `max_attempts` can get.
    pub fn describe_schedule(&self, max_attempts: u32) -> Vec<ScheduledRetry> {
        let (lo, hi) = self.config.jitter_bounds();
        (1..max_attempts)
            .map(|attempt| {
                let base = self.config.base_delay_for(attempt);
                ScheduledRetry {
                    attempt,
                    base_delay_seconds: base as u64,
                    min_seconds: (base * lo).round().max(0.0) as u64,
                    max_seconds: (base * hi).round().max(0.0) as u64,
                }
            })
            .collect()
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use proptest::prelude::*;

    fn seeded(config: RetryConfig, seed: u64) -> RetryStrategy {
        RetryStrategy::seeded(config, seed, Arc::new(TestClock::default()))
    }

    #[test]
    fn default_windows_match_documented_ranges() {
        let strategy = seeded(RetryConfig::default(), 7);
        let expected = [(1, 8, 12), (2, 24, 36), (3, 72, 108), (4, 216, 324)];

        for _ in 0..200 {
            for (attempt, min, max) in expected {
                let delay = strategy.delay_seconds(attempt);
                assert!(
                    (min..=max).contains(&delay),
                    "attempt {attempt}: {delay} not in {min}..={max}"
                );
            }
        }
    }

    #[test]
    fn first_retry_lands_eight_to_twelve_seconds_out() {
        let clock = Arc::new(TestClock::default());
        let strategy = RetryStrategy::seeded(RetryConfig::default(), 42, clock.clone());
        let now = clock.now();

        for _ in 0..100 {
            let at = strategy.next_retry_at(1);
            assert!(at >= now + chrono::Duration::seconds(8));
            assert!(at <= now + chrono::Duration::seconds(12));
        }
    }

    #[test]
    fn same_seed_same_delays() {
        let a = seeded(RetryConfig::default(), 99);
        let b = seeded(RetryConfig::default(), 99);
        let xs: Vec<_> = (1..=6).map(|n| a.delay_seconds(n)).collect();
        let ys: Vec<_> = (1..=6).map(|n| b.delay_seconds(n)).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn without_jitter_delays_are_exact_and_non_decreasing() {
        let config = RetryConfig {
            jitter_factor: 0.0,
            ..RetryConfig::default()
        };
        let strategy = seeded(config, 0);
        let delays: Vec<_> = (1..=5).map(|n| strategy.delay_seconds(n)).collect();
        assert_eq!(delays, vec![10, 30, 90, 270, 810]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn mean_delay_grows_with_attempts() {
        let strategy = seeded(RetryConfig::default(), 1234);
        let mean = |attempt| {
            let total: u64 = (0..500).map(|_| strategy.delay_seconds(attempt)).sum();
            total as f64 / 500.0
        };
        let means: Vec<f64> = (1..=5).map(mean).collect();
        assert!(means.windows(2).all(|w| w[0] <= w[1]), "{means:?}");
    }

    #[test]
    fn attempt_zero_is_treated_as_first() {
        let config = RetryConfig {
            jitter_factor: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(seeded(config, 0).delay_seconds(0), 10);
    }

    #[test]
    fn schedule_covers_every_retry() {
        let schedule = seeded(RetryConfig::default(), 0).describe_schedule(5);
        assert_eq!(schedule.len(), 4);
        assert_eq!(
            schedule[0],
            ScheduledRetry {
                attempt: 1,
                base_delay_seconds: 10,
                min_seconds: 8,
                max_seconds: 12,
            }
        );
        assert_eq!(schedule[3].base_delay_seconds, 270);
        assert_eq!((schedule[3].min_seconds, schedule[3].max_seconds), (216, 324));
        assert!(seeded(RetryConfig::default(), 0).describe_schedule(1).is_empty());
    }

    proptest! {
        #[test]
        fn delay_stays_within_jitter_window(
            seed in any::<u64>(),
            attempt in 1u32..8,
            base in 1u64..120,
            jitter in 0.0f64..0.9,
        ) {
            let config = RetryConfig { base_delay_secs: base, multiplier: 2.5, jitter_factor: jitter };
            let strategy = seeded(config, seed);
            let window = &strategy.describe_schedule(attempt + 1)[attempt as usize - 1];
            let delay = strategy.delay_seconds(attempt);
            prop_assert!(delay >= window.min_seconds && delay <= window.max_seconds,
                "{} outside {}..={}", delay, window.min_seconds, window.max_seconds);
        }
    }
}
