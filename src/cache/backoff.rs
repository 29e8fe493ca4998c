//! Reconnect pacing for the cluster event relay

use std::time::Duration;

use rand::Rng;

use crate::config::RedisConfig;

/// Doubling reconnect delay with "equal jitter": half the delay is fixed,
/// the other half random, so relays on many nodes do not reconnect in step.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    /// 0 retries forever
    max_attempts: u32,
    failures: u32,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max: max.max(initial),
            max_attempts,
            failures: 0,
        }
    }

    pub fn from_config(config: &RedisConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_initial_delay_ms),
            Duration::from_millis(config.reconnect_max_delay_ms),
            config.reconnect_max_attempts,
        )
    }

    /// Record a failed connection; `None` once every attempt is used up
    pub fn on_failure(&mut self) -> Option<Duration> {
        if self.max_attempts > 0 && self.failures >= self.max_attempts {
            return None;
        }
        self.failures += 1;

        let ceiling = self.ceiling();
        let half = ceiling / 2;
        let spread = (ceiling - half).as_millis() as u64;
        let jitter = if spread == 0 {
            0
        } else {
            rand::rng().random_range(0..=spread)
        };
        Some(half + Duration::from_millis(jitter))
    }

    /// A subscription came up; the next failure starts from the initial delay again
    pub fn on_connected(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Upper bound of the delay for the current failure count
    fn ceiling(&self) -> Duration {
        let doublings = self.failures.saturating_sub(1).min(20);
        self.initial.saturating_mul(1 << doublings).min(self.max)
    }
}
