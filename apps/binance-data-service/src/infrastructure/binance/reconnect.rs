//! Reconnection Backoff
//!
//! Exponential backoff with jitter for the combined-stream connection.

use std::time::Duration;

use rand::Rng;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Attempts before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 0,
        }
    }
}

/// Stateful backoff sequence. Call [`reset`](Self::reset) after a
/// successful connect.
///
/// # Example
///
/// ```rust
/// use binance_data_service::infrastructure::binance::reconnect::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig {
///     jitter_factor: 0.0,
///     ..ReconnectConfig::default()
/// });
///
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(500)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(1)));
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Start a fresh sequence.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let current_delay = config.initial_delay;
        Self {
            config,
            current_delay,
            attempt_count: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        self.attempt_count += 1;
        let delay = self.jittered(self.current_delay);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let next_ms = if scaled.is_finite() && scaled > 0.0 {
            scaled as u128
        } else {
            0
        };
        let capped = next_ms.min(self.config.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        Some(delay)
    }

    /// Back to the initial delay with no attempts counted.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return delay;
        }

        #[allow(clippy::cast_precision_loss)]
        let base = delay.as_millis() as f64;
        let range = base * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-range..=range);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted = (base + jitter).max(1.0) as u64;
        Duration::from_millis(adjusted)
    }
}
