//! Exponential backoff between retry attempts

use crate::jitter::JitterSource;
use std::time::Duration;

/// Configuration for the shape of retry backoff
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for BackoffConfig {
    /// Default backoff configuration
    ///
    /// Uses a base delay of 500 ms, doubling per attempt, capped at
    /// 30 seconds.
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffConfig {
    /// Constructs a new backoff configuration
    ///
    /// The delay before attempt `n` is `base_delay * 2^(n-1)`, capped at
    /// `max_delay`.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// The un-jittered delay before the given attempt (1-based)
    ///
    /// Attempt 0 is not a retry and gets no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let millis = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// The jittered delay before the given attempt
    pub fn jittered_delay<J: JitterSource + ?Sized>(
        &self,
        attempt: u32,
        jitter: &mut J,
    ) -> Duration {
        jitter.jitter(self.delay_for_attempt(attempt))
    }
}
