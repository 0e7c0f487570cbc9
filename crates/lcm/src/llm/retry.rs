//! Bounded exponential backoff for transient API failures.
//!
//! Retries 429/5xx and network-level errors; never retries 4xx client
//! errors. Delays grow exponentially from the base and are capped.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first (0 would mean no call at all).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed: the wait after the
    /// first failure is `delay_for_attempt(0)`).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = 2f64.powi(attempt.min(16) as i32);
        let delay = self.base_delay.as_secs_f64() * exp;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Whether an HTTP status is worth retrying.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504 | 529)
}
