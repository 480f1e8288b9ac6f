// ABOUTME: Bounded retry policy with linear backoff for coordinated saves.
// ABOUTME: Exhausting the policy hands the dataset to the emergency backup path.

use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
}

pub trait BackoffPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration;
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(1000),
        }
    }
}

impl BackoffPolicy for RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(attempt)
    }
}
