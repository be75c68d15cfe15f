//! Bounded exponential backoff for external submissions

use rand::Rng;
use std::time::Duration;

/// Retry settings shared by the escrow and vault adapters. Retries are
/// bounded; once attempts are exhausted the typed error surfaces to the
/// caller.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Exponential delay for the given zero-based attempt, with up to 25%
    /// added jitter so concurrent retries don't align.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        let jitter_ceiling = (exp.as_millis() as u64 / 4).max(1);
        let jitter = rand::thread_rng().gen_range(0..jitter_ceiling);
        exp + Duration::from_millis(jitter)
    }
}
