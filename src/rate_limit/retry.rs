//! Exponential backoff with jitter.

use crate::error::AdapterError;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Platform `Retry-After` hints above this are surfaced instead of waited out
    pub max_retry_after: Duration,
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1`: half the exponential step fixed,
    /// half random, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let step = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        let half = step / 2;
        let jitter_ms = half.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        half + jitter
    }

    /// Delay before retrying after `attempt` failed with `err`, or None when
    /// the failure must be surfaced now.
    pub fn delay_for(&self, attempt: u32, err: &AdapterError) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }

        match err {
            AdapterError::TransientNetwork(_) => Some(self.backoff(attempt)),
            AdapterError::RateLimited { retry_after } if *retry_after <= self.max_retry_after => {
                Some((*retry_after).max(self.backoff(attempt)))
            }
            _ => None,
        }
    }
}
