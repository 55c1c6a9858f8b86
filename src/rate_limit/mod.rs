// Outbound call budgets per (provider, operation class).
//
// Sliding-window limiter: each key keeps the instants of the calls admitted
// within the last window. Limits come from configuration; keys without a
// configured limit are unlimited. State is in-memory only (resets on restart).

mod breaker;
mod bulkhead;
mod policy;
mod retry;

pub use breaker::{BreakerConfig, CircuitBreaker};
pub use bulkhead::Bulkhead;
pub use policy::ResiliencePolicy;
pub use retry::RetryPolicy;

use crate::error::{Error, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Kind of outbound call, each with its own budget per provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    Auth,
    Post,
    Analytics,
}

impl OperationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationClass::Auth => "auth",
            OperationClass::Post => "post",
            OperationClass::Analytics => "analytics",
        }
    }
}

/// At most `capacity` calls in any `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    pub capacity: u32,
    pub window: Duration,
}

/// Admitted call instants for one key.
struct SlidingWindow {
    limit: WindowLimit,
    admitted: VecDeque<Instant>,
}

impl SlidingWindow {
    fn new(limit: WindowLimit) -> Self {
        Self {
            limit,
            admitted: VecDeque::with_capacity(limit.capacity as usize),
        }
    }

    /// Admit one call at `now`, or return how long until a slot frees up.
    fn try_admit(&mut self, now: Instant) -> std::result::Result<(), Duration> {
        while let Some(oldest) = self.admitted.front() {
            if now.duration_since(*oldest) >= self.limit.window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }

        if (self.admitted.len() as u32) < self.limit.capacity {
            self.admitted.push_back(now);
            return Ok(());
        }

        let retry_after = match self.admitted.front() {
            Some(oldest) => (*oldest + self.limit.window).saturating_duration_since(now),
            // Zero capacity: nothing will ever free up within a window
            None => self.limit.window,
        };
        Err(retry_after.max(Duration::from_millis(1)))
    }
}

type LimitKey = (String, OperationClass);

/// Per-(provider, operation) sliding-window rate limiter.
///
/// Windows are only created through [`RateLimiter::configure`]; all mutation
/// happens under the map's shard lock.
pub struct RateLimiter {
    windows: DashMap<LimitKey, SlidingWindow>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Install or replace the limit for (provider, operation). Replacing a
    /// limit discards the calls recorded under the old one.
    pub fn configure(&self, provider: &str, operation: OperationClass, limit: WindowLimit) {
        tracing::debug!(
            provider = %provider,
            operation = operation.as_str(),
            capacity = limit.capacity,
            window_secs = limit.window.as_secs(),
            "Configured rate limit"
        );
        self.windows
            .insert((provider.to_string(), operation), SlidingWindow::new(limit));
    }

    pub fn limit_for(&self, provider: &str, operation: OperationClass) -> Option<WindowLimit> {
        self.windows
            .get(&(provider.to_string(), operation))
            .map(|w| w.limit)
    }

    /// Take one slot without waiting.
    ///
    /// # Errors
    /// `RateLimitExceeded` with the time until the oldest call leaves the window.
    pub fn acquire(&self, provider: &str, operation: OperationClass) -> Result<()> {
        let key = (provider.to_string(), operation);
        let Some(mut window) = self.windows.get_mut(&key) else {
            return Ok(());
        };

        window
            .try_admit(Instant::now())
            .map_err(|retry_after| Error::RateLimitExceeded { retry_after })
    }

    /// Take one slot, sleeping until one frees up if that happens within `max_wait`.
    ///
    /// Fails immediately, without sleeping, when the wait would exceed `max_wait`.
    pub async fn acquire_blocking(
        &self,
        provider: &str,
        operation: OperationClass,
        max_wait: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + max_wait;
        loop {
            match self.acquire(provider, operation) {
                Ok(()) => return Ok(()),
                Err(Error::RateLimitExceeded { retry_after }) => {
                    let now = Instant::now();
                    if now + retry_after > deadline {
                        return Err(Error::RateLimitExceeded { retry_after });
                    }
                    tracing::debug!(
                        provider = %provider,
                        operation = operation.as_str(),
                        retry_after_ms = retry_after.as_millis() as u64,
                        "Waiting for rate limit window"
                    );
                    tokio::time::sleep(retry_after).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
