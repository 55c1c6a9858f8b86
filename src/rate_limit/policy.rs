//! Uniform guard around every outbound adapter call.
//!
//! One attempt = circuit check, rate-limit slot, bulkhead slot, then the call
//! under a timeout. Failed attempts are retried per [`RetryPolicy`]; the
//! load-shedding checks are re-run for every attempt.

use super::{
    BreakerConfig, Bulkhead, CircuitBreaker, OperationClass, RateLimiter, RetryPolicy,
};
use crate::config::SocialSyncConfig;
use crate::error::{AdapterError, Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;

pub struct ResiliencePolicy {
    limiter: RateLimiter,
    bulkhead: Bulkhead,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    call_timeout: Duration,
    acquire_max_wait: Duration,
}

impl ResiliencePolicy {
    pub fn new(
        limiter: RateLimiter,
        bulkhead: Bulkhead,
        breaker: CircuitBreaker,
        retry: RetryPolicy,
        call_timeout: Duration,
        acquire_max_wait: Duration,
    ) -> Self {
        Self {
            limiter,
            bulkhead,
            breaker,
            retry,
            call_timeout,
            acquire_max_wait,
        }
    }

    /// Build from the `[resilience]` section and per-provider limits.
    pub fn from_config(config: &SocialSyncConfig) -> Self {
        let resilience = &config.resilience;

        let limiter = RateLimiter::new();
        for (provider, operation, limit) in config.window_limits() {
            limiter.configure(&provider, operation, limit);
        }

        let concurrency = config
            .providers
            .iter()
            .filter_map(|(name, p)| p.max_concurrency.map(|k| (name.clone(), k)))
            .collect();

        Self::new(
            limiter,
            Bulkhead::new(resilience.default_max_concurrency, concurrency),
            CircuitBreaker::new(BreakerConfig {
                failure_threshold: resilience.breaker_failure_threshold,
                window: Duration::from_secs(resilience.breaker_window_seconds),
                cooldown: Duration::from_secs(resilience.breaker_cooldown_seconds),
            }),
            RetryPolicy {
                max_attempts: resilience.max_attempts.max(1),
                base_delay: Duration::from_millis(resilience.base_delay_ms),
                max_delay: Duration::from_millis(resilience.max_delay_ms),
                max_retry_after: Duration::from_secs(resilience.max_retry_after_seconds),
            },
            Duration::from_secs(resilience.call_timeout_seconds),
            Duration::from_millis(resilience.acquire_max_wait_ms),
        )
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Run `call` under the full policy.
    ///
    /// `call` is invoked once per attempt. Terminal adapter failures come back
    /// after the first attempt; transient and throttling failures are retried
    /// until `max_attempts`. Load-shedding failures (`CircuitOpen`,
    /// `RateLimitExceeded`, `ConcurrencyExceeded`) are returned as they occur.
    pub async fn execute<T, F, Fut>(
        &self,
        provider: &str,
        operation: OperationClass,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, AdapterError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match self.attempt(provider, operation, &mut call).await? {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match self.retry.delay_for(attempt, &err) {
                Some(delay) => {
                    tracing::warn!(
                        provider = %provider,
                        operation = operation.as_str(),
                        attempt = attempt,
                        max_attempts = self.retry.max_attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "Provider call failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    if err.is_retryable() {
                        tracing::warn!(
                            provider = %provider,
                            operation = operation.as_str(),
                            attempts = attempt,
                            error = %err,
                            "Provider call failed, retries exhausted"
                        );
                    } else {
                        tracing::debug!(
                            provider = %provider,
                            operation = operation.as_str(),
                            error = %err,
                            "Provider call failed with terminal error"
                        );
                    }
                    return Err(Error::Adapter(err));
                }
            }
        }
    }

    async fn attempt<T, F, Fut>(
        &self,
        provider: &str,
        operation: OperationClass,
        call: &mut F,
    ) -> Result<std::result::Result<T, AdapterError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, AdapterError>>,
    {
        self.breaker.try_begin(provider)?;

        let permit = match self.acquire_slots(provider, operation).await {
            Ok(permit) => permit,
            Err(e) => {
                self.breaker.abandon(provider);
                return Err(e);
            }
        };

        let outcome = match tokio::time::timeout(self.call_timeout, call()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AdapterError::TransientNetwork(format!(
                "{} call timed out after {}s",
                operation.as_str(),
                self.call_timeout.as_secs()
            ))),
        };
        drop(permit);

        self.breaker.record(provider, &outcome);
        Ok(outcome)
    }

    async fn acquire_slots(
        &self,
        provider: &str,
        operation: OperationClass,
    ) -> Result<OwnedSemaphorePermit> {
        self.limiter
            .acquire_blocking(provider, operation, self.acquire_max_wait)
            .await?;
        self.bulkhead.acquire(provider, self.acquire_max_wait).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::WindowLimit;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32) -> ResiliencePolicy {
        ResiliencePolicy::new(
            RateLimiter::new(),
            Bulkhead::new(4, HashMap::new()),
            CircuitBreaker::new(BreakerConfig {
                failure_threshold: 3,
                window: Duration::from_secs(60),
                cooldown: Duration::from_secs(30),
            }),
            RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                max_retry_after: Duration::from_secs(5),
            },
            Duration::from_secs(1),
            Duration::ZERO,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retried_until_success() {
        let policy = policy(3);
        let calls = Arc::new(AtomicU32::new(0));

        let result = policy
            .execute("twitter", OperationClass::Post, || {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(AdapterError::TransientNetwork("reset".into()))
                    } else {
                        Ok("tweet-1")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "tweet-1");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_single_attempt() {
        let policy = policy(5);
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = policy
            .execute("facebook", OperationClass::Post, || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AdapterError::PlatformRejected("policy".into()))
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(Error::Adapter(AdapterError::PlatformRejected(_)))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_transient() {
        let policy = policy(1);

        let result: Result<()> = policy
            .execute("youtube", OperationClass::Post, || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(Error::Adapter(AdapterError::TransientNetwork(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_rejects_before_calling() {
        let policy = policy(3);
        policy.limiter().configure(
            "pinterest",
            OperationClass::Post,
            WindowLimit {
                capacity: 1,
                window: Duration::from_secs(60),
            },
        );
        let calls = Arc::new(AtomicU32::new(0));
        let call = || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, AdapterError>(())
            }
        };

        assert!(policy.execute("pinterest", OperationClass::Post, call).await.is_ok());
        let second = policy.execute("pinterest", OperationClass::Post, call).await;

        assert!(matches!(second, Err(Error::RateLimitExceeded { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_fails_fast() {
        let policy = policy(1);
        for _ in 0..3 {
            let _ = policy
                .execute("instagram", OperationClass::Post, || async {
                    Err::<(), _>(AdapterError::TransientNetwork("502".into()))
                })
                .await;
        }

        let calls = Arc::new(AtomicU32::new(0));
        let result = policy
            .execute("instagram", OperationClass::Post, || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, AdapterError>(())
                }
            })
            .await;

        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
