//! Per-provider concurrency caps.

use crate::error::{Error, Result};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// At most K in-flight calls per provider. Semaphores are created lazily.
pub struct Bulkhead {
    default_limit: usize,
    limits: HashMap<String, usize>,
    semaphores: DashMap<String, Arc<Semaphore>>,
}

impl Bulkhead {
    pub fn new(default_limit: usize, limits: HashMap<String, usize>) -> Self {
        Self {
            default_limit: default_limit.max(1),
            limits,
            semaphores: DashMap::new(),
        }
    }

    pub fn limit_for(&self, provider: &str) -> usize {
        self.limits
            .get(provider)
            .copied()
            .unwrap_or(self.default_limit)
            .max(1)
    }

    fn semaphore(&self, provider: &str) -> Arc<Semaphore> {
        self.semaphores
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.limit_for(provider))))
            .clone()
    }

    /// Wait up to `max_wait` for a slot. The slot is released when the permit drops.
    ///
    /// # Errors
    /// `ConcurrencyExceeded` if no slot frees up in time.
    pub async fn acquire(&self, provider: &str, max_wait: Duration) -> Result<OwnedSemaphorePermit> {
        let semaphore = self.semaphore(provider);

        if let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() {
            return Ok(permit);
        }
        if max_wait.is_zero() {
            return Err(Error::ConcurrencyExceeded(provider.to_string()));
        }

        match tokio::time::timeout(max_wait, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            _ => {
                tracing::warn!(
                    provider = %provider,
                    limit = self.limit_for(provider),
                    "Concurrency limit reached"
                );
                Err(Error::ConcurrencyExceeded(provider.to_string()))
            }
        }
    }

    pub fn available(&self, provider: &str) -> usize {
        self.semaphore(provider).available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cap_per_provider() {
        let bulkhead = Bulkhead::new(2, HashMap::from([("twitter".to_string(), 1)]));

        let permit = bulkhead.acquire("twitter", Duration::ZERO).await.unwrap();
        assert!(matches!(
            bulkhead.acquire("twitter", Duration::ZERO).await,
            Err(Error::ConcurrencyExceeded(_))
        ));

        // Default cap applies to providers without an override
        let _a = bulkhead.acquire("facebook", Duration::ZERO).await.unwrap();
        let _b = bulkhead.acquire("facebook", Duration::ZERO).await.unwrap();
        assert_eq!(bulkhead.available("facebook"), 0);

        drop(permit);
        assert!(bulkhead.acquire("twitter", Duration::ZERO).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_wait_times_out() {
        let bulkhead = Bulkhead::new(1, HashMap::new());
        let _held = bulkhead.acquire("youtube", Duration::ZERO).await.unwrap();

        let result = bulkhead
            .acquire("youtube", Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(Error::ConcurrencyExceeded(p)) if p == "youtube"));
    }

    #[tokio::test]
    async fn test_waiter_gets_released_slot() {
        let bulkhead = Arc::new(Bulkhead::new(1, HashMap::new()));
        let held = bulkhead.acquire("pinterest", Duration::ZERO).await.unwrap();

        let waiter = {
            let bulkhead = Arc::clone(&bulkhead);
            tokio::spawn(async move {
                bulkhead
                    .acquire("pinterest", Duration::from_secs(5))
                    .await
                    .is_ok()
            })
        };

        tokio::task::yield_now().await;
        drop(held);
        assert!(waiter.await.unwrap());
    }
}
