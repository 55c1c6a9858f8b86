//! Fan-out publishing of one post to many connected accounts.
//!
//! Every target runs independently: fresh token, resilience-guarded post,
//! recorded outcome. The aggregate always has one result per target.

mod analytics;
mod ledger;

pub use analytics::MAX_ANALYTICS_DAYS;
pub use ledger::{PublicationLedger, PublicationRecord};

use crate::error::{AdapterError, Error, ErrorKind, Result};
use crate::providers::{AccountRef, MediaRef, PostDetails, ProviderAdapter, ProviderRegistry};
use crate::rate_limit::{OperationClass, ResiliencePolicy};
use crate::vault::{Integration, IntegrationStatus, TokenVault};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Width of the idempotency time bucket
pub const IDEMPOTENCY_BUCKET_SECONDS: i64 = 600;

#[derive(Debug, Clone, Deserialize)]
pub struct PublishRequest {
    pub text: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub media: Vec<MediaRef>,
    pub targets: Vec<PublishTarget>,
}

/// One target account plus its platform-specific overrides
#[derive(Debug, Clone, Deserialize)]
pub struct PublishTarget {
    pub integration_id: String,
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublishOutcome {
    Published {
        platform_post_id: String,
        platform_url: String,
    },
    Failed {
        error_kind: ErrorKind,
        message: String,
        retryable: bool,
    },
    RateLimited {
        retry_after_ms: u64,
    },
}

impl PublishOutcome {
    fn failed(error_kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        PublishOutcome::Failed {
            error_kind,
            message: message.into(),
            retryable,
        }
    }

    fn cancelled() -> Self {
        Self::failed(ErrorKind::Cancelled, "publish request was cancelled", true)
    }

    pub fn is_published(&self) -> bool {
        matches!(self, PublishOutcome::Published { .. })
    }
}

impl From<&Error> for PublishOutcome {
    fn from(err: &Error) -> Self {
        if let Some(retry_after) = match err {
            Error::RateLimitExceeded { retry_after }
            | Error::Adapter(AdapterError::RateLimited { retry_after }) => Some(*retry_after),
            _ => None,
        } {
            return PublishOutcome::RateLimited {
                retry_after_ms: retry_after.as_millis() as u64,
            };
        }
        PublishOutcome::failed(err.kind(), err.to_string(), err.is_retryable())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetResult {
    pub integration_id: String,
    /// None when the integration could not be resolved
    pub provider: Option<String>,
    pub outcome: PublishOutcome,
}

/// Client-side idempotency key: content hash, target and time bucket.
pub fn idempotency_key(request: &PublishRequest, target: &PublishTarget, now: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.text.as_bytes());
    for part in [&request.title, &request.link] {
        hasher.update([0u8]);
        hasher.update(part.as_deref().unwrap_or_default().as_bytes());
    }
    for media in &request.media {
        hasher.update([0u8]);
        hasher.update(media.url.as_bytes());
    }
    hasher.update([0u8]);
    hasher.update(serde_json::Value::Object(target.settings.clone()).to_string().as_bytes());

    let digest: String = hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    let bucket = now.timestamp().div_euclid(IDEMPOTENCY_BUCKET_SECONDS);
    format!("{}:{}:{}", &digest[..32], target.integration_id, bucket)
}

struct InFlight {
    token: CancellationToken,
    publishers: usize,
}

/// Removes the in-flight entry when the last publish of a post finishes,
/// including when the publishing future is dropped.
struct InFlightGuard<'a> {
    in_flight: &'a DashMap<(String, String), InFlight>,
    key: (String, String),
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .remove_if_mut(&self.key, |_, entry| {
                entry.publishers -= 1;
                entry.publishers == 0
            });
    }
}

pub struct PublishingCoordinator {
    registry: Arc<ProviderRegistry>,
    vault: Arc<TokenVault>,
    policy: Arc<ResiliencePolicy>,
    ledger: Arc<PublicationLedger>,
    in_flight: DashMap<(String, String), InFlight>,
}

impl PublishingCoordinator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        vault: Arc<TokenVault>,
        policy: Arc<ResiliencePolicy>,
        ledger: Arc<PublicationLedger>,
    ) -> Self {
        Self {
            registry,
            vault,
            policy,
            ledger,
            in_flight: DashMap::new(),
        }
    }

    /// Publish `request` as post `post_id` on behalf of `user_id`.
    ///
    /// Returns exactly one result per target, in request order. Targets run
    /// concurrently and never abort one another.
    pub async fn publish(
        &self,
        user_id: &str,
        post_id: &str,
        request: &PublishRequest,
    ) -> Vec<TargetResult> {
        let key = (user_id.to_string(), post_id.to_string());
        let cancel = {
            let mut entry = self.in_flight.entry(key.clone()).or_insert_with(|| InFlight {
                token: CancellationToken::new(),
                publishers: 0,
            });
            entry.publishers += 1;
            entry.token.clone()
        };
        let _guard = InFlightGuard {
            in_flight: &self.in_flight,
            key,
        };

        info!(
            user_id = %user_id,
            post_id = %post_id,
            targets = request.targets.len(),
            "Publishing post"
        );

        let now = Utc::now();
        let results = join_all(request.targets.iter().map(|target| {
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return self.cancelled(target);
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => self.cancelled(target),
                    result = self.publish_target(user_id, post_id, request, target, now, &cancel) => result,
                }
            }
        }))
        .await;

        let published = results.iter().filter(|r| r.outcome.is_published()).count();
        info!(
            user_id = %user_id,
            post_id = %post_id,
            published = published,
            failed = results.len() - published,
            "Publish finished"
        );
        results
    }

    /// Cancel the in-flight publish of a post. Returns false if none is running.
    pub fn cancel(&self, user_id: &str, post_id: &str) -> bool {
        match self
            .in_flight
            .get(&(user_id.to_string(), post_id.to_string()))
        {
            Some(entry) => {
                entry.token.cancel();
                info!(user_id = %user_id, post_id = %post_id, "Publish cancelled");
                true
            }
            None => false,
        }
    }

    /// Outcomes recorded for a post.
    pub fn publications(&self, user_id: &str, post_id: &str) -> Result<Vec<PublicationRecord>> {
        Ok(self.ledger.list_for_post(user_id, post_id)?)
    }

    fn cancelled(&self, target: &PublishTarget) -> TargetResult {
        debug!(integration_id = %target.integration_id, "Target cancelled");
        TargetResult {
            integration_id: target.integration_id.clone(),
            provider: None,
            outcome: PublishOutcome::cancelled(),
        }
    }

    /// Resolve an integration owned by `user_id` and its adapter.
    fn resolve(
        &self,
        user_id: &str,
        integration_id: &str,
    ) -> Result<(Integration, Arc<dyn ProviderAdapter>)> {
        let integration = self.vault.integration(integration_id)?;
        if integration.user_id != user_id {
            return Err(Error::NotFound(format!("integration {}", integration_id)));
        }
        let adapter = self.registry.get(&integration.provider)?;
        Ok((integration, adapter))
    }

    async fn publish_target(
        &self,
        user_id: &str,
        post_id: &str,
        request: &PublishRequest,
        target: &PublishTarget,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> TargetResult {
        let (integration, adapter) = match self.resolve(user_id, &target.integration_id) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(
                    integration_id = %target.integration_id,
                    error = %e,
                    "Publish target could not be resolved"
                );
                return TargetResult {
                    integration_id: target.integration_id.clone(),
                    provider: None,
                    outcome: PublishOutcome::from(&e),
                };
            }
        };

        let key = idempotency_key(request, target, now);
        let outcome = self
            .post_once(&integration, adapter.as_ref(), request, target, &key)
            .await;

        match &outcome {
            PublishOutcome::Published { platform_post_id, .. } => info!(
                integration_id = %integration.id,
                provider = %integration.provider,
                platform_post_id = %platform_post_id,
                "Target published"
            ),
            PublishOutcome::Failed { error_kind, retryable, .. } => warn!(
                integration_id = %integration.id,
                provider = %integration.provider,
                kind = ?error_kind,
                retryable = retryable,
                "Target failed"
            ),
            PublishOutcome::RateLimited { retry_after_ms } => warn!(
                integration_id = %integration.id,
                provider = %integration.provider,
                retry_after_ms = retry_after_ms,
                "Target rate limited"
            ),
        }

        // A result arriving after cancellation is dropped, not recorded
        if !cancel.is_cancelled() {
            let record = PublicationRecord {
                post_id: post_id.to_string(),
                user_id: user_id.to_string(),
                integration_id: integration.id.clone(),
                provider: integration.provider.clone(),
                idempotency_key: key,
                outcome: outcome.clone(),
                recorded_at: Utc::now(),
            };
            if let Err(e) = self.ledger.record(&record) {
                warn!(
                    integration_id = %integration.id,
                    error = %e,
                    "Failed to record publication outcome"
                );
            }
        }

        TargetResult {
            integration_id: integration.id,
            provider: Some(integration.provider),
            outcome,
        }
    }

    async fn post_once(
        &self,
        integration: &Integration,
        adapter: &dyn ProviderAdapter,
        request: &PublishRequest,
        target: &PublishTarget,
        key: &str,
    ) -> PublishOutcome {
        match self.ledger.find(key) {
            Ok(Some(previous)) if previous.outcome.is_published() => {
                info!(
                    integration_id = %integration.id,
                    provider = %integration.provider,
                    "Identical content already published in this bucket, skipping"
                );
                return previous.outcome;
            }
            Ok(_) => {}
            Err(e) => warn!(integration_id = %integration.id, error = %e, "Ledger lookup failed"),
        }

        let access_token = match self.vault.ensure_fresh(&integration.id).await {
            Ok(token) => token,
            Err(e) => return PublishOutcome::from(&e),
        };

        let account = AccountRef {
            integration_id: integration.id.clone(),
            internal_id: integration.internal_id.clone(),
            metadata: integration.platform_metadata.clone(),
        };
        let details = PostDetails {
            text: request.text.clone(),
            title: request.title.clone(),
            link: request.link.clone(),
            media: request.media.clone(),
            settings: target.settings.clone(),
            idempotency_key: key.to_string(),
        };

        let mut attempts = 0u32;
        let result = self
            .policy
            .execute(&integration.provider, OperationClass::Post, || {
                attempts += 1;
                if attempts > 1 && !adapter.deduplicates_natively() {
                    warn!(
                        integration_id = %integration.id,
                        provider = %integration.provider,
                        attempt = attempts,
                        "Retrying post on a platform without deduplication; a duplicate post is possible"
                    );
                }
                adapter.post(&account, &access_token, &details)
            })
            .await;

        match result {
            Ok(post) => PublishOutcome::Published {
                platform_post_id: post.platform_post_id,
                platform_url: post.platform_url,
            },
            Err(Error::Adapter(AdapterError::TokenExpired(reason))) => {
                self.mark(integration, IntegrationStatus::RefreshNeeded).await;
                PublishOutcome::failed(ErrorKind::TokenExpired, reason, true)
            }
            Err(Error::Adapter(AdapterError::TokenRevoked(reason))) => {
                self.mark(integration, IntegrationStatus::Revoked).await;
                PublishOutcome::from(&Error::ReauthRequired(reason))
            }
            Err(e) => PublishOutcome::from(&e),
        }
    }

    async fn mark(&self, integration: &Integration, status: IntegrationStatus) {
        info!(
            integration_id = %integration.id,
            provider = %integration.provider,
            from = integration.status.as_str(),
            to = status.as_str(),
            "Integration status changed"
        );
        if let Err(e) = self.vault.set_status(&integration.id, status).await {
            warn!(integration_id = %integration.id, error = %e, "Failed to update integration status");
        }
    }
}
