//! Token vault: encrypted integration credentials and their refresh protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       TokenVault                         │
//! │  - ensure_fresh (single-flight refresh)  │
//! │  - status transitions                    │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       IntegrationStore (SQLite)          │
//! │  - AES-256-GCM sealed token columns      │
//! │  - soft delete                           │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Every write to an integration (re-authorization, status change, delete,
//! refresh) holds that integration's async mutex. Callers that queued behind
//! a refresh reuse its outcome instead of calling the platform again; most
//! platforms invalidate a refresh token on use, so a second concurrent
//! refresh would fail as revoked.

mod encryption;
mod storage;

pub use encryption::{Sealed, TokenCipher, ENCRYPTION_KEY_ENV};
pub use storage::IntegrationStore;

use crate::error::{AdapterError, Error, Result};
use crate::providers::{ClientInfo, ProviderRegistry, TokenSet};
use crate::rate_limit::RetryPolicy;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle state of an integration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntegrationStatus {
    Active,
    Expired,
    Revoked,
    Error,
    RefreshNeeded,
}

impl IntegrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationStatus::Active => "ACTIVE",
            IntegrationStatus::Expired => "EXPIRED",
            IntegrationStatus::Revoked => "REVOKED",
            IntegrationStatus::Error => "ERROR",
            IntegrationStatus::RefreshNeeded => "REFRESH_NEEDED",
        }
    }

    /// Only re-authorization gets the integration out of these.
    pub fn requires_reauth(&self) -> bool {
        matches!(self, IntegrationStatus::Expired | IntegrationStatus::Revoked)
    }
}

impl FromStr for IntegrationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(IntegrationStatus::Active),
            "EXPIRED" => Ok(IntegrationStatus::Expired),
            "REVOKED" => Ok(IntegrationStatus::Revoked),
            "ERROR" => Ok(IntegrationStatus::Error),
            "REFRESH_NEEDED" => Ok(IntegrationStatus::RefreshNeeded),
            other => Err(anyhow::anyhow!("Unknown integration status '{}'", other)),
        }
    }
}

/// A user's connection to one platform account. Carries no secrets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Integration {
    pub id: String,
    pub user_id: String,
    pub provider: String,
    pub internal_id: String,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub status: IntegrationStatus,
    pub scopes: BTreeSet<String>,
    pub platform_metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Decrypted tokens of an integration.
#[derive(Clone, PartialEq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// None means non-expiring or unknown
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Credentials {
    /// Expires within `margin` of now. Tokens without an expiry never do.
    pub fn expires_within(&self, margin: chrono::Duration) -> bool {
        self.expires_at
            .map(|at| at <= Utc::now() + margin)
            .unwrap_or(false)
    }
}

/// Outcome of a failed refresh, replayed to callers that waited on it.
#[derive(Debug, Clone)]
enum RefreshFailure {
    Reauth(String),
    Unavailable(String),
    Adapter(AdapterError),
}

impl RefreshFailure {
    fn to_error(&self) -> Error {
        match self {
            RefreshFailure::Reauth(msg) => Error::ReauthRequired(msg.clone()),
            RefreshFailure::Unavailable(msg) => Error::RefreshUnavailable(msg.clone()),
            RefreshFailure::Adapter(err) => Error::Adapter(err.clone()),
        }
    }
}

/// Why `refresh` gave up. Local errors (storage, a row that changed
/// underneath) are not replayed to waiters.
enum RefreshError {
    Failed(RefreshFailure),
    Local(Error),
}

impl From<Error> for RefreshError {
    fn from(err: Error) -> Self {
        RefreshError::Local(err)
    }
}

/// Per-integration write lock plus the outcome of the last completed refresh.
#[derive(Default)]
struct RefreshSlot {
    /// Bumped when a write under the lock completes. A cancelled refresh
    /// never bumps it.
    generation: AtomicU64,
    last_failure: tokio::sync::Mutex<Option<RefreshFailure>>,
}

impl RefreshSlot {
    /// Record a finished write. Waiters see the new generation and re-read.
    fn complete(&self, last_failure: &mut Option<RefreshFailure>, outcome: Option<RefreshFailure>) {
        *last_failure = outcome;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// Vault tuning, from the `[vault]` config section.
#[derive(Debug, Clone)]
pub struct VaultSettings {
    pub refresh_margin: chrono::Duration,
    pub retry: RetryPolicy,
    pub call_timeout: Duration,
}

impl VaultSettings {
    pub fn from_config(config: &crate::config::SocialSyncConfig) -> Self {
        Self {
            refresh_margin: chrono::Duration::seconds(config.vault.refresh_margin_seconds),
            retry: RetryPolicy {
                max_attempts: config.vault.refresh_max_attempts.max(1),
                base_delay: Duration::from_millis(config.vault.refresh_base_delay_ms),
                max_delay: Duration::from_millis(config.resilience.max_delay_ms),
                max_retry_after: Duration::from_secs(config.resilience.max_retry_after_seconds),
            },
            call_timeout: Duration::from_secs(config.resilience.call_timeout_seconds),
        }
    }
}

pub struct TokenVault {
    store: Arc<IntegrationStore>,
    registry: Arc<ProviderRegistry>,
    clients: Arc<HashMap<String, ClientInfo>>,
    settings: VaultSettings,
    slots: DashMap<String, Arc<RefreshSlot>>,
}

impl TokenVault {
    pub fn new(
        store: Arc<IntegrationStore>,
        registry: Arc<ProviderRegistry>,
        clients: Arc<HashMap<String, ClientInfo>>,
        settings: VaultSettings,
    ) -> Self {
        Self {
            store,
            registry,
            clients,
            settings,
            slots: DashMap::new(),
        }
    }

    /// Persist the tokens of a freshly authorized account. Tokens are sealed
    /// before they reach the database.
    ///
    /// Reconnecting an account that already has a row waits for any refresh
    /// in flight on it, so the stale refresh cannot overwrite the new grant.
    pub async fn store(
        &self,
        user_id: &str,
        provider: &str,
        tokens: &TokenSet,
    ) -> Result<Integration> {
        if tokens.internal_id.is_empty() {
            return Err(Error::Adapter(AdapterError::AuthExchange(
                "token response did not identify the account".to_string(),
            )));
        }
        let integration = match self.store.find_id(user_id, provider, &tokens.internal_id)? {
            Some(existing) => {
                let slot = self.slot(&existing);
                let mut last_failure = slot.last_failure.lock().await;
                let integration = self.store.upsert(user_id, provider, tokens)?;
                slot.complete(&mut last_failure, None);
                integration
            }
            None => self.store.upsert(user_id, provider, tokens)?,
        };
        info!(
            user_id = %user_id,
            provider = %provider,
            integration_id = %integration.id,
            has_refresh_token = tokens.refresh_token.is_some(),
            "Stored integration credentials"
        );
        Ok(integration)
    }

    /// Integration metadata by id.
    pub fn integration(&self, integration_id: &str) -> Result<Integration> {
        self.store
            .get(integration_id)?
            .ok_or_else(|| Error::NotFound(format!("integration {}", integration_id)))
    }

    /// Decrypted tokens by id.
    pub fn get(&self, integration_id: &str) -> Result<Credentials> {
        self.store
            .credentials(integration_id)?
            .ok_or_else(|| Error::NotFound(format!("integration {}", integration_id)))
    }

    /// Change the status of an integration, after any refresh in flight.
    pub async fn set_status(&self, integration_id: &str, status: IntegrationStatus) -> Result<()> {
        let slot = self.slot(integration_id);
        let mut last_failure = slot.last_failure.lock().await;
        self.store.set_status(integration_id, status)?;
        slot.complete(&mut last_failure, None);
        Ok(())
    }

    /// Live integrations of a user.
    pub fn list(&self, user_id: &str) -> Result<Vec<Integration>> {
        Ok(self.store.list_by_user(user_id)?)
    }

    /// Soft-delete an integration. Returns false if it was already gone.
    pub async fn soft_delete(&self, integration_id: &str) -> Result<bool> {
        let slot = self.slot(integration_id);
        let mut last_failure = slot.last_failure.lock().await;
        let deleted = self.store.soft_delete(integration_id)?;
        slot.complete(&mut last_failure, None);
        Ok(deleted)
    }

    /// A valid access token, refreshing first if the current one expires
    /// within the safety margin or a refresh is pending.
    ///
    /// # Errors
    /// - `ReauthRequired` when the grant is revoked or cannot be refreshed
    /// - `RefreshUnavailable` when the platform stayed unreachable
    pub async fn ensure_fresh(&self, integration_id: &str) -> Result<String> {
        let integration = self.integration(integration_id)?;
        if integration.status.requires_reauth() {
            return Err(reauth_error(&integration));
        }
        let credentials = self.get(integration_id)?;
        if !self.needs_refresh(&integration, &credentials) {
            return Ok(credentials.access_token);
        }

        let slot = self.slot(integration_id);
        let seen = slot.generation.load(Ordering::SeqCst);
        let mut last_failure = slot.last_failure.lock().await;

        if slot.generation.load(Ordering::SeqCst) != seen {
            if let Some(failure) = last_failure.as_ref() {
                debug!(integration_id = %integration_id, "Reusing concurrent refresh failure");
                return Err(failure.to_error());
            }
        }

        // Re-read under the lock; a completed refresh or reconnect shows up here
        let integration = self.integration(integration_id)?;
        if integration.status.requires_reauth() {
            return Err(reauth_error(&integration));
        }
        let credentials = self.get(integration_id)?;
        if !self.needs_refresh(&integration, &credentials) {
            return Ok(credentials.access_token);
        }

        // Dropping this future before it completes leaves the slot untouched,
        // so a waiter runs its own refresh
        match self.refresh(&integration, credentials).await {
            Ok(access_token) => {
                slot.complete(&mut last_failure, None);
                Ok(access_token)
            }
            Err(RefreshError::Failed(failure)) => {
                let err = failure.to_error();
                slot.complete(&mut last_failure, Some(failure));
                Err(err)
            }
            Err(RefreshError::Local(err)) => {
                slot.complete(&mut last_failure, None);
                Err(err)
            }
        }
    }

    fn needs_refresh(&self, integration: &Integration, credentials: &Credentials) -> bool {
        integration.status == IntegrationStatus::RefreshNeeded
            || credentials.expires_within(self.settings.refresh_margin)
    }

    fn slot(&self, integration_id: &str) -> Arc<RefreshSlot> {
        self.slots
            .entry(integration_id.to_string())
            .or_default()
            .clone()
    }

    /// Runs the refresh and persists its result.
    async fn refresh(
        &self,
        integration: &Integration,
        credentials: Credentials,
    ) -> std::result::Result<String, RefreshError> {
        let Some(refresh_token) = credentials.refresh_token.clone() else {
            self.mark(integration, IntegrationStatus::Expired)?;
            return Err(RefreshError::Failed(RefreshFailure::Reauth(format!(
                "{} access token expired and no refresh token is stored",
                integration.provider
            ))));
        };

        let adapter = self.registry.get(&integration.provider)?;
        let client = self.clients.get(&integration.provider).ok_or_else(|| {
            RefreshError::Failed(RefreshFailure::Adapter(AdapterError::Configuration(format!(
                "client credentials for '{}' are missing",
                integration.provider
            ))))
        })?;

        info!(
            integration_id = %integration.id,
            provider = %integration.provider,
            "Refreshing access token"
        );

        let mut attempt: u32 = 0;
        let outcome = loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                self.settings.call_timeout,
                adapter.refresh_token(&refresh_token, client),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(AdapterError::TransientNetwork(
                    "token refresh timed out".to_string(),
                )),
            };

            match result {
                Ok(tokens) => break Ok(tokens),
                Err(err) => match self.settings.retry.delay_for(attempt, &err) {
                    Some(delay) => {
                        warn!(
                            integration_id = %integration.id,
                            provider = %integration.provider,
                            attempt = attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %err,
                            "Token refresh failed, will retry"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => break Err(err),
                },
            }
        };

        if self.superseded(integration)? {
            debug!(
                integration_id = %integration.id,
                provider = %integration.provider,
                "Integration changed during refresh, discarding result"
            );
            let current = self.integration(&integration.id)?;
            if current.status.requires_reauth() {
                return Err(RefreshError::Local(reauth_error(&current)));
            }
            return Ok(self.get(&integration.id)?.access_token);
        }

        match outcome {
            Ok(tokens) => {
                let refreshed = Credentials {
                    access_token: tokens.access_token,
                    // Platforms that do not rotate refresh tokens leave this unset
                    refresh_token: tokens.refresh_token.or(Some(refresh_token)),
                    expires_at: tokens.expires_at,
                };
                self.store
                    .update_tokens(&integration.id, &refreshed)
                    .map_err(Error::from)?;
                info!(
                    integration_id = %integration.id,
                    provider = %integration.provider,
                    expires_at = ?refreshed.expires_at,
                    "Access token refreshed"
                );
                Ok(refreshed.access_token)
            }
            Err(AdapterError::TokenRevoked(reason)) => {
                warn!(
                    integration_id = %integration.id,
                    provider = %integration.provider,
                    "Refresh rejected, grant revoked"
                );
                self.mark(integration, IntegrationStatus::Revoked)?;
                Err(RefreshError::Failed(RefreshFailure::Reauth(reason)))
            }
            Err(AdapterError::TokenExpired(reason)) => {
                self.mark(integration, IntegrationStatus::Expired)?;
                Err(RefreshError::Failed(RefreshFailure::Reauth(reason)))
            }
            Err(err) if err.is_retryable() => {
                warn!(
                    integration_id = %integration.id,
                    provider = %integration.provider,
                    attempts = attempt,
                    error = %err,
                    "Token refresh unavailable"
                );
                self.mark(integration, IntegrationStatus::RefreshNeeded)?;
                Err(RefreshError::Failed(RefreshFailure::Unavailable(err.to_string())))
            }
            Err(err @ AdapterError::Configuration(_)) => {
                Err(RefreshError::Failed(RefreshFailure::Adapter(err)))
            }
            Err(err) => {
                self.mark(integration, IntegrationStatus::Error)?;
                Err(RefreshError::Failed(RefreshFailure::Adapter(err)))
            }
        }
    }

    /// The row no longer matches the snapshot `refresh` started from.
    fn superseded(&self, integration: &Integration) -> Result<bool> {
        Ok(self
            .store
            .get(&integration.id)?
            .map(|current| current.updated_at != integration.updated_at)
            .unwrap_or(true))
    }

    /// Status write for a caller that already holds the integration's lock.
    fn mark(&self, integration: &Integration, status: IntegrationStatus) -> Result<()> {
        if integration.status != status {
            info!(
                integration_id = %integration.id,
                provider = %integration.provider,
                from = integration.status.as_str(),
                to = status.as_str(),
                "Integration status changed"
            );
        }
        self.store.set_status(&integration.id, status)?;
        Ok(())
    }
}

fn reauth_error(integration: &Integration) -> Error {
    Error::ReauthRequired(format!(
        "{} integration {} is {}",
        integration.provider,
        integration.id,
        integration.status.as_str()
    ))
}
