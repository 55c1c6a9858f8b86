//! OAuth 2.0 authorization-code + PKCE flow for connecting social accounts.
//!
//! Each authorization attempt moves through:
//!
//! ```text
//! INITIATED → AWAITING_CALLBACK → EXCHANGING → CONNECTED
//!                     │                 │
//!                     └─────→ FAILED ←──┘
//! ```
//!
//! 1. `initiate` creates a session (state + PKCE verifier) and returns the
//!    platform authorization URL
//! 2. The user authorizes on the platform, which redirects to the callback
//! 3. `complete` consumes the session, then exchanges the code for tokens
//! 4. Tokens are sealed into the vault; the integration is ACTIVE
//!
//! Terminal states are never retried; the user starts a new attempt.

mod pkce;
mod session;

pub use pkce::{code_challenge, generate_code_verifier, generate_state};
pub use session::{run_session_cleanup, OAuthSession, SessionStore};

use crate::error::{AdapterError, Error, Result};
use crate::providers::{ClientInfo, ProviderRegistry};
use crate::rate_limit::{OperationClass, ResiliencePolicy};
use crate::vault::{Integration, TokenVault};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Phase of one authorization attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptPhase {
    Initiated,
    AwaitingCallback,
    Exchanging,
    Connected,
    Failed,
}

impl AttemptPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptPhase::Initiated => "INITIATED",
            AttemptPhase::AwaitingCallback => "AWAITING_CALLBACK",
            AttemptPhase::Exchanging => "EXCHANGING",
            AttemptPhase::Connected => "CONNECTED",
            AttemptPhase::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptPhase::Connected | AttemptPhase::Failed)
    }

    /// Legal transitions of the attempt state machine.
    pub fn can_transition_to(&self, next: AttemptPhase) -> bool {
        use AttemptPhase::*;
        matches!(
            (self, next),
            (Initiated, AwaitingCallback)
                | (Initiated, Failed)
                | (AwaitingCallback, Exchanging)
                | (AwaitingCallback, Failed)
                | (Exchanging, Connected)
                | (Exchanging, Failed)
        )
    }
}

/// Tracks one attempt's phase and logs each transition.
struct Attempt<'a> {
    provider: &'a str,
    user_id: Option<&'a str>,
    phase: AttemptPhase,
}

impl<'a> Attempt<'a> {
    fn new(provider: &'a str, user_id: Option<&'a str>, phase: AttemptPhase) -> Self {
        Self {
            provider,
            user_id,
            phase,
        }
    }

    fn advance(&mut self, next: AttemptPhase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "illegal OAuth transition {:?} -> {:?}",
            self.phase,
            next
        );
        debug!(
            provider = %self.provider,
            user_id = self.user_id.unwrap_or("-"),
            from = self.phase.as_str(),
            to = next.as_str(),
            "OAuth attempt transition"
        );
        self.phase = next;
    }

    fn fail(&mut self, err: Error) -> Error {
        self.advance(AttemptPhase::Failed);
        warn!(
            provider = %self.provider,
            user_id = self.user_id.unwrap_or("-"),
            kind = ?err.kind(),
            error = %err,
            "OAuth attempt failed"
        );
        err
    }
}

/// What the caller redirects the user to
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

pub struct OAuthOrchestrator {
    registry: Arc<ProviderRegistry>,
    vault: Arc<TokenVault>,
    sessions: SessionStore,
    clients: Arc<HashMap<String, ClientInfo>>,
    policy: Arc<ResiliencePolicy>,
}

impl OAuthOrchestrator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        vault: Arc<TokenVault>,
        sessions: SessionStore,
        clients: Arc<HashMap<String, ClientInfo>>,
        policy: Arc<ResiliencePolicy>,
    ) -> Self {
        Self {
            registry,
            vault,
            sessions,
            clients,
            policy,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    fn client(&self, provider: &str) -> Result<&ClientInfo> {
        self.clients.get(provider).ok_or_else(|| {
            Error::Adapter(AdapterError::Configuration(format!(
                "client credentials for '{}' are missing",
                provider
            )))
        })
    }

    /// Start an authorization attempt for `user_id` on `provider`.
    ///
    /// # Errors
    /// `ProviderNotFound` for unknown or disabled providers, `Configuration`
    /// when the provider has no client credentials.
    pub fn initiate(&self, user_id: &str, provider: &str) -> Result<AuthorizationRequest> {
        let mut attempt = Attempt::new(provider, Some(user_id), AttemptPhase::Initiated);

        let adapter = self.registry.get(provider).map_err(|e| attempt.fail(e))?;
        let client = self.client(provider).map_err(|e| attempt.fail(e))?;

        let session = self.sessions.create(user_id, provider);
        let challenge = code_challenge(&session.code_verifier);

        let url = match adapter.generate_auth_url(client, &session.state, &challenge) {
            Ok(url) => url,
            Err(e) => {
                self.sessions.consume(&session.state);
                return Err(attempt.fail(e.into()));
            }
        };

        attempt.advance(AttemptPhase::AwaitingCallback);
        info!(
            provider = %provider,
            user_id = %user_id,
            "OAuth session created, awaiting callback"
        );

        Ok(AuthorizationRequest {
            url,
            state: session.state,
        })
    }

    /// Handle the platform callback: consume the session, exchange the code,
    /// store the tokens.
    ///
    /// The session is consumed before anything else, so a second callback
    /// with the same state fails with `InvalidState` even when this one fails.
    pub async fn complete(&self, provider: &str, code: &str, state: &str) -> Result<Integration> {
        let mut attempt = Attempt::new(provider, None, AttemptPhase::AwaitingCallback);

        let session = self.sessions.consume(state).ok_or_else(|| {
            attempt.fail(Error::InvalidState(
                "unknown, expired or already used state".to_string(),
            ))
        })?;
        if session.provider != provider {
            return Err(attempt.fail(Error::InvalidState(format!(
                "state was issued for provider '{}'",
                session.provider
            ))));
        }
        let user_id = session.user_id.as_str();
        attempt.user_id = Some(user_id);
        attempt.advance(AttemptPhase::Exchanging);

        let adapter = self.registry.get(provider).map_err(|e| attempt.fail(e))?;
        let client = self.client(provider).map_err(|e| attempt.fail(e))?;

        // Single-use code: admitted against the auth budget, never retried
        self.policy
            .limiter()
            .acquire(provider, OperationClass::Auth)
            .map_err(|e| attempt.fail(e))?;

        info!(provider = %provider, user_id = %user_id, "Exchanging authorization code");
        let exchange = tokio::time::timeout(
            self.policy.call_timeout(),
            adapter.authenticate(code, &session.code_verifier, client),
        )
        .await
        .unwrap_or_else(|_| {
            Err(AdapterError::TransientNetwork(
                "authorization code exchange timed out".to_string(),
            ))
        });

        let tokens = exchange.map_err(|e| attempt.fail(e.into()))?;
        let integration = self
            .vault
            .store(user_id, provider, &tokens)
            .await
            .map_err(|e| attempt.fail(e))?;

        attempt.advance(AttemptPhase::Connected);
        info!(
            provider = %provider,
            user_id = %user_id,
            integration_id = %integration.id,
            "Social account connected"
        );
        Ok(integration)
    }

    /// Terminate an attempt the platform reported as denied or failed.
    /// The session is consumed so the state cannot be reused.
    pub fn abort(&self, provider: &str, state: Option<&str>, reason: &str) -> Error {
        if let Some(state) = state {
            self.sessions.consume(state);
        }
        let mut attempt = Attempt::new(provider, None, AttemptPhase::AwaitingCallback);
        attempt.fail(Error::Adapter(AdapterError::AuthExchange(format!(
            "authorization denied: {}",
            reason
        ))))
    }

    /// Disconnect an integration: best-effort revocation at the platform,
    /// then soft delete.
    ///
    /// # Errors
    /// `NotFound` if the integration does not exist or belongs to someone else.
    pub async fn disconnect(&self, user_id: &str, integration_id: &str) -> Result<()> {
        let integration = self.vault.integration(integration_id)?;
        if integration.user_id != user_id {
            return Err(Error::NotFound(format!("integration {}", integration_id)));
        }

        self.revoke_best_effort(&integration).await;

        self.vault.soft_delete(integration_id).await?;
        info!(
            user_id = %user_id,
            provider = %integration.provider,
            integration_id = %integration_id,
            "Social account disconnected"
        );
        Ok(())
    }

    async fn revoke_best_effort(&self, integration: &Integration) {
        let (Ok(adapter), Ok(client), Ok(credentials)) = (
            self.registry.get(&integration.provider),
            self.client(&integration.provider),
            self.vault.get(&integration.id),
        ) else {
            debug!(
                integration_id = %integration.id,
                provider = %integration.provider,
                "Skipping token revocation"
            );
            return;
        };

        let revoked = tokio::time::timeout(
            self.policy.call_timeout(),
            adapter.revoke(&credentials.access_token, client),
        )
        .await;

        match revoked {
            Ok(Ok(())) => debug!(integration_id = %integration.id, "Token revoked at platform"),
            Ok(Err(e)) => warn!(
                integration_id = %integration.id,
                provider = %integration.provider,
                error = %e,
                "Token revocation failed, disconnecting anyway"
            ),
            Err(_) => warn!(
                integration_id = %integration.id,
                provider = %integration.provider,
                "Token revocation timed out, disconnecting anyway"
            ),
        }
    }
}
