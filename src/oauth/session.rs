//! Short-lived OAuth sessions keyed by state token.
//!
//! A session carries the PKCE verifier between `initiate` and the callback.
//! Sessions are single-use: consuming one removes it before anything else is
//! checked, so a replayed callback always misses.

use super::pkce;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone)]
pub struct OAuthSession {
    pub state: String,
    pub code_verifier: String,
    pub user_id: String,
    pub provider: String,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for OAuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthSession")
            .field("user_id", &self.user_id)
            .field("provider", &self.provider)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// In-memory session store with expiry
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<String, OAuthSession>>>,
    ttl: Duration,
}

impl SessionStore {
    /// `ttl_seconds`: how long a session stays valid (default 600 = 10 minutes)
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, OAuthSession>> {
        // Entries are inserted and removed whole, so a poisoned map is still consistent
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a session with a fresh state token and PKCE verifier.
    pub fn create(&self, user_id: &str, provider: &str) -> OAuthSession {
        let session = OAuthSession {
            state: pkce::generate_state(),
            code_verifier: pkce::generate_code_verifier(),
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            created_at: Utc::now(),
        };

        self.sessions()
            .insert(session.state.clone(), session.clone());
        session
    }

    /// Remove and return the session if it exists and has not expired.
    ///
    /// The entry is gone after this call whatever the outcome.
    pub fn consume(&self, state: &str) -> Option<OAuthSession> {
        let session = self.sessions().remove(state)?;

        if Utc::now() - session.created_at > self.ttl {
            return None;
        }
        Some(session)
    }

    pub fn cleanup_expired(&self) {
        let now = Utc::now();
        let ttl = self.ttl;
        self.sessions()
            .retain(|_, session| now - session.created_at <= ttl);
    }

    pub fn count(&self) -> usize {
        self.sessions().len()
    }
}

/// Background task to periodically drop expired sessions
pub async fn run_session_cleanup(store: SessionStore, interval_seconds: u64) {
    let mut interval =
        tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds.max(1)));

    loop {
        interval.tick().await;
        store.cleanup_expired();
        tracing::debug!(
            remaining = store.count(),
            "OAuth session cleanup complete"
        );
    }
}
