//! Error taxonomy for the integration layer.
//!
//! Two levels:
//! - [`AdapterError`] is what a single platform call can fail with.
//! - [`Error`] is what the orchestrator, vault, resilience layer and
//!   coordinator surface to callers. Adapter failures are carried inside it.
//!
//! Messages never contain access or refresh tokens.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single call into a provider adapter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    /// Client credentials missing or unusable for this provider
    #[error("Provider configuration error: {0}")]
    Configuration(String),

    /// Authorization code / verifier rejected, or token response malformed
    #[error("Authorization code exchange failed: {0}")]
    AuthExchange(String),

    /// Access token expired; recoverable via refresh or re-authorization
    #[error("Token expired: {0}")]
    TokenExpired(String),

    /// Grant revoked by the user or the platform; terminal
    #[error("Token revoked: {0}")]
    TokenRevoked(String),

    /// Platform throttled the call
    #[error("Rate limited by platform, retry after {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    /// Connect/read failure, timeout or 5xx
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Platform refused the request on semantic grounds (content policy etc.)
    #[error("Rejected by platform: {0}")]
    PlatformRejected(String),
}

impl AdapterError {
    /// Whether the resilience layer may retry the call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdapterError::TransientNetwork(_) | AdapterError::RateLimited { .. }
        )
    }

    /// Whether the failure counts towards opening a provider's circuit breaker.
    pub fn trips_breaker(&self) -> bool {
        matches!(self, AdapterError::TransientNetwork(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::Configuration(_) => ErrorKind::Configuration,
            AdapterError::AuthExchange(_) => ErrorKind::AuthExchange,
            AdapterError::TokenExpired(_) => ErrorKind::TokenExpired,
            AdapterError::TokenRevoked(_) => ErrorKind::TokenRevoked,
            AdapterError::RateLimited { .. } => ErrorKind::RateLimited,
            AdapterError::TransientNetwork(_) => ErrorKind::TransientNetwork,
            AdapterError::PlatformRejected(_) => ErrorKind::PlatformRejected,
        }
    }
}

/// Crate-level error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Provider '{0}' is already registered")]
    DuplicateProvider(String),

    #[error("Provider '{0}' not found")]
    ProviderNotFound(String),

    #[error("Invalid or expired OAuth state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Re-authorization required: {0}")]
    ReauthRequired(String),

    #[error("Token refresh unavailable: {0}")]
    RefreshUnavailable(String),

    #[error("Rate limit exceeded, retry after {}ms", .retry_after.as_millis())]
    RateLimitExceeded { retry_after: Duration },

    #[error("Concurrency limit reached for provider '{0}'")]
    ConcurrencyExceeded(String),

    #[error("Circuit open for provider '{provider}', retry after {}ms", .retry_after.as_millis())]
    CircuitOpen {
        provider: String,
        retry_after: Duration,
    },

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("Storage error: {0:#}")]
    Storage(anyhow::Error),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Storage(err)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::DuplicateProvider(_) => ErrorKind::DuplicateProvider,
            Error::ProviderNotFound(_) => ErrorKind::ProviderNotFound,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::ReauthRequired(_) => ErrorKind::ReauthRequired,
            Error::RefreshUnavailable(_) => ErrorKind::RefreshUnavailable,
            Error::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Error::ConcurrencyExceeded(_) => ErrorKind::ConcurrencyExceeded,
            Error::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Error::Adapter(e) => e.kind(),
            Error::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether retrying the same request later can succeed without user action.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RefreshUnavailable(_)
            | Error::RateLimitExceeded { .. }
            | Error::ConcurrencyExceeded(_)
            | Error::CircuitOpen { .. }
            | Error::Storage(_) => true,
            Error::Adapter(e) => e.is_retryable() || matches!(e, AdapterError::TokenExpired(_)),
            _ => false,
        }
    }

    /// Delay hint for load-shedding failures.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimitExceeded { retry_after } | Error::CircuitOpen { retry_after, .. } => {
                Some(*retry_after)
            }
            Error::Adapter(AdapterError::RateLimited { retry_after }) => Some(*retry_after),
            _ => None,
        }
    }
}

/// Machine-readable failure kind, shared by HTTP error bodies and publish results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Configuration,
    DuplicateProvider,
    ProviderNotFound,
    InvalidState,
    AuthExchange,
    TokenExpired,
    TokenRevoked,
    ReauthRequired,
    RefreshUnavailable,
    RateLimited,
    RateLimitExceeded,
    ConcurrencyExceeded,
    CircuitOpen,
    TransientNetwork,
    PlatformRejected,
    NotFound,
    Cancelled,
    Storage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_and_rate_limited_are_retryable() {
        assert!(AdapterError::TransientNetwork("reset".into()).is_retryable());
        assert!(AdapterError::RateLimited {
            retry_after: Duration::from_secs(1)
        }
        .is_retryable());

        assert!(!AdapterError::TokenRevoked("revoked".into()).is_retryable());
        assert!(!AdapterError::PlatformRejected("policy".into()).is_retryable());
        assert!(!AdapterError::AuthExchange("bad code".into()).is_retryable());
        assert!(!AdapterError::TokenExpired("expired".into()).is_retryable());
    }

    #[test]
    fn test_breaker_counts_transient_only() {
        assert!(AdapterError::TransientNetwork("503".into()).trips_breaker());
        assert!(!AdapterError::RateLimited {
            retry_after: Duration::from_secs(1)
        }
        .trips_breaker());
        assert!(!AdapterError::PlatformRejected("nope".into()).trips_breaker());
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::ReauthRequired).unwrap();
        assert_eq!(json, "\"REAUTH_REQUIRED\"");

        let kind: ErrorKind = serde_json::from_str("\"PLATFORM_REJECTED\"").unwrap();
        assert_eq!(kind, ErrorKind::PlatformRejected);
    }

    #[test]
    fn test_adapter_error_kind_passes_through() {
        let err = Error::from(AdapterError::TokenRevoked("gone".into()));
        assert_eq!(err.kind(), ErrorKind::TokenRevoked);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retry_after_hint() {
        let err = Error::RateLimitExceeded {
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
        assert_eq!(err.to_string(), "Rate limit exceeded, retry after 1500ms");

        let err = Error::NotFound("integration x".into());
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn test_storage_error_from_anyhow() {
        let err: Error = anyhow::anyhow!("disk full").context("Failed to store").into();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(err.to_string().contains("disk full"));
    }
}
