//! Provider adapter contract.
//!
//! Every social platform is integrated through one [`ProviderAdapter`]
//! implementation. Adapters are stateless with respect to users: tokens are
//! handed in per call by the vault, and all per-platform differences (URLs,
//! scopes, payload shapes, limits) live inside the adapter or in
//! configuration, never in branches elsewhere in the crate.
//!
//! # Lifecycle
//! 1. Registered once at startup in the [`ProviderRegistry`]
//! 2. `generate_auth_url` / `authenticate` drive the OAuth flow
//! 3. `refresh_token` keeps credentials alive (called by the vault)
//! 4. `post` / `analytics` run under the resilience policy

#[cfg(any(test, feature = "test-utils"))]
mod mock;
mod registry;

#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockAdapter;
pub use registry::{FeatureFlag, ProviderMetadata, ProviderRegistry};

use crate::error::AdapterError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// OAuth client registration for one provider.
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

impl ClientInfo {
    /// Fails with `Configuration` when either credential half is blank.
    pub fn ensure_complete(&self, provider: &str) -> Result<(), AdapterError> {
        if self.client_id.trim().is_empty() || self.client_secret.trim().is_empty() {
            return Err(AdapterError::Configuration(format!(
                "client credentials for '{}' are missing",
                provider
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ClientInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientInfo")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

/// Result of a successful code exchange or refresh.
///
/// `internal_id` is the platform-side account/channel id the grant belongs to.
/// On refresh, adapters may leave `internal_id` empty and `refresh_token`
/// unset when the platform does not rotate it; the vault keeps the old values.
#[derive(Clone, PartialEq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: BTreeSet<String>,
    pub internal_id: String,
    pub metadata: BTreeMap<String, String>,
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .field("internal_id", &self.internal_id)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// How the post editor should treat text for a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditorMode {
    Normal,
    Markdown,
    Html,
}

/// A media reference produced by the content subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub alt_text: Option<String>,
}

impl MediaRef {
    pub fn is_video(&self) -> bool {
        self.mime_type
            .as_deref()
            .map(|m| m.starts_with("video/"))
            .unwrap_or(false)
    }
}

/// Fully resolved content for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostDetails {
    pub text: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub media: Vec<MediaRef>,
    /// Platform-specific settings (board id, privacy status, ...)
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
    /// Content hash + target + time bucket
    pub idempotency_key: String,
}

impl PostDetails {
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_str())
    }
}

/// The connected account a call is made on behalf of.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountRef {
    pub integration_id: String,
    pub internal_id: String,
    pub metadata: BTreeMap<String, String>,
}

/// Platform response to a successful post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedPost {
    pub platform_post_id: String,
    pub platform_url: String,
}

/// One analytics data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsPoint {
    pub metric: String,
    pub date: NaiveDate,
    pub value: f64,
}

/// Lazy, finite sequence of analytics points. Pages are fetched as the
/// stream is polled; calling `analytics` again restarts from the first page.
pub type AnalyticsStream = BoxStream<'static, Result<AnalyticsPoint, AdapterError>>;

/// Contract every platform adapter implements.
///
/// Implementations must be safe to call concurrently for different
/// integrations; they hold no per-user state.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable machine-readable id, e.g. `"twitter"`.
    fn identifier(&self) -> &str;

    /// Human-readable name shown in provider pickers.
    fn display_name(&self) -> &str;

    /// Scopes requested at authorization time.
    fn required_scopes(&self) -> BTreeSet<String>;

    fn editor_mode(&self) -> EditorMode {
        EditorMode::Normal
    }

    /// Whether the platform removes duplicate posts sent with the same
    /// idempotency key. When false, an in-call retry after a transport
    /// failure may create a duplicate post.
    fn deduplicates_natively(&self) -> bool {
        false
    }

    /// Build the platform authorization URL. Pure; no I/O.
    ///
    /// # Errors
    /// `Configuration` if client credentials are missing.
    fn generate_auth_url(
        &self,
        client: &ClientInfo,
        state: &str,
        code_challenge: &str,
    ) -> Result<String, AdapterError>;

    /// Exchange an authorization code for tokens.
    ///
    /// Fails rather than returning a partially-populated `TokenSet` when the
    /// platform response lacks required fields.
    async fn authenticate(
        &self,
        code: &str,
        code_verifier: &str,
        client: &ClientInfo,
    ) -> Result<TokenSet, AdapterError>;

    /// Obtain a new access token.
    ///
    /// Platforms without refresh support return `TokenExpired` immediately.
    async fn refresh_token(
        &self,
        refresh_token: &str,
        client: &ClientInfo,
    ) -> Result<TokenSet, AdapterError>;

    /// Create a post on the platform.
    async fn post(
        &self,
        account: &AccountRef,
        access_token: &str,
        details: &PostDetails,
    ) -> Result<PublishedPost, AdapterError>;

    /// Daily analytics for the last `days_back` days.
    fn analytics(&self, account: &AccountRef, access_token: &str, days_back: u32) -> AnalyticsStream;

    /// Best-effort revocation of a grant on disconnect.
    async fn revoke(&self, _access_token: &str, _client: &ClientInfo) -> Result<(), AdapterError> {
        Ok(())
    }
}
