//! Service configuration.
//!
//! Loaded from a TOML file; every section falls back to defaults so a partial
//! file (or none at all) is valid. Client secrets can be supplied through the
//! environment instead of the file:
//! `SOCIALSYNC_OAUTH_<PROVIDER>_CLIENT_ID` / `SOCIALSYNC_OAUTH_<PROVIDER>_CLIENT_SECRET`.

use crate::providers::ClientInfo;
use crate::rate_limit::{OperationClass, WindowLimit};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Complete service configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SocialSyncConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    /// Keyed by provider identifier ("facebook", "twitter", ...)
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Public base URL used to build OAuth redirect URIs
    #[serde(default = "default_callback_base_url")]
    pub callback_base_url: String,
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_callback_base_url() -> String {
    "http://localhost:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            callback_base_url: default_callback_base_url(),
            cors_allowed_origins: Vec::new(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_database_path() -> String {
    "socialsync.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// OAuth session configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_session_ttl")]
    pub session_ttl_seconds: i64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
}

fn default_session_ttl() -> i64 {
    600
}

fn default_cleanup_interval() -> u64 {
    60
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_seconds: default_session_ttl(),
            cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

/// Token vault configuration
#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    /// Refresh when the access token expires within this many seconds
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_seconds: i64,
    #[serde(default = "default_refresh_max_attempts")]
    pub refresh_max_attempts: u32,
    #[serde(default = "default_refresh_base_delay")]
    pub refresh_base_delay_ms: u64,
}

fn default_refresh_margin() -> i64 {
    60
}

fn default_refresh_max_attempts() -> u32 {
    3
}

fn default_refresh_base_delay() -> u64 {
    200
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            refresh_margin_seconds: default_refresh_margin(),
            refresh_max_attempts: default_refresh_max_attempts(),
            refresh_base_delay_ms: default_refresh_base_delay(),
        }
    }
}

/// Retry, timeout, bulkhead and circuit breaker defaults
#[derive(Debug, Clone, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Platform `Retry-After` hints longer than this are not waited out
    #[serde(default = "default_max_retry_after")]
    pub max_retry_after_seconds: u64,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_seconds: u64,
    /// How long a call may wait for a rate-limit or concurrency slot
    #[serde(default = "default_acquire_max_wait")]
    pub acquire_max_wait_ms: u64,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_window")]
    pub breaker_window_seconds: u64,
    #[serde(default = "default_breaker_cooldown")]
    pub breaker_cooldown_seconds: u64,
    #[serde(default = "default_max_concurrency")]
    pub default_max_concurrency: usize,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    250
}

fn default_max_delay() -> u64 {
    10_000
}

fn default_max_retry_after() -> u64 {
    30
}

fn default_call_timeout() -> u64 {
    30
}

fn default_acquire_max_wait() -> u64 {
    2_000
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_window() -> u64 {
    60
}

fn default_breaker_cooldown() -> u64 {
    30
}

fn default_max_concurrency() -> usize {
    8
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            max_retry_after_seconds: default_max_retry_after(),
            call_timeout_seconds: default_call_timeout(),
            acquire_max_wait_ms: default_acquire_max_wait(),
            breaker_failure_threshold: default_breaker_threshold(),
            breaker_window_seconds: default_breaker_window(),
            breaker_cooldown_seconds: default_breaker_cooldown(),
            default_max_concurrency: default_max_concurrency(),
        }
    }
}

/// Per-provider configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Bulkhead size; falls back to `resilience.default_max_concurrency`
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub limits: Vec<LimitConfig>,
}

fn default_enabled() -> bool {
    true
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            client_id: None,
            client_secret: None,
            max_concurrency: None,
            limits: Vec::new(),
        }
    }
}

/// One sliding-window limit entry
#[derive(Debug, Clone, Deserialize)]
pub struct LimitConfig {
    pub operation: OperationClass,
    pub capacity: u32,
    pub window_seconds: u64,
}

impl From<&LimitConfig> for WindowLimit {
    fn from(limit: &LimitConfig) -> Self {
        WindowLimit {
            capacity: limit.capacity,
            window: Duration::from_secs(limit.window_seconds),
        }
    }
}

impl SocialSyncConfig {
    /// Whether a provider is switched on. Providers absent from the file are enabled.
    pub fn is_enabled(&self, provider: &str) -> bool {
        self.providers
            .get(provider)
            .map(|p| p.enabled)
            .unwrap_or(true)
    }

    /// Client credentials for a provider, if both halves are configured.
    pub fn client_info(&self, provider: &str, callback_base_url: &str) -> Option<ClientInfo> {
        let provider_config = self.providers.get(provider)?;
        let client_id = provider_config.client_id.clone().filter(|s| !s.is_empty())?;
        let client_secret = provider_config
            .client_secret
            .clone()
            .filter(|s| !s.is_empty())?;

        Some(ClientInfo {
            client_id,
            client_secret,
            redirect_uri: format!(
                "{}/social-accounts/callback/{}",
                callback_base_url.trim_end_matches('/'),
                provider
            ),
        })
    }

    /// Client credentials for every enabled provider in `providers` that has
    /// them. Enabled providers without credentials are left out and logged;
    /// their authorization attempts fail with a configuration error.
    pub fn clients(&self, providers: &[String]) -> HashMap<String, ClientInfo> {
        let mut clients = HashMap::new();
        for provider in providers {
            if !self.is_enabled(provider) {
                continue;
            }
            match self.client_info(provider, &self.server.callback_base_url) {
                Some(client) => {
                    clients.insert(provider.clone(), client);
                }
                None => tracing::warn!(
                    provider = %provider,
                    "Provider enabled without client credentials. Set SOCIALSYNC_OAUTH_{}_CLIENT_ID and SOCIALSYNC_OAUTH_{}_CLIENT_SECRET",
                    provider.to_uppercase(),
                    provider.to_uppercase()
                ),
            }
        }
        clients
    }

    /// Apply `SOCIALSYNC_OAUTH_<PROVIDER>_CLIENT_ID/SECRET` for the given providers.
    pub fn apply_env_overrides(&mut self, providers: &[&str]) {
        for provider in providers {
            let prefix = provider.to_uppercase();
            let client_id = std::env::var(format!("SOCIALSYNC_OAUTH_{}_CLIENT_ID", prefix)).ok();
            let client_secret =
                std::env::var(format!("SOCIALSYNC_OAUTH_{}_CLIENT_SECRET", prefix)).ok();

            if client_id.is_none() && client_secret.is_none() {
                continue;
            }

            let entry = self.providers.entry(provider.to_string()).or_default();
            if client_id.is_some() {
                entry.client_id = client_id;
            }
            if client_secret.is_some() {
                entry.client_secret = client_secret;
            }
        }

        if let Ok(path) = std::env::var("SOCIALSYNC_DATABASE") {
            self.storage.database_path = path;
        }
        if let Ok(bind) = std::env::var("SOCIALSYNC_BIND") {
            self.server.bind_address = bind;
        }
    }

    /// Window limits configured for (provider, operation).
    pub fn window_limits(&self) -> Vec<(String, OperationClass, WindowLimit)> {
        self.providers
            .iter()
            .flat_map(|(name, provider)| {
                provider
                    .limits
                    .iter()
                    .map(move |limit| (name.clone(), limit.operation, WindowLimit::from(limit)))
            })
            .collect()
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<SocialSyncConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: SocialSyncConfig = toml::from_str(&contents).context("Failed to parse config")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = SocialSyncConfig::default();
        assert_eq!(config.oauth.session_ttl_seconds, 600);
        assert_eq!(config.vault.refresh_margin_seconds, 60);
        assert_eq!(config.resilience.max_attempts, 3);
        assert_eq!(config.resilience.breaker_failure_threshold, 5);
        assert_eq!(config.server.bind_address, "0.0.0.0:8080");
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [server]
            callback_base_url = "https://app.example.com"

            [resilience]
            max_attempts = 5
            breaker_cooldown_seconds = 10

            [providers.twitter]
            client_id = "tw-id"
            client_secret = "tw-secret"
            max_concurrency = 1

            [[providers.twitter.limits]]
            operation = "post"
            capacity = 300
            window_seconds = 900

            [providers.pinterest]
            enabled = false
        "#;

        let config: SocialSyncConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.callback_base_url, "https://app.example.com");
        assert_eq!(config.resilience.max_attempts, 5);
        assert_eq!(config.resilience.breaker_cooldown_seconds, 10);
        assert_eq!(config.resilience.base_delay_ms, 250); // Default

        let twitter = &config.providers["twitter"];
        assert!(twitter.enabled);
        assert_eq!(twitter.max_concurrency, Some(1));
        assert_eq!(twitter.limits.len(), 1);
        assert_eq!(twitter.limits[0].operation, OperationClass::Post);
        assert_eq!(twitter.limits[0].capacity, 300);

        assert!(!config.is_enabled("pinterest"));
        assert!(config.is_enabled("twitter"));
        assert!(config.is_enabled("youtube")); // Absent means enabled
    }

    #[test]
    fn test_client_info_requires_both_halves() {
        let toml = r#"
            [providers.facebook]
            client_id = "fb-id"

            [providers.twitter]
            client_id = "tw-id"
            client_secret = "tw-secret"
        "#;
        let config: SocialSyncConfig = toml::from_str(toml).unwrap();

        assert!(config.client_info("facebook", "http://localhost").is_none());
        assert!(config.client_info("youtube", "http://localhost").is_none());

        let info = config
            .client_info("twitter", "https://app.example.com/")
            .unwrap();
        assert_eq!(info.client_id, "tw-id");
        assert_eq!(
            info.redirect_uri,
            "https://app.example.com/social-accounts/callback/twitter"
        );
    }

    #[test]
    fn test_window_limits_flattened() {
        let toml = r#"
            [[providers.facebook.limits]]
            operation = "post"
            capacity = 200
            window_seconds = 3600

            [[providers.facebook.limits]]
            operation = "analytics"
            capacity = 50
            window_seconds = 60
        "#;
        let config: SocialSyncConfig = toml::from_str(toml).unwrap();
        let mut limits = config.window_limits();
        limits.sort_by_key(|(_, op, _)| op.as_str());

        assert_eq!(limits.len(), 2);
        assert_eq!(limits[0].1, OperationClass::Analytics);
        assert_eq!(limits[1].2.capacity, 200);
        assert_eq!(limits[1].2.window, Duration::from_secs(3600));
    }

    #[test]
    fn test_clients_skip_disabled_and_incomplete() {
        let toml = r#"
            [server]
            callback_base_url = "https://app.example.com/"

            [providers.twitter]
            client_id = "tw-id"
            client_secret = "tw-secret"

            [providers.facebook]
            client_id = "fb-id"

            [providers.pinterest]
            enabled = false
            client_id = "pin-id"
            client_secret = "pin-secret"
        "#;
        let config: SocialSyncConfig = toml::from_str(toml).unwrap();
        let providers: Vec<String> = ["twitter", "facebook", "pinterest", "youtube"]
            .iter()
            .map(|p| p.to_string())
            .collect();

        let clients = config.clients(&providers);
        assert_eq!(clients.len(), 1);
        assert_eq!(
            clients["twitter"].redirect_uri,
            "https://app.example.com/social-accounts/callback/twitter"
        );
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[storage]\ndatabase_path = \"/tmp/test.db\"").unwrap();

        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.storage.database_path, "/tmp/test.db");
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(load_config("/nonexistent/socialsync.toml").is_err());
    }

    #[test]
    fn test_example_config_parses() {
        let config: SocialSyncConfig =
            toml::from_str(include_str!("../../socialsync.example.toml")).unwrap();
        assert_eq!(config.providers.len(), 5);

        let twitter_post = config
            .window_limits()
            .into_iter()
            .find(|(provider, op, _)| provider == "twitter" && *op == OperationClass::Post)
            .unwrap();
        assert_eq!(twitter_post.2.capacity, 300);
        assert_eq!(twitter_post.2.window, Duration::from_secs(900));
    }
}
