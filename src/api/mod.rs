//! HTTP surface: social account connection, publishing, health.

mod accounts;
mod error;
mod health;
mod publish;

pub use accounts::create_accounts_router;
pub use error::AppError;
pub use health::create_health_router;
pub use publish::create_publish_router;

use crate::auth::extract_user_id;
use crate::config::SocialSyncConfig;
use crate::oauth::{OAuthOrchestrator, SessionStore};
use crate::providers::ProviderRegistry;
use crate::publishing::{PublicationLedger, PublishingCoordinator};
use crate::rate_limit::ResiliencePolicy;
use crate::vault::{IntegrationStore, TokenCipher, TokenVault, VaultSettings};
use anyhow::Context;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method};
use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Shared application state for all routers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ProviderRegistry>,
    pub vault: Arc<TokenVault>,
    pub orchestrator: Arc<OAuthOrchestrator>,
    pub coordinator: Arc<PublishingCoordinator>,
    pub policy: Arc<ResiliencePolicy>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wire every component from configuration around an already populated
    /// provider registry.
    pub fn from_config(
        config: &SocialSyncConfig,
        registry: ProviderRegistry,
        cipher: TokenCipher,
    ) -> anyhow::Result<Self> {
        let registry = Arc::new(registry);
        let clients = Arc::new(config.clients(&registry.registered()));

        let database_path = &config.storage.database_path;
        let store = Arc::new(
            IntegrationStore::open(database_path, cipher)
                .context("Failed to open integration store")?,
        );
        let ledger = Arc::new(
            PublicationLedger::open(database_path).context("Failed to open publication ledger")?,
        );

        let vault = Arc::new(TokenVault::new(
            store,
            registry.clone(),
            clients.clone(),
            VaultSettings::from_config(config),
        ));
        let policy = Arc::new(ResiliencePolicy::from_config(config));

        let orchestrator = Arc::new(OAuthOrchestrator::new(
            registry.clone(),
            vault.clone(),
            SessionStore::new(config.oauth.session_ttl_seconds),
            clients.clone(),
            policy.clone(),
        ));
        let coordinator = Arc::new(PublishingCoordinator::new(
            registry.clone(),
            vault.clone(),
            policy.clone(),
            ledger,
        ));

        info!(
            database = %database_path,
            providers = registry.list_enabled().len(),
            configured_clients = clients.len(),
            "Application state initialized"
        );

        Ok(Self {
            registry,
            vault,
            orchestrator,
            coordinator,
            policy,
            started_at: Utc::now(),
        })
    }
}

/// Caller identity from the `X-User-Id` header
fn caller(headers: &HeaderMap) -> Result<String, AppError> {
    Ok(extract_user_id(headers)?)
}

/// Full application router. CORS is applied only when origins are configured.
pub fn create_router(state: AppState, cors_allowed_origins: &[String]) -> Router {
    let router = Router::new()
        .merge(create_accounts_router(state.clone()))
        .merge(create_publish_router(state.clone()))
        .merge(create_health_router(state));

    if cors_allowed_origins.is_empty() {
        return router;
    }
    router.layer(create_cors_layer(cors_allowed_origins))
}

fn create_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static(crate::auth::USER_ID_HEADER),
        ])
}
