use anyhow::{Context, Result};
use platform_gateway::{build_registry, PROVIDERS};
use socialsync::api::{create_router, AppState};
use socialsync::config::{load_config, SocialSyncConfig};
use socialsync::oauth::run_session_cleanup;
use socialsync::vault::{TokenCipher, ENCRYPTION_KEY_ENV};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "platform_gateway=info,socialsync=info".into()),
        )
        .init();

    info!("Platform gateway starting...");

    let mut config = match std::env::var("SOCIALSYNC_CONFIG") {
        Ok(path) => {
            info!(path = %path, "Loading configuration");
            load_config(&path)?
        }
        Err(_) => {
            warn!("SOCIALSYNC_CONFIG not set, using defaults");
            SocialSyncConfig::default()
        }
    };
    config.apply_env_overrides(PROVIDERS);

    let cipher = TokenCipher::from_env().with_context(|| {
        format!("{} is required (base64-encoded 32-byte key)", ENCRYPTION_KEY_ENV)
    })?;

    let registry = build_registry(&config)?;
    let state = AppState::from_config(&config, registry, cipher)?;

    // Start OAuth session cleanup task
    let sessions = state.orchestrator.sessions().clone();
    let cleanup_interval = config.oauth.cleanup_interval_seconds;
    tokio::spawn(async move {
        run_session_cleanup(sessions, cleanup_interval).await;
    });

    let router = create_router(state, &config.server.cors_allowed_origins);
    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_address))?;
    info!(
        address = %config.server.bind_address,
        callback_base_url = %config.server.callback_base_url,
        "SocialSync API listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for ctrl_c signal");
            }
            info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    info!("Platform gateway stopped");
    Ok(())
}
