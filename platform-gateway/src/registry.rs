//! Registry construction - every concrete adapter behind one shared client.

use crate::adapters::{
    FacebookAdapter, InstagramAdapter, PinterestAdapter, TwitterAdapter, YouTubeAdapter,
};
use crate::http::build_client;
use anyhow::{Context, Result};
use socialsync::config::SocialSyncConfig;
use socialsync::providers::{ProviderAdapter, ProviderRegistry};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Identifiers of every adapter this gateway ships.
pub const PROVIDERS: &[&str] = &["facebook", "instagram", "pinterest", "twitter", "youtube"];

/// Register all adapters. Providers switched off in `config` stay registered
/// but are invisible to lookups.
pub fn build_registry(config: &SocialSyncConfig) -> Result<ProviderRegistry> {
    let timeout = Duration::from_secs(config.resilience.call_timeout_seconds.max(1));
    let http = build_client(timeout).context("Failed to build platform HTTP client")?;

    let disabled: HashSet<String> = PROVIDERS
        .iter()
        .filter(|id| !config.is_enabled(id))
        .map(|id| id.to_string())
        .collect();
    if !disabled.is_empty() {
        info!(disabled = ?disabled, "Providers disabled by configuration");
    }

    let mut registry = ProviderRegistry::new(Arc::new(move |id: &str| !disabled.contains(id)));
    let adapters: Vec<Arc<dyn ProviderAdapter>> = vec![
        Arc::new(FacebookAdapter::new(http.clone())),
        Arc::new(InstagramAdapter::new(http.clone())),
        Arc::new(PinterestAdapter::new(http.clone())),
        Arc::new(TwitterAdapter::new(http.clone())),
        Arc::new(YouTubeAdapter::new(http)),
    ];
    for adapter in adapters {
        registry.register(adapter)?;
    }

    Ok(registry)
}
