//! Provider registry - maps provider identifiers to live adapters.
//!
//! Registration happens single-threaded at startup; afterwards the registry
//! is shared behind an `Arc` and only read, so lookups take no locks.

use super::{EditorMode, ProviderAdapter};
use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Feature-flag predicate: returns true when a provider identifier is enabled.
pub type FeatureFlag = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Public description of an enabled provider
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ProviderMetadata {
    pub identifier: String,
    pub display_name: String,
    pub required_scopes: BTreeSet<String>,
    pub editor_mode: EditorMode,
}

pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    is_enabled: FeatureFlag,
}

impl ProviderRegistry {
    /// Create an empty registry filtered by `is_enabled`.
    pub fn new(is_enabled: FeatureFlag) -> Self {
        Self {
            adapters: HashMap::new(),
            is_enabled,
        }
    }

    /// Registry where every registered provider is enabled.
    pub fn all_enabled() -> Self {
        Self::new(Arc::new(|_: &str| true))
    }

    /// Register an adapter under its identifier.
    ///
    /// # Errors
    /// `DuplicateProvider` if the identifier is already taken.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) -> Result<()> {
        let identifier = adapter.identifier().to_string();
        if self.adapters.contains_key(&identifier) {
            return Err(Error::DuplicateProvider(identifier));
        }

        tracing::debug!(
            provider = %identifier,
            enabled = (self.is_enabled)(&identifier),
            "Registered provider adapter"
        );
        self.adapters.insert(identifier, adapter);
        Ok(())
    }

    /// Look up an enabled adapter. Disabled providers are reported as not found.
    pub fn get(&self, identifier: &str) -> Result<Arc<dyn ProviderAdapter>> {
        match self.adapters.get(identifier) {
            Some(adapter) if (self.is_enabled)(identifier) => Ok(Arc::clone(adapter)),
            _ => Err(Error::ProviderNotFound(identifier.to_string())),
        }
    }

    /// Metadata for every enabled provider, sorted by identifier.
    pub fn list_enabled(&self) -> Vec<ProviderMetadata> {
        let mut enabled: Vec<ProviderMetadata> = self
            .adapters
            .values()
            .filter(|adapter| (self.is_enabled)(adapter.identifier()))
            .map(|adapter| ProviderMetadata {
                identifier: adapter.identifier().to_string(),
                display_name: adapter.display_name().to_string(),
                required_scopes: adapter.required_scopes(),
                editor_mode: adapter.editor_mode(),
            })
            .collect();
        enabled.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        enabled
    }

    /// Identifiers of all registered providers, enabled or not.
    pub fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}
