//! SocialSync Platform Gateway - concrete adapters for the social platforms.
//!
//! This crate implements [`socialsync::providers::ProviderAdapter`] for
//! Facebook, Instagram, Twitter/X, YouTube and Pinterest, and ships the
//! `platform-gateway` binary that serves the SocialSync HTTP API with them.
//!
//! # Architecture
//!
//! ```text
//!   SocialSync core (vault, orchestrator, publishing coordinator)
//!          ↓  ProviderAdapter
//! ┌─────────────────────────────────────────┐
//! │       Adapter (one per platform)         │
//! │  - Payload shape                         │
//! │  - Platform error codes                  │
//! └─────────────────────────────────────────┘
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │       Shared plumbing                    │
//! │  - PlatformProfile (endpoints, scopes)   │
//! │  - OAuth2Client (token endpoint)         │
//! │  - ApiClient (status classification)     │
//! └─────────────────────────────────────────┘
//!          ↓
//!     Platform REST APIs
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - The five adapters
//! - [`platforms`] - Endpoint and scope data per platform
//! - [`oauth2`] - Authorization URLs, code exchange, refresh, revocation
//! - [`http`] - Client construction and the HTTP failure taxonomy
//! - [`registry`] - Builds a [`socialsync::providers::ProviderRegistry`] from configuration

pub mod adapters;
pub mod http;
pub mod oauth2;
pub mod platforms;
pub mod registry;

pub use registry::{build_registry, PROVIDERS};
