// HTTP API (social accounts, publishing, health)
pub mod api;

// Caller identity
pub mod auth;

// Configuration
pub mod config;

// Error taxonomy
pub mod error;

// OAuth authorization-code + PKCE flow
pub mod oauth;

// Provider adapter contract and registry
pub mod providers;

// Fan-out publishing and the publication ledger
pub mod publishing;

// Rate limiting, bulkheads, circuit breaking, retries
pub mod rate_limit;

// Encrypted token storage and refresh
pub mod vault;

pub use error::{AdapterError, Error, ErrorKind, Result};
