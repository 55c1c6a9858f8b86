use super::AppState;
use axum::{extract::State, response::Json, routing::get, Router};
use chrono::Utc;
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Serialize)]
pub struct ProviderHealth {
    pub identifier: String,
    pub circuit_open: bool,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: i64,
    pub oauth_sessions: usize,
    pub providers: Vec<ProviderHealth>,
}

pub fn create_health_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/status", get(status))
        .route("/health/ping", get(ping))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /health/status - liveness plus per-provider circuit state
async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let providers: Vec<ProviderHealth> = state
        .registry
        .list_enabled()
        .into_iter()
        .map(|p| ProviderHealth {
            circuit_open: state.policy.breaker().is_open(&p.identifier),
            identifier: p.identifier,
        })
        .collect();

    let degraded = providers.iter().any(|p| p.circuit_open);
    Json(StatusResponse {
        status: if degraded { "degraded" } else { "healthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        oauth_sessions: state.orchestrator.sessions().count(),
        providers,
    })
}

async fn ping() -> &'static str {
    "pong"
}
