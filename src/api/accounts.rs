//! Social account endpoints: provider discovery, OAuth connect/callback,
//! listing, disconnect and analytics.

use super::{caller, AppError, AppState};
use crate::oauth::AuthorizationRequest;
use crate::providers::{AnalyticsPoint, ProviderMetadata};
use crate::vault::Integration;
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Days of analytics returned when the caller does not say
const DEFAULT_ANALYTICS_DAYS: u32 = 30;

#[derive(Serialize)]
pub struct ListProvidersResponse {
    pub providers: Vec<ProviderMetadata>,
}

#[derive(Serialize)]
pub struct ListAccountsResponse {
    pub integrations: Vec<Integration>,
}

/// OAuth callback query parameters
#[derive(Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Serialize)]
pub struct ConnectedResponse {
    pub success: bool,
    pub integration: Integration,
}

#[derive(Serialize)]
pub struct DisconnectResponse {
    pub success: bool,
}

#[derive(Deserialize)]
pub struct AnalyticsQuery {
    days: Option<u32>,
}

#[derive(Serialize)]
pub struct AnalyticsResponse {
    pub integration_id: String,
    pub days: u32,
    pub points: Vec<AnalyticsPoint>,
}

/// Create social account router
pub fn create_accounts_router(state: AppState) -> Router {
    Router::new()
        .route("/social-accounts", get(list_accounts))
        .route("/social-accounts/providers", get(list_providers))
        .route("/social-accounts/connect/:provider", post(connect))
        .route("/social-accounts/callback/:provider", get(callback))
        .route("/social-accounts/:id", delete(disconnect))
        .route("/social-accounts/:id/analytics", get(analytics))
        .with_state(state)
}

/// GET /social-accounts/providers - enabled providers and their scopes
async fn list_providers(State(state): State<AppState>) -> Json<ListProvidersResponse> {
    Json(ListProvidersResponse {
        providers: state.registry.list_enabled(),
    })
}

/// GET /social-accounts - the caller's connected accounts (no secrets)
async fn list_accounts(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ListAccountsResponse>, AppError> {
    let user_id = caller(&headers)?;
    let integrations = state.vault.list(&user_id)?;
    debug!(user_id = %user_id, count = integrations.len(), "Listing social accounts");
    Ok(Json(ListAccountsResponse { integrations }))
}

/// POST /social-accounts/connect/:provider
///
/// Starts an OAuth attempt and returns the URL to send the user to. The
/// `state` in the response is also embedded in the URL.
async fn connect(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Result<Json<AuthorizationRequest>, AppError> {
    let user_id = caller(&headers)?;
    let request = state.orchestrator.initiate(&user_id, &provider)?;
    Ok(Json(request))
}

/// GET /social-accounts/callback/:provider
///
/// Platform redirect target. The user is identified by the OAuth session,
/// not by a header: the browser arrives here straight from the platform.
async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(callback): Query<OAuthCallback>,
) -> Result<Json<ConnectedResponse>, AppError> {
    if let Some(error) = callback.error {
        let description = callback
            .error_description
            .unwrap_or_else(|| "Unknown error".to_string());
        let err = state.orchestrator.abort(
            &provider,
            callback.state.as_deref(),
            &format!("{} - {}", error, description),
        );
        return Err(AppError::BadRequest(err.to_string()));
    }

    let code = callback
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing authorization code".to_string()))?;
    let oauth_state = callback
        .state
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing state parameter".to_string()))?;

    let integration = state
        .orchestrator
        .complete(&provider, &code, &oauth_state)
        .await?;

    Ok(Json(ConnectedResponse {
        success: true,
        integration,
    }))
}

/// DELETE /social-accounts/:id - revoke (best effort) and soft delete
async fn disconnect(
    State(state): State<AppState>,
    Path(integration_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DisconnectResponse>, AppError> {
    let user_id = caller(&headers)?;
    state
        .orchestrator
        .disconnect(&user_id, &integration_id)
        .await?;
    info!(user_id = %user_id, integration_id = %integration_id, "Disconnect request completed");
    Ok(Json(DisconnectResponse { success: true }))
}

/// GET /social-accounts/:id/analytics?days=N
async fn analytics(
    State(state): State<AppState>,
    Path(integration_id): Path<String>,
    Query(query): Query<AnalyticsQuery>,
    headers: HeaderMap,
) -> Result<Json<AnalyticsResponse>, AppError> {
    let user_id = caller(&headers)?;
    let days = query.days.unwrap_or(DEFAULT_ANALYTICS_DAYS);
    if days == 0 {
        return Err(AppError::BadRequest("days must be positive".to_string()));
    }

    let points = state
        .coordinator
        .analytics(&user_id, &integration_id, days)
        .await?;

    Ok(Json(AnalyticsResponse {
        integration_id,
        days: days.min(crate::publishing::MAX_ANALYTICS_DAYS),
        points,
    }))
}
