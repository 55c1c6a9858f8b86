//! Publishing endpoints.

use super::{caller, AppError, AppState};
use crate::publishing::{PublicationRecord, PublishRequest, TargetResult};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;

/// Upper bound on targets in one request
const MAX_TARGETS: usize = 50;

#[derive(Serialize)]
pub struct PublishResponse {
    pub post_id: String,
    pub results: Vec<TargetResult>,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub post_id: String,
    pub cancelled: bool,
}

#[derive(Serialize)]
pub struct PublicationsResponse {
    pub post_id: String,
    pub publications: Vec<PublicationRecord>,
}

/// Create publishing router
pub fn create_publish_router(state: AppState) -> Router {
    Router::new()
        .route("/posts/:id/publish", post(publish))
        .route("/posts/:id/cancel", post(cancel))
        .route("/posts/:id/publications", get(publications))
        .with_state(state)
}

/// POST /posts/:id/publish
///
/// Always answers 200 with one result per target once the request itself
/// is valid; per-target failures live in the results.
async fn publish(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, AppError> {
    let user_id = caller(&headers)?;

    if request.targets.is_empty() {
        return Err(AppError::BadRequest(
            "At least one target is required".to_string(),
        ));
    }
    if request.targets.len() > MAX_TARGETS {
        return Err(AppError::BadRequest(format!(
            "At most {} targets per request",
            MAX_TARGETS
        )));
    }
    if request.text.trim().is_empty() && request.media.is_empty() {
        return Err(AppError::BadRequest(
            "Post has neither text nor media".to_string(),
        ));
    }

    let results = state.coordinator.publish(&user_id, &post_id, &request).await;
    Ok(Json(PublishResponse { post_id, results }))
}

/// POST /posts/:id/cancel
async fn cancel(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<CancelResponse>, AppError> {
    let user_id = caller(&headers)?;
    let cancelled = state.coordinator.cancel(&user_id, &post_id);
    Ok(Json(CancelResponse { post_id, cancelled }))
}

/// GET /posts/:id/publications
async fn publications(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PublicationsResponse>, AppError> {
    let user_id = caller(&headers)?;
    let publications = state.coordinator.publications(&user_id, &post_id)?;
    Ok(Json(PublicationsResponse {
        post_id,
        publications,
    }))
}
