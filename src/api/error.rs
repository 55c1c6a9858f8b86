use crate::auth::IdentityError;
use crate::error::{AdapterError, Error, ErrorKind};
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::time::Duration;
use tracing::error;

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<ErrorKind>,
}

/// Application error types for the HTTP endpoints
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    Domain(Error),
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError::Domain(err)
    }
}

impl From<IdentityError> for AppError {
    fn from(err: IdentityError) -> Self {
        AppError::Unauthorized(err.to_string())
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidState(_) => StatusCode::UNAUTHORIZED,
        Error::NotFound(_) | Error::ProviderNotFound(_) => StatusCode::NOT_FOUND,
        Error::ReauthRequired(_) => StatusCode::CONFLICT,
        Error::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        Error::ConcurrencyExceeded(_) | Error::CircuitOpen { .. } | Error::RefreshUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Error::Configuration(_) | Error::DuplicateProvider(_) | Error::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        Error::Adapter(adapter) => match adapter {
            AdapterError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AdapterError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AdapterError::TokenExpired(_) | AdapterError::TokenRevoked(_) => StatusCode::CONFLICT,
            AdapterError::PlatformRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AdapterError::AuthExchange(_) | AdapterError::TransientNetwork(_) => {
                StatusCode::BAD_GATEWAY
            }
        },
    }
}

/// Whole seconds, rounded up, never zero
fn retry_after_header(delay: Duration) -> HeaderValue {
    let secs = delay.as_millis().div_ceil(1000).max(1);
    HeaderValue::from(secs as u64)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, kind, retry_after) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None, None),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg, None, None),
            AppError::Domain(err) => {
                let status = status_for(&err);
                let message = match &err {
                    Error::Storage(e) => {
                        error!(error = %e, "Storage failure while handling request");
                        "Internal storage error".to_string()
                    }
                    other => other.to_string(),
                };
                (status, message, Some(err.kind()), err.retry_after())
            }
        };

        let body = Json(ErrorResponse {
            error: error_message,
            kind,
        });

        let mut response = (status, body).into_response();
        if let Some(delay) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, retry_after_header(delay));
        }
        response
    }
}
