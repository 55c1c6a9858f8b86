//! Shared HTTP plumbing: client construction, status classification and
//! JSON request helpers used by every adapter.

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use socialsync::AdapterError;
use std::time::Duration;
use tracing::debug;

/// Wait applied to a 429 that carries no usable hint
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Connect timeout for every platform call
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest platform error body carried into an error message
const MAX_ERROR_BODY: usize = 300;

/// Maps a non-success response onto the adapter failure taxonomy.
pub type ErrorMapper = fn(StatusCode, &HeaderMap, &str) -> AdapterError;

/// Build the client shared by all adapters.
///
/// Redirects are not followed: platform APIs never need them and following
/// them would let a crafted response point the service at internal hosts.
pub fn build_client(timeout: Duration) -> Result<Client, AdapterError> {
    Client::builder()
        .user_agent(concat!("socialsync-gateway/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| AdapterError::Configuration(format!("failed to build HTTP client: {}", e)))
}

/// Classify a non-success response.
///
/// - 429 → `RateLimited` (Retry-After, else x-rate-limit-reset, else 60s)
/// - 401 → `TokenExpired`
/// - 5xx → `TransientNetwork`
/// - other 4xx → `PlatformRejected`
pub fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> AdapterError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => AdapterError::RateLimited {
            retry_after: retry_after(headers).unwrap_or(DEFAULT_RETRY_AFTER),
        },
        StatusCode::UNAUTHORIZED => {
            AdapterError::TokenExpired(format!("platform answered 401: {}", truncate(body)))
        }
        s if s.is_server_error() => {
            AdapterError::TransientNetwork(format!("platform answered {}", s))
        }
        s => AdapterError::PlatformRejected(format!("platform answered {}: {}", s, truncate(body))),
    }
}

/// Delay hint from `Retry-After` (seconds) or `x-rate-limit-reset` (epoch seconds).
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(secs) =
        header_str(headers, RETRY_AFTER.as_str()).and_then(|v| v.trim().parse::<u64>().ok())
    {
        return Some(Duration::from_secs(secs.max(1)));
    }

    let reset =
        header_str(headers, "x-rate-limit-reset").and_then(|v| v.trim().parse::<i64>().ok())?;
    let wait = reset - chrono::Utc::now().timestamp();
    Some(Duration::from_secs(wait.max(1) as u64))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Transport failures (connect, TLS, timeout, truncated body) are transient.
pub fn transport_error(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::TransientNetwork("request timed out".to_string())
    } else {
        AdapterError::TransientNetwork(format!("request failed: {}", err.without_url()))
    }
}

/// Platform error bodies can be large HTML pages; keep messages short.
pub fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Send a request, map transport failures and reject non-success statuses.
pub async fn send(request: RequestBuilder, map_error: ErrorMapper) -> Result<Response, AdapterError> {
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let headers = response.headers().clone();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read body>".to_string());
    debug!(status = %status, "Platform call failed");
    Err(map_error(status, &headers, &body))
}

/// Decode a success body. A body that does not match the expected shape is a
/// terminal rejection: the call may already have taken effect, so it must not
/// be retried.
pub async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, AdapterError> {
    let body = response.text().await.map_err(transport_error)?;
    serde_json::from_str(&body).map_err(|e| {
        AdapterError::PlatformRejected(format!("unexpected platform response: {}", e))
    })
}

/// Bearer-authenticated JSON calls against one platform API.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    map_error: ErrorMapper,
}

impl ApiClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            map_error: classify_status,
        }
    }

    /// Use a platform-specific error mapper instead of plain status classification.
    pub fn with_error_mapper(mut self, map_error: ErrorMapper) -> Self {
        self.map_error = map_error;
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn map_error(&self) -> ErrorMapper {
        self.map_error
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        token: &str,
        query: &[(&str, String)],
    ) -> Result<T, AdapterError> {
        let request = self.client.get(url).bearer_auth(token).query(query);
        decode(send(request, self.map_error).await?).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        url: &str,
        token: &str,
        body: &B,
    ) -> Result<T, AdapterError> {
        let request = self.client.post(url).bearer_auth(token).json(body);
        decode(send(request, self.map_error).await?).await
    }

    pub async fn post_form<T: DeserializeOwned>(
        &self,
        url: &str,
        token: &str,
        form: &[(&str, String)],
    ) -> Result<T, AdapterError> {
        let request = self.client.post(url).bearer_auth(token).form(form);
        decode(send(request, self.map_error).await?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_429_uses_retry_after() {
        let err = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            &headers(&[("retry-after", "17")]),
            "",
        );
        assert_eq!(
            err,
            AdapterError::RateLimited {
                retry_after: Duration::from_secs(17)
            }
        );
    }

    #[test]
    fn test_429_uses_reset_epoch() {
        let reset = (chrono::Utc::now().timestamp() + 120).to_string();
        let err = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            &headers(&[("x-rate-limit-reset", reset.as_str())]),
            "",
        );
        match err {
            AdapterError::RateLimited { retry_after } => {
                assert!(retry_after > Duration::from_secs(100));
                assert!(retry_after <= Duration::from_secs(120));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_429_without_hint_defaults() {
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), "");
        assert_eq!(
            err,
            AdapterError::RateLimited {
                retry_after: DEFAULT_RETRY_AFTER
            }
        );
    }

    #[test]
    fn test_status_classes() {
        let empty = HeaderMap::new();
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, &empty, ""),
            AdapterError::TokenExpired(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, &empty, ""),
            AdapterError::TransientNetwork(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, &empty, "duplicate content"),
            AdapterError::PlatformRejected(msg) if msg.contains("duplicate content")
        ));
    }

    #[test]
    fn test_truncate_long_body() {
        let body = "x".repeat(1000);
        assert_eq!(truncate(&body).len(), MAX_ERROR_BODY);
        assert_eq!(truncate("short"), "short");
    }
}
