//! Facebook Graph API pieces shared by the Facebook and Instagram adapters.

use crate::http::{self, classify_status, retry_after, ApiClient, DEFAULT_RETRY_AFTER};
use crate::oauth2::{OAuth2Client, TokenResponse};
use crate::platforms::PlatformProfile;
use chrono::NaiveDate;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;
use socialsync::providers::{AnalyticsPoint, ClientInfo};
use socialsync::AdapterError;
use tracing::{debug, warn};

#[derive(Deserialize)]
struct GraphErrorEnvelope {
    error: GraphError,
}

#[derive(Deserialize)]
struct GraphError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: i64,
    #[serde(default)]
    error_subcode: Option<i64>,
}

/// Translate Graph API error codes.
///
/// - 190 → token expired, or revoked for subcodes 458 (app removed) and
///   460 (password changed)
/// - 4, 17, 32, 613 → throttled
/// - 1, 2 → temporary platform failure
pub(crate) fn graph_error(status: StatusCode, headers: &HeaderMap, body: &str) -> AdapterError {
    let Ok(envelope) = serde_json::from_str::<GraphErrorEnvelope>(body) else {
        return classify_status(status, headers, body);
    };
    let error = envelope.error;
    let message = format!("Graph error {}: {}", error.code, error.message);

    match error.code {
        190 => match error.error_subcode {
            Some(458) | Some(460) => AdapterError::TokenRevoked(message),
            _ => AdapterError::TokenExpired(message),
        },
        4 | 17 | 32 | 613 => AdapterError::RateLimited {
            retry_after: retry_after(headers).unwrap_or(DEFAULT_RETRY_AFTER),
        },
        1 | 2 => AdapterError::TransientNetwork(message),
        _ if status.is_server_error() => AdapterError::TransientNetwork(message),
        _ => AdapterError::PlatformRejected(message),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct Page {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub access_token: String,
    #[serde(default)]
    pub instagram_business_account: Option<InstagramAccount>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct InstagramAccount {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Deserialize)]
struct PageList {
    data: Vec<Page>,
}

/// Exchange the code, upgrade to a long-lived user token and list the pages
/// it manages. Page tokens derived from a long-lived user token do not expire.
pub(crate) async fn login(
    oauth: &OAuth2Client,
    api: &ApiClient,
    profile: &PlatformProfile,
    client: &ClientInfo,
    code: &str,
) -> Result<(TokenResponse, Vec<Page>), AdapterError> {
    let short_lived = oauth.exchange_code(profile, client, code, "").await?;
    let user_token = match long_lived(api, profile, client, &short_lived.access_token).await {
        Ok(token) => token,
        Err(e) => {
            warn!(provider = profile.identifier, error = %e, "Long-lived token exchange failed, keeping short-lived token");
            short_lived.access_token.clone()
        }
    };

    let pages: PageList = api
        .get_json(
            &format!("{}/me/accounts", profile.api_base),
            &user_token,
            &[(
                "fields",
                "id,name,access_token,instagram_business_account{id,username}".to_string(),
            )],
        )
        .await
        .map_err(|e| AdapterError::AuthExchange(format!("failed to list pages: {}", e)))?;

    debug!(provider = profile.identifier, pages = pages.data.len(), "Listed managed pages");
    Ok((short_lived, pages.data))
}

async fn long_lived(
    api: &ApiClient,
    profile: &PlatformProfile,
    client: &ClientInfo,
    token: &str,
) -> Result<String, AdapterError> {
    let request = api.client().post(&profile.token_url).form(&[
        ("grant_type", "fb_exchange_token"),
        ("client_id", client.client_id.as_str()),
        ("client_secret", client.client_secret.as_str()),
        ("fb_exchange_token", token),
    ]);
    let response: TokenResponse = http::decode(http::send(request, graph_error).await?).await?;
    if response.access_token.is_empty() {
        return Err(AdapterError::AuthExchange(
            "long-lived token response missing access_token".to_string(),
        ));
    }
    Ok(response.access_token)
}

#[derive(Deserialize)]
struct InsightsResponse {
    data: Vec<Insight>,
}

#[derive(Deserialize)]
struct Insight {
    name: String,
    #[serde(default)]
    values: Vec<InsightValue>,
}

#[derive(Deserialize)]
struct InsightValue {
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    end_time: Option<String>,
}

/// Fetch one insights report for `object_id` over [since, until].
///
/// Graph insights paging walks adjacent date windows indefinitely, so only
/// the requested window is read. Non-numeric values (breakdowns) are skipped.
pub(crate) async fn insights(
    api: ApiClient,
    base: String,
    object_id: String,
    token: String,
    metrics: &'static str,
    since: NaiveDate,
    until: NaiveDate,
) -> Result<Vec<AnalyticsPoint>, AdapterError> {
    let report: InsightsResponse = api
        .get_json(
            &format!("{}/{}/insights", base, object_id),
            &token,
            &[
                ("metric", metrics.to_string()),
                ("period", "day".to_string()),
                ("since", since.to_string()),
                ("until", until.to_string()),
            ],
        )
        .await?;

    let mut points = Vec::new();
    for insight in report.data {
        for value in insight.values {
            let (Some(number), Some(date)) = (
                value.value.as_f64(),
                value.end_time.as_deref().and_then(parse_graph_date),
            ) else {
                continue;
            };
            points.push(AnalyticsPoint {
                metric: insight.name.clone(),
                date,
                value: number,
            });
        }
    }
    Ok(points)
}

/// Graph timestamps look like `2026-03-02T08:00:00+0000`.
fn parse_graph_date(timestamp: &str) -> Option<NaiveDate> {
    let day = timestamp.get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

#[derive(Deserialize)]
pub(crate) struct IdResponse {
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_error_codes() {
        let headers = HeaderMap::new();
        let body = |code: i64, subcode: Option<i64>| {
            serde_json::json!({
                "error": { "message": "msg", "type": "OAuthException", "code": code, "error_subcode": subcode }
            })
            .to_string()
        };

        assert!(matches!(
            graph_error(StatusCode::BAD_REQUEST, &headers, &body(190, Some(463))),
            AdapterError::TokenExpired(_)
        ));
        assert!(matches!(
            graph_error(StatusCode::BAD_REQUEST, &headers, &body(190, Some(460))),
            AdapterError::TokenRevoked(_)
        ));
        assert!(matches!(
            graph_error(StatusCode::BAD_REQUEST, &headers, &body(32, None)),
            AdapterError::RateLimited { .. }
        ));
        assert!(matches!(
            graph_error(StatusCode::BAD_REQUEST, &headers, &body(2, None)),
            AdapterError::TransientNetwork(_)
        ));
        assert!(matches!(
            graph_error(StatusCode::BAD_REQUEST, &headers, &body(368, None)),
            AdapterError::PlatformRejected(_)
        ));
    }

    #[test]
    fn test_graph_error_falls_back_to_status() {
        assert!(matches!(
            graph_error(StatusCode::BAD_GATEWAY, &HeaderMap::new(), "<html>"),
            AdapterError::TransientNetwork(_)
        ));
    }

    #[test]
    fn test_parse_graph_date() {
        assert_eq!(
            parse_graph_date("2026-03-02T08:00:00+0000"),
            NaiveDate::from_ymd_opt(2026, 3, 2)
        );
        assert_eq!(parse_graph_date("garbage"), None);
    }
}
