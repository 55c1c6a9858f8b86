//! YouTube adapter: resumable uploads and YouTube Analytics reports.

use crate::http::{self, classify_status, retry_after, transport_error, ApiClient, DEFAULT_RETRY_AFTER};
use crate::oauth2::{authorization_url, OAuth2Client};
use crate::platforms::PlatformProfile;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, CONTENT_TYPE, LOCATION};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use socialsync::providers::{
    AccountRef, AnalyticsPoint, AnalyticsStream, ClientInfo, EditorMode, PostDetails,
    ProviderAdapter, PublishedPost, TokenSet,
};
use socialsync::AdapterError;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

const REPORT_METRICS: &str = "views,likes,comments,subscribersGained";
const MAX_TITLE_CHARS: usize = 100;
const PRIVACY_STATUSES: &[&str] = &["public", "unlisted", "private"];

#[derive(Deserialize)]
struct GoogleErrorEnvelope {
    error: GoogleError,
}

#[derive(Deserialize)]
struct GoogleError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<GoogleErrorDetail>,
}

#[derive(Deserialize)]
struct GoogleErrorDetail {
    #[serde(default)]
    reason: String,
}

/// Google reports quota exhaustion as 403 with a reason code.
fn google_error(status: StatusCode, headers: &HeaderMap, body: &str) -> AdapterError {
    let Ok(envelope) = serde_json::from_str::<GoogleErrorEnvelope>(body) else {
        return classify_status(status, headers, body);
    };
    let throttled = envelope.error.errors.iter().any(|e| {
        matches!(
            e.reason.as_str(),
            "quotaExceeded" | "rateLimitExceeded" | "userRateLimitExceeded"
        )
    });
    if throttled {
        return AdapterError::RateLimited {
            retry_after: retry_after(headers).unwrap_or(DEFAULT_RETRY_AFTER),
        };
    }
    match classify_status(status, headers, body) {
        AdapterError::PlatformRejected(_) => {
            AdapterError::PlatformRejected(format!("YouTube: {}", envelope.error.message))
        }
        other => other,
    }
}

#[derive(Deserialize)]
struct ChannelList {
    #[serde(default)]
    items: Vec<Channel>,
}

#[derive(Deserialize)]
struct Channel {
    id: String,
    snippet: ChannelSnippet,
}

#[derive(Deserialize)]
struct ChannelSnippet {
    #[serde(default)]
    title: String,
    #[serde(default, rename = "customUrl")]
    custom_url: Option<String>,
}

#[derive(Serialize)]
struct VideoInsert<'a> {
    snippet: VideoSnippet<'a>,
    status: VideoStatus<'a>,
}

#[derive(Serialize)]
struct VideoSnippet<'a> {
    title: String,
    description: String,
    #[serde(rename = "categoryId", skip_serializing_if = "Option::is_none")]
    category_id: Option<&'a str>,
}

#[derive(Serialize)]
struct VideoStatus<'a> {
    #[serde(rename = "privacyStatus")]
    privacy_status: &'a str,
}

#[derive(Deserialize)]
struct Video {
    id: String,
}

#[derive(Deserialize)]
struct Report {
    #[serde(default, rename = "columnHeaders")]
    column_headers: Vec<ColumnHeader>,
    #[serde(default)]
    rows: Vec<Vec<serde_json::Value>>,
}

#[derive(Deserialize)]
struct ColumnHeader {
    name: String,
}

impl Report {
    /// One point per (day, metric) cell.
    fn into_points(self) -> Vec<AnalyticsPoint> {
        let Some(day_column) = self.column_headers.iter().position(|h| h.name == "day") else {
            return Vec::new();
        };

        let mut points = Vec::new();
        for row in &self.rows {
            let Some(date) = row
                .get(day_column)
                .and_then(|v| v.as_str())
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            else {
                continue;
            };
            for (idx, header) in self.column_headers.iter().enumerate() {
                if idx == day_column {
                    continue;
                }
                if let Some(value) = row.get(idx).and_then(|v| v.as_f64()) {
                    points.push(AnalyticsPoint {
                        metric: header.name.clone(),
                        date,
                        value,
                    });
                }
            }
        }
        points
    }
}

pub struct YouTubeAdapter {
    profile: PlatformProfile,
    oauth: OAuth2Client,
    api: ApiClient,
}

impl YouTubeAdapter {
    pub fn new(http: Client) -> Self {
        Self::with_profile(PlatformProfile::youtube(), http)
    }

    pub fn with_profile(profile: PlatformProfile, http: Client) -> Self {
        Self {
            profile,
            oauth: OAuth2Client::new(http.clone()),
            api: ApiClient::new(http).with_error_mapper(google_error),
        }
    }

    /// Open a resumable upload session and return its upload URL.
    async fn start_upload(
        &self,
        token: &str,
        mime_type: &str,
        length: usize,
        metadata: &VideoInsert<'_>,
    ) -> Result<String, AdapterError> {
        let request = self
            .api
            .client()
            .post(format!("{}/upload/youtube/v3/videos", self.profile.api_base))
            .bearer_auth(token)
            .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
            .header("X-Upload-Content-Type", mime_type)
            .header("X-Upload-Content-Length", length.to_string())
            .json(metadata);
        let response = http::send(request, self.api.map_error()).await?;

        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                AdapterError::PlatformRejected("upload session response had no Location".to_string())
            })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, AdapterError> {
        let response = http::send(self.api.client().get(url), classify_status)
            .await
            .map_err(|e| match e {
                AdapterError::PlatformRejected(msg) => {
                    AdapterError::PlatformRejected(format!("media not retrievable: {}", msg))
                }
                other => other,
            })?;
        let bytes = response.bytes().await.map_err(transport_error)?;
        Ok(bytes.to_vec())
    }
}

fn video_title(details: &PostDetails) -> String {
    let source = details
        .title
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or(details.text.as_str());
    let first_line = source.lines().next().unwrap_or_default().trim();
    first_line.chars().take(MAX_TITLE_CHARS).collect()
}

#[async_trait]
impl ProviderAdapter for YouTubeAdapter {
    fn identifier(&self) -> &str {
        self.profile.identifier
    }

    fn display_name(&self) -> &str {
        self.profile.display_name
    }

    fn required_scopes(&self) -> BTreeSet<String> {
        self.profile.scopes.iter().map(|s| s.to_string()).collect()
    }

    fn editor_mode(&self) -> EditorMode {
        self.profile.editor_mode
    }

    fn generate_auth_url(
        &self,
        client: &ClientInfo,
        state: &str,
        code_challenge: &str,
    ) -> Result<String, AdapterError> {
        authorization_url(&self.profile, client, state, code_challenge)
    }

    async fn authenticate(
        &self,
        code: &str,
        code_verifier: &str,
        client: &ClientInfo,
    ) -> Result<TokenSet, AdapterError> {
        let tokens = self
            .oauth
            .exchange_code(&self.profile, client, code, code_verifier)
            .await?;

        let channels: ChannelList = self
            .api
            .get_json(
                &format!("{}/youtube/v3/channels", self.profile.api_base),
                &tokens.access_token,
                &[("part", "snippet".to_string()), ("mine", "true".to_string())],
            )
            .await
            .map_err(|e| AdapterError::AuthExchange(format!("failed to read channel: {}", e)))?;
        let channel = channels.items.into_iter().next().ok_or_else(|| {
            AdapterError::AuthExchange("the Google account has no YouTube channel".to_string())
        })?;

        info!(provider = "youtube", channel_id = %channel.id, "Connected YouTube channel");
        let mut metadata = BTreeMap::from([("name".to_string(), channel.snippet.title)]);
        if let Some(handle) = channel.snippet.custom_url {
            metadata.insert("username".to_string(), handle);
        }
        Ok(tokens.into_token_set(&self.profile, channel.id, metadata))
    }

    async fn refresh_token(
        &self,
        refresh_token: &str,
        client: &ClientInfo,
    ) -> Result<TokenSet, AdapterError> {
        let tokens = self.oauth.refresh(&self.profile, client, refresh_token).await?;
        Ok(tokens.into_token_set(&self.profile, String::new(), BTreeMap::new()))
    }

    async fn post(
        &self,
        _account: &AccountRef,
        access_token: &str,
        details: &PostDetails,
    ) -> Result<PublishedPost, AdapterError> {
        let media = details.media.iter().find(|m| m.is_video()).ok_or_else(|| {
            AdapterError::PlatformRejected("YouTube posts require a video".to_string())
        })?;

        let privacy_status = details.setting_str("privacy_status").unwrap_or("public");
        if !PRIVACY_STATUSES.contains(&privacy_status) {
            return Err(AdapterError::PlatformRejected(format!(
                "unsupported privacy status '{}'",
                privacy_status
            )));
        }

        let metadata = VideoInsert {
            snippet: VideoSnippet {
                title: video_title(details),
                description: super::text_with_link(&details.text, details.link.as_deref()),
                category_id: details.setting_str("category_id"),
            },
            status: VideoStatus { privacy_status },
        };

        let bytes = self.download(&media.url).await?;
        let mime_type = media.mime_type.as_deref().unwrap_or("video/*");
        debug!(size = bytes.len(), mime_type = %mime_type, "Starting resumable upload");

        let upload_url = self
            .start_upload(access_token, mime_type, bytes.len(), &metadata)
            .await?;
        let request = self
            .api
            .client()
            .put(upload_url)
            .bearer_auth(access_token)
            .header(CONTENT_TYPE, mime_type)
            .body(bytes);
        let video: Video = http::decode(http::send(request, self.api.map_error()).await?).await?;

        Ok(PublishedPost {
            platform_url: format!("https://www.youtube.com/watch?v={}", video.id),
            platform_post_id: video.id,
        })
    }

    fn analytics(&self, _account: &AccountRef, access_token: &str, days_back: u32) -> AnalyticsStream {
        let api = self.api.clone();
        let url = format!("{}/v2/reports", self.profile.analytics_base);
        let token = access_token.to_string();
        let (start, end) = super::date_range(days_back);

        super::paged((), move |()| {
            let api = api.clone();
            let url = url.clone();
            let token = token.clone();
            let query = [
                ("ids", "channel==MINE".to_string()),
                ("startDate", start.to_string()),
                ("endDate", end.to_string()),
                ("metrics", REPORT_METRICS.to_string()),
                ("dimensions", "day".to_string()),
                ("sort", "day".to_string()),
            ];
            async move {
                let report: Report = api.get_json(&url, &token, &query).await?;
                Ok((report.into_points(), None))
            }
        })
    }

    async fn revoke(&self, access_token: &str, client: &ClientInfo) -> Result<(), AdapterError> {
        self.oauth.revoke(&self.profile, client, access_token).await
    }
}
