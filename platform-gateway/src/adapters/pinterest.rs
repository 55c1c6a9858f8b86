//! Pinterest adapter (API v5).

use crate::http::ApiClient;
use crate::oauth2::{authorization_url, OAuth2Client};
use crate::platforms::PlatformProfile;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use socialsync::providers::{
    AccountRef, AnalyticsPoint, AnalyticsStream, ClientInfo, EditorMode, PostDetails,
    ProviderAdapter, PublishedPost, TokenSet,
};
use socialsync::AdapterError;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

const ANALYTICS_METRICS: &str = "IMPRESSION,SAVE,PIN_CLICK,OUTBOUND_CLICK";
const MAX_TITLE_CHARS: usize = 100;
const MAX_DESCRIPTION_CHARS: usize = 500;

#[derive(Deserialize)]
struct UserAccount {
    #[serde(default)]
    id: Option<String>,
    username: String,
}

#[derive(Deserialize)]
struct BoardList {
    #[serde(default)]
    items: Vec<Board>,
}

#[derive(Deserialize)]
struct Board {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Serialize)]
struct NewPin<'a> {
    board_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    link: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    alt_text: Option<&'a str>,
    media_source: MediaSource<'a>,
}

#[derive(Serialize)]
struct MediaSource<'a> {
    source_type: &'static str,
    url: &'a str,
}

#[derive(Deserialize)]
struct Pin {
    id: String,
}

#[derive(Deserialize)]
struct AccountAnalytics {
    all: AnalyticsSection,
}

#[derive(Deserialize)]
struct AnalyticsSection {
    #[serde(default)]
    daily_metrics: Vec<DailyMetrics>,
}

#[derive(Deserialize)]
struct DailyMetrics {
    date: NaiveDate,
    #[serde(default)]
    data_status: String,
    #[serde(default)]
    metrics: BTreeMap<String, serde_json::Value>,
}

impl AccountAnalytics {
    /// Days still being processed carry no metrics and are skipped.
    fn into_points(self) -> Vec<AnalyticsPoint> {
        self.all
            .daily_metrics
            .into_iter()
            .filter(|day| day.data_status.is_empty() || day.data_status == "READY")
            .flat_map(|day| {
                let date = day.date;
                day.metrics.into_iter().filter_map(move |(name, value)| {
                    Some(AnalyticsPoint {
                        metric: name.to_lowercase(),
                        date,
                        value: value.as_f64()?,
                    })
                })
            })
            .collect()
    }
}

fn clip(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

pub struct PinterestAdapter {
    profile: PlatformProfile,
    oauth: OAuth2Client,
    api: ApiClient,
}

impl PinterestAdapter {
    pub fn new(http: Client) -> Self {
        Self::with_profile(PlatformProfile::pinterest(), http)
    }

    pub fn with_profile(profile: PlatformProfile, http: Client) -> Self {
        Self {
            profile,
            oauth: OAuth2Client::new(http.clone()),
            api: ApiClient::new(http),
        }
    }

    async fn default_board(&self, token: &str) -> Option<Board> {
        let boards = self
            .api
            .get_json::<BoardList>(
                &format!("{}/v5/boards", self.profile.api_base),
                token,
                &[("page_size", "1".to_string())],
            )
            .await;
        match boards {
            Ok(list) => list.items.into_iter().next(),
            Err(e) => {
                warn!(provider = "pinterest", error = %e, "Could not list boards");
                None
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for PinterestAdapter {
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

        let user: UserAccount = self
            .api
            .get_json(
                &format!("{}/v5/user_account", self.profile.api_base),
                &tokens.access_token,
                &[],
            )
            .await
            .map_err(|e| AdapterError::AuthExchange(format!("failed to read account: {}", e)))?;

        let mut metadata = BTreeMap::from([("username".to_string(), user.username.clone())]);
        if let Some(board) = self.default_board(&tokens.access_token).await {
            metadata.insert("board_id".to_string(), board.id);
            metadata.insert("board_name".to_string(), board.name);
        }

        let internal_id = user.id.unwrap_or(user.username);
        info!(provider = "pinterest", account_id = %internal_id, "Connected Pinterest account");
        Ok(tokens.into_token_set(&self.profile, internal_id, metadata))
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
        account: &AccountRef,
        access_token: &str,
        details: &PostDetails,
    ) -> Result<PublishedPost, AdapterError> {
        let board_id = details
            .setting_str("board_id")
            .or_else(|| account.metadata.get("board_id").map(String::as_str))
            .filter(|b| !b.is_empty())
            .ok_or_else(|| {
                AdapterError::PlatformRejected("Pinterest pins need a board_id".to_string())
            })?;
        let image = details.media.iter().find(|m| !m.is_video()).ok_or_else(|| {
            AdapterError::PlatformRejected("Pinterest pins require an image".to_string())
        })?;

        let pin = NewPin {
            board_id,
            title: details.title.as_deref().map(|t| clip(t, MAX_TITLE_CHARS)),
            description: clip(&details.text, MAX_DESCRIPTION_CHARS),
            link: details.link.as_deref().filter(|l| !l.is_empty()),
            alt_text: image.alt_text.as_deref(),
            media_source: MediaSource {
                source_type: "image_url",
                url: &image.url,
            },
        };
        let created: Pin = self
            .api
            .post_json(&format!("{}/v5/pins", self.profile.api_base), access_token, &pin)
            .await?;

        Ok(PublishedPost {
            platform_url: format!("https://www.pinterest.com/pin/{}/", created.id),
            platform_post_id: created.id,
        })
    }

    fn analytics(&self, _account: &AccountRef, access_token: &str, days_back: u32) -> AnalyticsStream {
        let api = self.api.clone();
        let url = format!("{}/v5/user_account/analytics", self.profile.analytics_base);
        let token = access_token.to_string();
        let (start, end) = super::date_range(days_back);

        super::paged((), move |()| {
            let api = api.clone();
            let url = url.clone();
            let token = token.clone();
            let query = [
                ("start_date", start.to_string()),
                ("end_date", end.to_string()),
                ("metric_types", ANALYTICS_METRICS.to_string()),
            ];
            async move {
                let report: AccountAnalytics = api.get_json(&url, &token, &query).await?;
                Ok((report.into_points(), None))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use mockito::{Matcher, Server};
    use socialsync::providers::MediaRef;

    fn client() -> ClientInfo {
        ClientInfo {
            client_id: "pin-app".to_string(),
            client_secret: "pin-secret".to_string(),
            redirect_uri: "https://app.example.com/social-accounts/callback/pinterest".to_string(),
        }
    }

    fn account(board: Option<&str>) -> AccountRef {
        let mut metadata = BTreeMap::new();
        if let Some(board) = board {
            metadata.insert("board_id".to_string(), board.to_string());
        }
        AccountRef {
            integration_id: "int-1".to_string(),
            internal_id: "pin-user".to_string(),
            metadata,
        }
    }

    fn details() -> PostDetails {
        PostDetails {
            text: "Spring palette".to_string(),
            title: Some("Palette".to_string()),
            link: Some("https://shop.example.com/palette".to_string()),
            media: vec![MediaRef {
                url: "https://cdn.example.com/palette.jpg".to_string(),
                mime_type: Some("image/jpeg".to_string()),
                alt_text: Some("Swatches".to_string()),
            }],
            settings: Default::default(),
            idempotency_key: "k".to_string(),
        }
    }

    fn adapter(server: &Server) -> PinterestAdapter {
        PinterestAdapter::with_profile(
            PlatformProfile::pinterest().pointed_at(&server.url()),
            Client::new(),
        )
    }

    #[tokio::test]
    async fn test_authenticate_records_default_board() {
        let mut server = Server::new_async().await;
        let token = server
            .mock("POST", "/v5/oauth/token")
            .match_header("authorization", Matcher::Regex("^Basic ".into()))
            .match_body(Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()))
            .with_status(200)
            .with_body(r#"{"access_token":"pina_at","refresh_token":"pinr_rt","expires_in":2592000,"scope":"boards:read,pins:write"}"#)
            .create_async()
            .await;
        let _user = server
            .mock("GET", "/v5/user_account")
            .with_status(200)
            .with_body(r#"{"account_type":"BUSINESS","id":"5551","username":"studio"}"#)
            .create_async()
            .await;
        let _boards = server
            .mock("GET", "/v5/boards")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"items":[{"id":"b-77","name":"Ideas"}],"bookmark":null}"#)
            .create_async()
            .await;

        let tokens = adapter(&server)
            .authenticate("code", "", &client())
            .await
            .unwrap();
        token.assert_async().await;
        assert_eq!(tokens.internal_id, "5551");
        assert_eq!(tokens.metadata["board_id"], "b-77");
        assert!(tokens.scopes.contains("pins:write"));
    }

    #[tokio::test]
    async fn test_authenticate_survives_board_listing_failure() {
        let mut server = Server::new_async().await;
        let _token = server
            .mock("POST", "/v5/oauth/token")
            .with_status(200)
            .with_body(r#"{"access_token":"pina_at"}"#)
            .create_async()
            .await;
        let _user = server
            .mock("GET", "/v5/user_account")
            .with_status(200)
            .with_body(r#"{"username":"studio"}"#)
            .create_async()
            .await;
        let _boards = server
            .mock("GET", "/v5/boards")
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let tokens = adapter(&server)
            .authenticate("code", "", &client())
            .await
            .unwrap();
        assert_eq!(tokens.internal_id, "studio");
        assert!(!tokens.metadata.contains_key("board_id"));
    }

    #[tokio::test]
    async fn test_post_creates_pin_on_metadata_board() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v5/pins")
            .match_header("authorization", "Bearer pina_at")
            .match_body(Matcher::Json(serde_json::json!({
                "board_id": "b-77",
                "title": "Palette",
                "description": "Spring palette",
                "link": "https://shop.example.com/palette",
                "alt_text": "Swatches",
                "media_source": {
                    "source_type": "image_url",
                    "url": "https://cdn.example.com/palette.jpg"
                }
            })))
            .with_status(201)
            .with_body(r#"{"id":"813"}"#)
            .create_async()
            .await;

        let post = adapter(&server)
            .post(&account(Some("b-77")), "pina_at", &details())
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(post.platform_url, "https://www.pinterest.com/pin/813/");
    }

    #[tokio::test]
    async fn test_post_board_setting_overrides_metadata() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v5/pins")
            .match_body(Matcher::PartialJson(serde_json::json!({ "board_id": "b-override" })))
            .with_status(201)
            .with_body(r#"{"id":"814"}"#)
            .create_async()
            .await;

        let mut details = details();
        details
            .settings
            .insert("board_id".to_string(), serde_json::json!("b-override"));
        adapter(&server)
            .post(&account(Some("b-77")), "pina_at", &details)
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_post_without_board_is_rejected() {
        let server = Server::new_async().await;
        let err = adapter(&server)
            .post(&account(None), "pina_at", &details())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::PlatformRejected(msg) if msg.contains("board_id")));
    }

    #[tokio::test]
    async fn test_analytics_skips_unready_days() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/v5/user_account/analytics")
            .match_query(Matcher::UrlEncoded("metric_types".into(), ANALYTICS_METRICS.into()))
            .with_status(200)
            .with_body(
                r#"{"all":{"daily_metrics":[
                    {"date":"2026-03-01","data_status":"READY","metrics":{"IMPRESSION":40,"SAVE":3}},
                    {"date":"2026-03-02","data_status":"PROCESSING","metrics":{}}
                ],"summary_metrics":{"IMPRESSION":40}}}"#,
            )
            .create_async()
            .await;

        let points: Vec<AnalyticsPoint> = adapter(&server)
            .analytics(&account(None), "pina_at", 7)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].metric, "impression");
        assert_eq!(points[0].value, 40.0);
        assert_eq!(points[1].metric, "save");
    }

    #[tokio::test]
    async fn test_refresh_revoked_grant() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/v5/oauth/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","error_description":"refresh token expired"}"#)
            .create_async()
            .await;

        let err = adapter(&server)
            .refresh_token("pinr_rt", &client())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::TokenRevoked(_)));
    }
}
