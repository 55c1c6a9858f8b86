//! Twitter / X adapter (API v2).

use super::paged;
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
use tracing::{debug, info};

/// Largest page the timeline endpoint returns
const TIMELINE_PAGE_SIZE: u32 = 100;

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct User {
    id: String,
    #[serde(default)]
    name: String,
    username: String,
}

#[derive(Serialize)]
struct NewTweet<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct CreatedTweet {
    id: String,
}

#[derive(Deserialize)]
struct Timeline {
    #[serde(default)]
    data: Vec<Tweet>,
    #[serde(default)]
    meta: TimelineMeta,
}

#[derive(Deserialize, Default)]
struct TimelineMeta {
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Deserialize)]
struct Tweet {
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    public_metrics: Option<PublicMetrics>,
}

#[derive(Deserialize)]
struct PublicMetrics {
    #[serde(default)]
    retweet_count: u64,
    #[serde(default)]
    reply_count: u64,
    #[serde(default)]
    like_count: u64,
    #[serde(default)]
    quote_count: u64,
    #[serde(default)]
    impression_count: u64,
}

impl PublicMetrics {
    fn pairs(&self) -> [(&'static str, u64); 5] {
        [
            ("impressions", self.impression_count),
            ("likes", self.like_count),
            ("replies", self.reply_count),
            ("retweets", self.retweet_count),
            ("quotes", self.quote_count),
        ]
    }
}

pub struct TwitterAdapter {
    profile: PlatformProfile,
    oauth: OAuth2Client,
    api: ApiClient,
}

impl TwitterAdapter {
    pub fn new(http: Client) -> Self {
        Self::with_profile(PlatformProfile::twitter(), http)
    }

    pub fn with_profile(profile: PlatformProfile, http: Client) -> Self {
        Self {
            profile,
            oauth: OAuth2Client::new(http.clone()),
            api: ApiClient::new(http),
        }
    }
}

/// Public metrics summed per day across every timeline page.
#[derive(Default)]
struct DailyTotals(BTreeMap<(NaiveDate, &'static str), f64>);

impl DailyTotals {
    fn add(&mut self, tweets: Vec<Tweet>) {
        for tweet in tweets {
            let date = tweet
                .created_at
                .as_deref()
                .and_then(|ts| ts.get(..10))
                .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok());
            let (Some(date), Some(metrics)) = (date, tweet.public_metrics) else {
                continue;
            };
            for (metric, value) in metrics.pairs() {
                *self.0.entry((date, metric)).or_default() += value as f64;
            }
        }
    }

    fn into_points(self) -> Vec<AnalyticsPoint> {
        self.0
            .into_iter()
            .map(|((date, metric), value)| AnalyticsPoint {
                metric: metric.to_string(),
                date,
                value,
            })
            .collect()
    }
}

/// Next page token plus the totals gathered so far. A day can span pages,
/// so points are only emitted after the last page.
#[derive(Default)]
struct TimelineCursor {
    token: Option<String>,
    totals: DailyTotals,
}

#[async_trait]
impl ProviderAdapter for TwitterAdapter {
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

        let me: Envelope<User> = self
            .api
            .get_json(
                &format!("{}/2/users/me", self.profile.api_base),
                &tokens.access_token,
                &[],
            )
            .await
            .map_err(|e| AdapterError::AuthExchange(format!("failed to read profile: {}", e)))?;

        info!(provider = "twitter", user_id = %me.data.id, "Connected X account");
        let metadata = BTreeMap::from([
            ("username".to_string(), me.data.username),
            ("name".to_string(), me.data.name),
        ]);
        Ok(tokens.into_token_set(&self.profile, me.data.id, metadata))
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
        // Media is linked rather than uploaded; the v2 endpoint only accepts
        // ids from the separate upload API
        let mut text = super::text_with_link(&details.text, details.link.as_deref());
        for media in &details.media {
            if !text.contains(&media.url) {
                text.push('\n');
                text.push_str(&media.url);
            }
        }

        let created: Envelope<CreatedTweet> = self
            .api
            .post_json(
                &format!("{}/2/tweets", self.profile.api_base),
                access_token,
                &NewTweet { text: &text },
            )
            .await?;

        let handle = account
            .metadata
            .get("username")
            .map(String::as_str)
            .unwrap_or("i/web");
        Ok(PublishedPost {
            platform_url: format!("https://x.com/{}/status/{}", handle, created.data.id),
            platform_post_id: created.data.id,
        })
    }

    fn analytics(&self, account: &AccountRef, access_token: &str, days_back: u32) -> AnalyticsStream {
        let api = self.api.clone();
        let url = format!("{}/2/users/{}/tweets", self.profile.analytics_base, account.internal_id);
        let token = access_token.to_string();
        let (start, _) = super::date_range(days_back);
        let start_time = format!("{}T00:00:00Z", start);

        paged(TimelineCursor::default(), move |cursor: TimelineCursor| {
            let api = api.clone();
            let url = url.clone();
            let token = token.clone();
            let TimelineCursor { token: page_token, mut totals } = cursor;
            let mut query = vec![
                ("tweet.fields", "public_metrics,created_at".to_string()),
                ("max_results", TIMELINE_PAGE_SIZE.to_string()),
                ("start_time", start_time.clone()),
            ];
            if let Some(page_token) = page_token {
                query.push(("pagination_token", page_token));
            }

            async move {
                let page: Timeline = api.get_json(&url, &token, &query).await?;
                debug!(tweets = page.data.len(), more = page.meta.next_token.is_some(), "Timeline page");
                totals.add(page.data);
                match page.meta.next_token {
                    Some(next) => Ok((
                        Vec::new(),
                        Some(TimelineCursor {
                            token: Some(next),
                            totals,
                        }),
                    )),
                    None => Ok((totals.into_points(), None)),
                }
            }
        })
    }

    async fn revoke(&self, access_token: &str, client: &ClientInfo) -> Result<(), AdapterError> {
        self.oauth.revoke(&self.profile, client, access_token).await
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
            client_id: "tw-client".to_string(),
            client_secret: "tw-secret".to_string(),
            redirect_uri: "https://app.example.com/social-accounts/callback/twitter".to_string(),
        }
    }

    fn account() -> AccountRef {
        AccountRef {
            integration_id: "int-1".to_string(),
            internal_id: "42".to_string(),
            metadata: BTreeMap::from([("username".to_string(), "acme".to_string())]),
        }
    }

    fn details() -> PostDetails {
        PostDetails {
            text: "Shipping today".to_string(),
            title: None,
            link: Some("https://acme.dev/blog".to_string()),
            media: vec![MediaRef {
                url: "https://cdn.acme.dev/hero.png".to_string(),
                mime_type: Some("image/png".to_string()),
                alt_text: None,
            }],
            settings: Default::default(),
            idempotency_key: "k".to_string(),
        }
    }

    fn adapter(server: &Server) -> TwitterAdapter {
        TwitterAdapter::with_profile(
            PlatformProfile::twitter().pointed_at(&server.url()),
            Client::new(),
        )
    }

    #[tokio::test]
    async fn test_authenticate_reads_profile() {
        let mut server = Server::new_async().await;
        let token = server
            .mock("POST", "/2/oauth2/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("code".into(), "abc".into()),
                Matcher::UrlEncoded("code_verifier".into(), "verifier".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"access_token":"at","refresh_token":"rt","expires_in":7200,"scope":"tweet.read tweet.write users.read offline.access","token_type":"bearer"}"#,
            )
            .create_async()
            .await;
        let _me = server
            .mock("GET", "/2/users/me")
            .match_header("authorization", "Bearer at")
            .with_status(200)
            .with_body(r#"{"data":{"id":"42","name":"Acme","username":"acme"}}"#)
            .create_async()
            .await;

        let tokens = adapter(&server)
            .authenticate("abc", "verifier", &client())
            .await
            .unwrap();
        token.assert_async().await;
        assert_eq!(tokens.internal_id, "42");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt"));
        assert!(tokens.expires_at.is_some());
        assert!(tokens.scopes.contains("offline.access"));
        assert_eq!(tokens.metadata["username"], "acme");
    }

    #[tokio::test]
    async fn test_authenticate_fails_when_profile_unreadable() {
        let mut server = Server::new_async().await;
        let _token = server
            .mock("POST", "/2/oauth2/token")
            .with_status(200)
            .with_body(r#"{"access_token":"at"}"#)
            .create_async()
            .await;
        let _me = server
            .mock("GET", "/2/users/me")
            .with_status(403)
            .with_body(r#"{"title":"Forbidden"}"#)
            .create_async()
            .await;

        let err = adapter(&server)
            .authenticate("abc", "verifier", &client())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::AuthExchange(_)));
    }

    #[tokio::test]
    async fn test_post_creates_tweet() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/2/tweets")
            .match_header("authorization", "Bearer at")
            .match_body(Matcher::Json(serde_json::json!({
                "text": "Shipping today\n\nhttps://acme.dev/blog\nhttps://cdn.acme.dev/hero.png"
            })))
            .with_status(201)
            .with_body(r#"{"data":{"id":"1790","text":"Shipping today"}}"#)
            .create_async()
            .await;

        let post = adapter(&server)
            .post(&account(), "at", &details())
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(post.platform_post_id, "1790");
        assert_eq!(post.platform_url, "https://x.com/acme/status/1790");
    }

    #[tokio::test]
    async fn test_post_rate_limited_uses_reset_header() {
        let mut server = Server::new_async().await;
        let reset = (chrono::Utc::now().timestamp() + 300).to_string();
        let _mock = server
            .mock("POST", "/2/tweets")
            .with_status(429)
            .with_header("x-rate-limit-reset", reset.as_str())
            .with_body(r#"{"title":"Too Many Requests"}"#)
            .create_async()
            .await;

        let err = adapter(&server)
            .post(&account(), "at", &details())
            .await
            .unwrap_err();
        match err {
            AdapterError::RateLimited { retry_after } => {
                assert!(retry_after.as_secs() > 200);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_tweet_is_rejected() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/2/tweets")
            .with_status(403)
            .with_body(r#"{"detail":"You are not allowed to create a Tweet with duplicate content."}"#)
            .create_async()
            .await;

        let err = adapter(&server)
            .post(&account(), "at", &details())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::PlatformRejected(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_analytics_follows_next_token() {
        let mut server = Server::new_async().await;
        let first = server
            .mock("GET", "/2/users/42/tweets")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("tweet.fields".into(), "public_metrics,created_at".into()),
                // No cursor follows start_time on the first page
                Matcher::Regex("start_time=[^&]+$".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"data":[
                    {"id":"1","text":"a","created_at":"2026-03-01T10:00:00.000Z","public_metrics":{"retweet_count":1,"reply_count":0,"like_count":5,"quote_count":0,"impression_count":100}},
                    {"id":"2","text":"b","created_at":"2026-03-01T18:00:00.000Z","public_metrics":{"retweet_count":0,"reply_count":2,"like_count":3,"quote_count":0,"impression_count":50}}
                ],"meta":{"result_count":2,"next_token":"page2"}}"#,
            )
            .create_async()
            .await;
        let second = server
            .mock("GET", "/2/users/42/tweets")
            .match_query(Matcher::UrlEncoded("pagination_token".into(), "page2".into()))
            .with_status(200)
            .with_body(
                r#"{"data":[
                    {"id":"3","text":"c","created_at":"2026-03-02T09:00:00.000Z","public_metrics":{"retweet_count":0,"reply_count":0,"like_count":1,"quote_count":0,"impression_count":10}},
                    {"id":"4","text":"d","created_at":"2026-03-01T08:00:00.000Z","public_metrics":{"retweet_count":0,"reply_count":0,"like_count":2,"quote_count":0,"impression_count":20}}
                ],"meta":{"result_count":2}}"#,
            )
            .create_async()
            .await;

        let points: Vec<AnalyticsPoint> = adapter(&server)
            .analytics(&account(), "at", 30)
            .try_collect()
            .await
            .unwrap();
        first.assert_async().await;
        second.assert_async().await;

        let day1 = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let value = |date: NaiveDate, metric: &str| {
            points
                .iter()
                .find(|p| p.date == date && p.metric == metric)
                .map(|p| p.value)
        };
        // 2026-03-01 spans both pages and still yields one point per metric
        assert_eq!(value(day1, "impressions"), Some(170.0));
        assert_eq!(value(day1, "likes"), Some(10.0));
        assert_eq!(value(day2, "likes"), Some(1.0));
        assert_eq!(
            points
                .iter()
                .filter(|p| p.date == day1 && p.metric == "impressions")
                .count(),
            1
        );
        assert_eq!(points.len(), 10);
    }

    #[tokio::test]
    async fn test_refresh_rotates_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/2/oauth2/token")
            .match_header("authorization", Matcher::Regex("^Basic ".into()))
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "old-rt".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"new-at","refresh_token":"new-rt","expires_in":7200}"#)
            .create_async()
            .await;

        let tokens = adapter(&server)
            .refresh_token("old-rt", &client())
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(tokens.access_token, "new-at");
        assert_eq!(tokens.refresh_token.as_deref(), Some("new-rt"));
    }

    #[tokio::test]
    async fn test_revoke_calls_endpoint() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/2/oauth2/revoke")
            .match_body(Matcher::UrlEncoded("token".into(), "at".into()))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        adapter(&server).revoke("at", &client()).await.unwrap();
        mock.assert_async().await;
    }
}
