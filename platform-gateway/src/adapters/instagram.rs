//! Instagram business account adapter (Graph API content publishing).

use super::graph::{self, graph_error, IdResponse};
use super::paged;
use crate::http::ApiClient;
use crate::oauth2::{authorization_url, OAuth2Client};
use crate::platforms::PlatformProfile;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use socialsync::providers::{
    AccountRef, AnalyticsStream, ClientInfo, EditorMode, PostDetails, ProviderAdapter,
    PublishedPost, TokenSet,
};
use socialsync::AdapterError;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, warn};

const INSIGHT_METRICS: &str = "impressions,reach";

/// Video containers are processed asynchronously before they can be published
const CONTAINER_POLL_INTERVAL: Duration = Duration::from_secs(2);
const CONTAINER_POLL_ATTEMPTS: u32 = 30;

pub struct InstagramAdapter {
    profile: PlatformProfile,
    oauth: OAuth2Client,
    api: ApiClient,
    poll_interval: Duration,
}

impl InstagramAdapter {
    pub fn new(http: Client) -> Self {
        Self::with_profile(PlatformProfile::instagram(), http)
    }

    pub fn with_profile(profile: PlatformProfile, http: Client) -> Self {
        Self {
            profile,
            oauth: OAuth2Client::new(http.clone()),
            api: ApiClient::new(http).with_error_mapper(graph_error),
            poll_interval: CONTAINER_POLL_INTERVAL,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.profile.api_base, path)
    }

    /// Wait until a media container leaves `IN_PROGRESS`.
    async fn wait_until_ready(&self, container_id: &str, token: &str) -> Result<(), AdapterError> {
        #[derive(Deserialize)]
        struct ContainerStatus {
            #[serde(default)]
            status_code: String,
        }

        for _ in 0..CONTAINER_POLL_ATTEMPTS {
            let status: ContainerStatus = self
                .api
                .get_json(
                    &self.url(container_id),
                    token,
                    &[("fields", "status_code".to_string())],
                )
                .await?;
            match status.status_code.as_str() {
                "FINISHED" | "PUBLISHED" | "" => return Ok(()),
                "ERROR" | "EXPIRED" => {
                    return Err(AdapterError::PlatformRejected(format!(
                        "media container {} failed processing",
                        container_id
                    )))
                }
                other => debug!(container_id = %container_id, status = %other, "Media container not ready"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        Err(AdapterError::TransientNetwork(format!(
            "media container {} still processing",
            container_id
        )))
    }

    async fn permalink(&self, media_id: &str, token: &str) -> String {
        #[derive(Deserialize)]
        struct Permalink {
            permalink: String,
        }

        match self
            .api
            .get_json::<Permalink>(&self.url(media_id), token, &[("fields", "permalink".to_string())])
            .await
        {
            Ok(p) => p.permalink,
            Err(e) => {
                warn!(media_id = %media_id, error = %e, "Could not read permalink");
                "https://www.instagram.com/".to_string()
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for InstagramAdapter {
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
        _code_verifier: &str,
        client: &ClientInfo,
    ) -> Result<TokenSet, AdapterError> {
        let (tokens, pages) = graph::login(&self.oauth, &self.api, &self.profile, client, code).await?;

        let (page, account) = pages
            .into_iter()
            .find_map(|page| {
                let account = page.instagram_business_account.as_ref()?;
                let ids = (account.id.clone(), account.username.clone());
                Some((page, ids))
            })
            .ok_or_else(|| {
                AdapterError::AuthExchange(
                    "no Instagram business account is linked to the user's pages".to_string(),
                )
            })?;
        let (account_id, username) = account;

        info!(provider = "instagram", account_id = %account_id, "Connected Instagram account");
        let mut metadata = BTreeMap::from([("page_id".to_string(), page.id)]);
        if let Some(username) = username {
            metadata.insert("username".to_string(), username);
        }

        let mut set = tokens.into_token_set(&self.profile, account_id, metadata);
        set.access_token = page.access_token;
        set.refresh_token = None;
        set.expires_at = None;
        Ok(set)
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
        let media = details.media.first().ok_or_else(|| {
            AdapterError::PlatformRejected("Instagram posts require an image or video".to_string())
        })?;
        if details.media.len() > 1 {
            debug!(count = details.media.len(), "Instagram publishes the first media item only");
        }

        let caption = super::text_with_link(&details.text, details.link.as_deref());
        let mut form = vec![("caption", caption)];
        if media.is_video() {
            form.push(("media_type", "REELS".to_string()));
            form.push(("video_url", media.url.clone()));
        } else {
            form.push(("image_url", media.url.clone()));
        }

        let ig_id = &account.internal_id;
        let container: IdResponse = self
            .api
            .post_form(&self.url(&format!("{}/media", ig_id)), access_token, &form)
            .await?;
        if media.is_video() {
            self.wait_until_ready(&container.id, access_token).await?;
        }

        let published: IdResponse = self
            .api
            .post_form(
                &self.url(&format!("{}/media_publish", ig_id)),
                access_token,
                &[("creation_id", container.id)],
            )
            .await?;

        let platform_url = self.permalink(&published.id, access_token).await;
        Ok(PublishedPost {
            platform_post_id: published.id,
            platform_url,
        })
    }

    fn analytics(&self, account: &AccountRef, access_token: &str, days_back: u32) -> AnalyticsStream {
        let api = self.api.clone();
        let base = self.profile.analytics_base.clone();
        let ig_id = account.internal_id.clone();
        let token = access_token.to_string();
        let (since, until) = super::date_range(days_back);

        paged((), move |()| {
            let fetch = graph::insights(
                api.clone(),
                base.clone(),
                ig_id.clone(),
                token.clone(),
                INSIGHT_METRICS,
                since,
                until,
            );
            async move { Ok((fetch.await?, None)) }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use socialsync::providers::MediaRef;

    fn client() -> ClientInfo {
        ClientInfo {
            client_id: "fb-app".to_string(),
            client_secret: "fb-secret".to_string(),
            redirect_uri: "https://app.example.com/social-accounts/callback/instagram".to_string(),
        }
    }

    fn account() -> AccountRef {
        AccountRef {
            integration_id: "int-1".to_string(),
            internal_id: "ig-1".to_string(),
            metadata: BTreeMap::new(),
        }
    }

    fn details(media: Vec<MediaRef>) -> PostDetails {
        PostDetails {
            text: "New drop".to_string(),
            title: None,
            link: None,
            media,
            settings: Default::default(),
            idempotency_key: "k".to_string(),
        }
    }

    fn adapter(server: &Server) -> InstagramAdapter {
        let mut adapter = InstagramAdapter::with_profile(
            PlatformProfile::instagram().pointed_at(&server.url()),
            Client::new(),
        );
        adapter.poll_interval = Duration::from_millis(1);
        adapter
    }

    fn image() -> MediaRef {
        MediaRef {
            url: "https://cdn.example.com/p.jpg".to_string(),
            mime_type: Some("image/jpeg".to_string()),
            alt_text: None,
        }
    }

    #[tokio::test]
    async fn test_authenticate_finds_business_account() {
        let mut server = Server::new_async().await;
        let _token = server
            .mock("POST", "/v19.0/oauth/access_token")
            .with_status(200)
            .with_body(r#"{"access_token":"user"}"#)
            .create_async()
            .await;
        let _pages = server
            .mock("GET", "/v19.0/me/accounts")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"data":[
                    {"id":"p1","name":"No IG","access_token":"t1"},
                    {"id":"p2","name":"Shop","access_token":"t2","instagram_business_account":{"id":"ig-9","username":"shop"}}
                ]}"#,
            )
            .create_async()
            .await;

        let tokens = adapter(&server)
            .authenticate("code", "v", &client())
            .await
            .unwrap();
        assert_eq!(tokens.internal_id, "ig-9");
        assert_eq!(tokens.access_token, "t2");
        assert_eq!(tokens.metadata["username"], "shop");
        assert_eq!(tokens.metadata["page_id"], "p2");
    }

    #[tokio::test]
    async fn test_post_requires_media() {
        let server = Server::new_async().await;
        let err = adapter(&server)
            .post(&account(), "tok", &details(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::PlatformRejected(_)));
    }

    #[tokio::test]
    async fn test_post_image_creates_and_publishes_container() {
        let mut server = Server::new_async().await;
        let create = server
            .mock("POST", "/v19.0/ig-1/media")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("image_url".into(), "https://cdn.example.com/p.jpg".into()),
                Matcher::UrlEncoded("caption".into(), "New drop".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"id":"container-1"}"#)
            .create_async()
            .await;
        let publish = server
            .mock("POST", "/v19.0/ig-1/media_publish")
            .match_body(Matcher::UrlEncoded("creation_id".into(), "container-1".into()))
            .with_status(200)
            .with_body(r#"{"id":"media-7"}"#)
            .create_async()
            .await;
        let _permalink = server
            .mock("GET", "/v19.0/media-7")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"permalink":"https://www.instagram.com/p/abc/","id":"media-7"}"#)
            .create_async()
            .await;

        let post = adapter(&server)
            .post(&account(), "tok", &details(vec![image()]))
            .await
            .unwrap();
        create.assert_async().await;
        publish.assert_async().await;
        assert_eq!(post.platform_post_id, "media-7");
        assert_eq!(post.platform_url, "https://www.instagram.com/p/abc/");
    }

    #[tokio::test]
    async fn test_video_container_error_is_rejected() {
        let mut server = Server::new_async().await;
        let _create = server
            .mock("POST", "/v19.0/ig-1/media")
            .with_status(200)
            .with_body(r#"{"id":"container-2"}"#)
            .create_async()
            .await;
        let _status = server
            .mock("GET", "/v19.0/container-2")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"status_code":"ERROR","id":"container-2"}"#)
            .create_async()
            .await;
        let publish = server
            .mock("POST", "/v19.0/ig-1/media_publish")
            .expect(0)
            .create_async()
            .await;

        let video = MediaRef {
            url: "https://cdn.example.com/v.mp4".to_string(),
            mime_type: Some("video/mp4".to_string()),
            alt_text: None,
        };
        let err = adapter(&server)
            .post(&account(), "tok", &details(vec![video]))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::PlatformRejected(_)));
        publish.assert_async().await;
    }

    #[tokio::test]
    async fn test_throttled_publish() {
        let mut server = Server::new_async().await;
        let _create = server
            .mock("POST", "/v19.0/ig-1/media")
            .with_status(400)
            .with_body(r#"{"error":{"message":"Application request limit reached","code":4}}"#)
            .create_async()
            .await;

        let err = adapter(&server)
            .post(&account(), "tok", &details(vec![image()]))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::RateLimited { .. }));
    }
}
