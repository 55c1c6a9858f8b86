//! Facebook Pages adapter.

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
use tracing::info;

const INSIGHT_METRICS: &str = "page_impressions,page_post_engagements,page_fan_adds";

/// Posts to the first Facebook Page the user manages.
pub struct FacebookAdapter {
    profile: PlatformProfile,
    oauth: OAuth2Client,
    api: ApiClient,
}

impl FacebookAdapter {
    pub fn new(http: Client) -> Self {
        Self::with_profile(PlatformProfile::facebook(), http)
    }

    pub fn with_profile(profile: PlatformProfile, http: Client) -> Self {
        Self {
            profile,
            oauth: OAuth2Client::new(http.clone()),
            api: ApiClient::new(http).with_error_mapper(graph_error),
        }
    }
}

#[derive(Deserialize)]
struct PhotoResponse {
    id: String,
    #[serde(default)]
    post_id: Option<String>,
}

#[async_trait]
impl ProviderAdapter for FacebookAdapter {
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
        let page = pages.into_iter().next().ok_or_else(|| {
            AdapterError::AuthExchange("the account manages no Facebook Page".to_string())
        })?;

        info!(provider = "facebook", page_id = %page.id, "Connected Facebook Page");
        let mut set = tokens.into_token_set(
            &self.profile,
            page.id,
            BTreeMap::from([("name".to_string(), page.name)]),
        );
        // Page tokens from a long-lived user token do not expire
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
        // Fails with TokenExpired without a network call
        let tokens = self.oauth.refresh(&self.profile, client, refresh_token).await?;
        Ok(tokens.into_token_set(&self.profile, String::new(), BTreeMap::new()))
    }

    async fn post(
        &self,
        account: &AccountRef,
        access_token: &str,
        details: &PostDetails,
    ) -> Result<PublishedPost, AdapterError> {
        let page_id = &account.internal_id;
        let image = details.media.iter().find(|m| !m.is_video());

        let post_id = match image {
            Some(image) => {
                let photo: PhotoResponse = self
                    .api
                    .post_form(
                        &format!("{}/{}/photos", self.profile.api_base, page_id),
                        access_token,
                        &[
                            ("url", image.url.clone()),
                            ("caption", super::text_with_link(&details.text, details.link.as_deref())),
                        ],
                    )
                    .await?;
                photo.post_id.unwrap_or(photo.id)
            }
            None => {
                let mut form = vec![("message", details.text.clone())];
                if let Some(link) = details.link.as_ref().filter(|l| !l.is_empty()) {
                    form.push(("link", link.clone()));
                }
                let created: IdResponse = self
                    .api
                    .post_form(
                        &format!("{}/{}/feed", self.profile.api_base, page_id),
                        access_token,
                        &form,
                    )
                    .await?;
                created.id
            }
        };

        Ok(PublishedPost {
            platform_url: format!("https://www.facebook.com/{}", post_id),
            platform_post_id: post_id,
        })
    }

    fn analytics(&self, account: &AccountRef, access_token: &str, days_back: u32) -> AnalyticsStream {
        let api = self.api.clone();
        let base = self.profile.analytics_base.clone();
        let page_id = account.internal_id.clone();
        let token = access_token.to_string();
        let (since, until) = super::date_range(days_back);

        paged((), move |()| {
            let fetch = graph::insights(
                api.clone(),
                base.clone(),
                page_id.clone(),
                token.clone(),
                INSIGHT_METRICS,
                since,
                until,
            );
            async move { Ok((fetch.await?, None)) }
        })
    }
}
