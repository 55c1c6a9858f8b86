//! OAuth 2.0 authorization URLs and token endpoint calls shared by every
//! adapter.

use crate::http::{classify_status, transport_error, truncate};
use crate::platforms::{ClientAuth, PlatformProfile};
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use socialsync::providers::{ClientInfo, TokenSet};
use socialsync::AdapterError;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Token endpoint response (RFC 6749 §5.1).
#[derive(Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish()
    }
}

impl TokenResponse {
    /// Convert into a [`TokenSet`]. Granted scopes fall back to the requested
    /// ones when the platform does not echo them.
    pub fn into_token_set(
        self,
        profile: &PlatformProfile,
        internal_id: String,
        metadata: BTreeMap<String, String>,
    ) -> TokenSet {
        let scopes: BTreeSet<String> = match &self.scope {
            Some(scope) => scope
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => profile.scopes.iter().map(|s| s.to_string()).collect(),
        };

        TokenSet {
            access_token: self.access_token,
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()),
            expires_at: self
                .expires_in
                .filter(|secs| *secs > 0)
                .map(|secs| Utc::now() + ChronoDuration::seconds(secs)),
            scopes,
            internal_id,
            metadata,
        }
    }
}

#[derive(Deserialize)]
struct TokenErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
    AuthorizationCode,
    RefreshToken,
}

impl Grant {
    fn as_str(&self) -> &'static str {
        match self {
            Grant::AuthorizationCode => "authorization_code",
            Grant::RefreshToken => "refresh_token",
        }
    }
}

/// Build the platform authorization URL. Pure; no I/O.
pub fn authorization_url(
    profile: &PlatformProfile,
    client: &ClientInfo,
    state: &str,
    code_challenge: &str,
) -> Result<String, AdapterError> {
    client.ensure_complete(profile.identifier)?;

    let scope = profile.scope_string();
    let mut params: Vec<(&str, &str)> = vec![
        ("response_type", "code"),
        ("client_id", client.client_id.as_str()),
        ("redirect_uri", client.redirect_uri.as_str()),
        ("scope", scope.as_str()),
        ("state", state),
    ];
    if profile.uses_pkce {
        params.push(("code_challenge", code_challenge));
        params.push(("code_challenge_method", "S256"));
    }
    params.extend(profile.extra_auth_params.iter().copied());

    let query = serde_urlencoded::to_string(&params)
        .map_err(|e| AdapterError::Configuration(format!("invalid authorization parameters: {}", e)))?;
    Ok(format!("{}?{}", profile.authorize_url, query))
}

/// Client for a platform's token and revocation endpoints.
#[derive(Clone)]
pub struct OAuth2Client {
    http: Client,
}

impl OAuth2Client {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    /// Exchange an authorization code.
    ///
    /// # Errors
    /// `AuthExchange` for a rejected code or verifier and for responses
    /// without an access token.
    pub async fn exchange_code(
        &self,
        profile: &PlatformProfile,
        client: &ClientInfo,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, AdapterError> {
        client.ensure_complete(profile.identifier)?;

        let mut form = vec![
            ("code", code.to_string()),
            ("redirect_uri", client.redirect_uri.clone()),
        ];
        if profile.uses_pkce {
            form.push(("code_verifier", code_verifier.to_string()));
        }

        let tokens = self
            .token_request(profile, client, Grant::AuthorizationCode, form)
            .await?;
        info!(
            provider = profile.identifier,
            has_refresh_token = tokens.refresh_token.is_some(),
            expires_in = ?tokens.expires_in,
            "Authorization code exchanged"
        );
        Ok(tokens)
    }

    /// Redeem a refresh token.
    ///
    /// # Errors
    /// `TokenExpired` when the platform has no refresh grant, `TokenRevoked`
    /// when the refresh token is no longer accepted.
    pub async fn refresh(
        &self,
        profile: &PlatformProfile,
        client: &ClientInfo,
        refresh_token: &str,
    ) -> Result<TokenResponse, AdapterError> {
        if !profile.supports_refresh {
            return Err(AdapterError::TokenExpired(format!(
                "{} does not support token refresh",
                profile.identifier
            )));
        }
        client.ensure_complete(profile.identifier)?;

        let form = vec![("refresh_token", refresh_token.to_string())];
        let tokens = self
            .token_request(profile, client, Grant::RefreshToken, form)
            .await?;
        debug!(
            provider = profile.identifier,
            rotated = tokens.refresh_token.is_some(),
            "Token refreshed"
        );
        Ok(tokens)
    }

    /// Revoke a token at the platform. Platforms without a revocation
    /// endpoint succeed without a call.
    pub async fn revoke(
        &self,
        profile: &PlatformProfile,
        client: &ClientInfo,
        token: &str,
    ) -> Result<(), AdapterError> {
        let Some(revoke_url) = &profile.revoke_url else {
            debug!(provider = profile.identifier, "No revocation endpoint");
            return Ok(());
        };

        let form = vec![
            ("token", token.to_string()),
            ("token_type_hint", "access_token".to_string()),
        ];
        let request = with_client_auth(self.http.post(revoke_url), profile, client, form);
        let response = request.send().await.map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            info!(provider = profile.identifier, "Token revoked at platform");
            return Ok(());
        }
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        warn!(provider = profile.identifier, status = %status, "Token revocation rejected");
        Err(classify_status(status, &headers, &body))
    }

    async fn token_request(
        &self,
        profile: &PlatformProfile,
        client: &ClientInfo,
        grant: Grant,
        mut form: Vec<(&'static str, String)>,
    ) -> Result<TokenResponse, AdapterError> {
        form.push(("grant_type", grant.as_str().to_string()));

        let request = with_client_auth(
            self.http
                .post(&profile.token_url)
                .header("Accept", "application/json"),
            profile,
            client,
            form,
        );
        let response = request.send().await.map_err(transport_error)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(token_error(grant, status, &headers, &body));
        }

        let tokens: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            malformed(grant, format!("unparseable token response: {}", e))
        })?;
        if tokens.access_token.is_empty() {
            return Err(malformed(grant, "token response missing access_token".to_string()));
        }
        Ok(tokens)
    }
}

/// Attach client credentials the way the platform expects them.
fn with_client_auth(
    request: reqwest::RequestBuilder,
    profile: &PlatformProfile,
    client: &ClientInfo,
    mut form: Vec<(&'static str, String)>,
) -> reqwest::RequestBuilder {
    // Public-client platforms want client_id in the body even with Basic auth
    form.push(("client_id", client.client_id.clone()));
    match profile.client_auth {
        ClientAuth::Basic => request
            .basic_auth(&client.client_id, Some(&client.client_secret))
            .form(&form),
        ClientAuth::RequestBody => {
            form.push(("client_secret", client.client_secret.clone()));
            request.form(&form)
        }
    }
}

fn malformed(grant: Grant, message: String) -> AdapterError {
    match grant {
        Grant::AuthorizationCode => AdapterError::AuthExchange(message),
        Grant::RefreshToken => AdapterError::PlatformRejected(message),
    }
}

/// Map a token endpoint failure. `invalid_grant` means the code was bad on
/// exchange and the grant is gone on refresh.
fn token_error(
    grant: Grant,
    status: StatusCode,
    headers: &reqwest::header::HeaderMap,
    body: &str,
) -> AdapterError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return classify_status(status, headers, body);
    }

    let (error, description) = match serde_json::from_str::<TokenErrorBody>(body) {
        Ok(parsed) => (parsed.error, parsed.error_description.unwrap_or_default()),
        Err(_) => (format!("http_{}", status.as_u16()), truncate(body).to_string()),
    };
    let message = if description.is_empty() {
        error.clone()
    } else {
        format!("{}: {}", error, description)
    };

    match (grant, error.as_str()) {
        (Grant::AuthorizationCode, _) => AdapterError::AuthExchange(message),
        (Grant::RefreshToken, "invalid_grant") => AdapterError::TokenRevoked(message),
        (Grant::RefreshToken, "invalid_client" | "unauthorized_client") => {
            AdapterError::Configuration(message)
        }
        (Grant::RefreshToken, _) => classify_status(status, headers, body),
    }
}
