//! Per-platform OAuth and API endpoint data.
//!
//! Everything that differs between platforms but is not wire-format
//! translation lives here as data, so adapters stay small.

use socialsync::providers::EditorMode;

/// How the client authenticates against the token endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuth {
    /// HTTP Basic with client id and secret
    Basic,
    /// `client_id` / `client_secret` form fields
    RequestBody,
}

#[derive(Debug, Clone)]
pub struct PlatformProfile {
    pub identifier: &'static str,
    pub display_name: &'static str,
    pub authorize_url: String,
    pub token_url: String,
    pub revoke_url: Option<String>,
    pub api_base: String,
    /// Reporting API root; equal to `api_base` except for YouTube
    pub analytics_base: String,
    pub scopes: &'static [&'static str],
    pub scope_separator: &'static str,
    pub uses_pkce: bool,
    pub supports_refresh: bool,
    pub client_auth: ClientAuth,
    pub editor_mode: EditorMode,
    /// Extra authorization URL parameters
    pub extra_auth_params: &'static [(&'static str, &'static str)],
}

const GRAPH_VERSION: &str = "v19.0";

impl PlatformProfile {
    pub fn facebook() -> Self {
        Self {
            identifier: "facebook",
            display_name: "Facebook",
            authorize_url: format!("https://www.facebook.com/{}/dialog/oauth", GRAPH_VERSION),
            token_url: format!("https://graph.facebook.com/{}/oauth/access_token", GRAPH_VERSION),
            revoke_url: None,
            api_base: format!("https://graph.facebook.com/{}", GRAPH_VERSION),
            analytics_base: format!("https://graph.facebook.com/{}", GRAPH_VERSION),
            scopes: &[
                "pages_show_list",
                "pages_manage_posts",
                "pages_read_engagement",
                "read_insights",
            ],
            scope_separator: ",",
            uses_pkce: false,
            supports_refresh: false,
            client_auth: ClientAuth::RequestBody,
            editor_mode: EditorMode::Normal,
            extra_auth_params: &[],
        }
    }

    /// Instagram business accounts, published through the Facebook Graph API.
    pub fn instagram() -> Self {
        Self {
            identifier: "instagram",
            display_name: "Instagram",
            scopes: &[
                "instagram_basic",
                "instagram_content_publish",
                "instagram_manage_insights",
                "pages_show_list",
                "business_management",
            ],
            ..Self::facebook()
        }
    }

    pub fn twitter() -> Self {
        Self {
            identifier: "twitter",
            display_name: "X (Twitter)",
            authorize_url: "https://twitter.com/i/oauth2/authorize".to_string(),
            token_url: "https://api.twitter.com/2/oauth2/token".to_string(),
            revoke_url: Some("https://api.twitter.com/2/oauth2/revoke".to_string()),
            api_base: "https://api.twitter.com".to_string(),
            analytics_base: "https://api.twitter.com".to_string(),
            scopes: &["tweet.read", "tweet.write", "users.read", "offline.access"],
            scope_separator: " ",
            uses_pkce: true,
            supports_refresh: true,
            client_auth: ClientAuth::Basic,
            editor_mode: EditorMode::Normal,
            extra_auth_params: &[],
        }
    }

    pub fn youtube() -> Self {
        Self {
            identifier: "youtube",
            display_name: "YouTube",
            authorize_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            revoke_url: Some("https://oauth2.googleapis.com/revoke".to_string()),
            api_base: "https://www.googleapis.com".to_string(),
            analytics_base: "https://youtubeanalytics.googleapis.com".to_string(),
            scopes: &[
                "https://www.googleapis.com/auth/youtube.upload",
                "https://www.googleapis.com/auth/youtube.readonly",
                "https://www.googleapis.com/auth/yt-analytics.readonly",
            ],
            scope_separator: " ",
            uses_pkce: true,
            supports_refresh: true,
            client_auth: ClientAuth::RequestBody,
            editor_mode: EditorMode::Normal,
            // Offline access is what makes Google issue a refresh token
            extra_auth_params: &[("access_type", "offline"), ("prompt", "consent")],
        }
    }

    pub fn pinterest() -> Self {
        Self {
            identifier: "pinterest",
            display_name: "Pinterest",
            authorize_url: "https://www.pinterest.com/oauth/".to_string(),
            token_url: "https://api.pinterest.com/v5/oauth/token".to_string(),
            revoke_url: None,
            api_base: "https://api.pinterest.com".to_string(),
            analytics_base: "https://api.pinterest.com".to_string(),
            scopes: &[
                "boards:read",
                "pins:read",
                "pins:write",
                "user_accounts:read",
            ],
            scope_separator: ",",
            uses_pkce: false,
            supports_refresh: true,
            client_auth: ClientAuth::Basic,
            editor_mode: EditorMode::Normal,
            extra_auth_params: &[],
        }
    }

    /// Rewrite every endpoint onto `base_url`, keeping paths. Used to point
    /// adapters at a local mock server.
    pub fn pointed_at(mut self, base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        self.authorize_url = rebase(&self.authorize_url, base);
        self.token_url = rebase(&self.token_url, base);
        self.revoke_url = self.revoke_url.as_deref().map(|url| rebase(url, base));
        self.api_base = rebase(&self.api_base, base);
        self.analytics_base = rebase(&self.analytics_base, base);
        self
    }

    pub fn scope_string(&self) -> String {
        self.scopes.join(self.scope_separator)
    }
}

/// Replace scheme and host of `url` with `base`.
fn rebase(url: &str, base: &str) -> String {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    match without_scheme.find('/') {
        Some(idx) => format!("{}{}", base, &without_scheme[idx..]),
        None => base.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointed_at_keeps_paths() {
        let profile = PlatformProfile::twitter().pointed_at("http://127.0.0.1:1234/");
        assert_eq!(profile.token_url, "http://127.0.0.1:1234/2/oauth2/token");
        assert_eq!(
            profile.revoke_url.as_deref(),
            Some("http://127.0.0.1:1234/2/oauth2/revoke")
        );
        assert_eq!(profile.api_base, "http://127.0.0.1:1234");
    }

    #[test]
    fn test_scope_string_uses_platform_separator() {
        assert_eq!(
            PlatformProfile::twitter().scope_string(),
            "tweet.read tweet.write users.read offline.access"
        );
        assert!(PlatformProfile::facebook()
            .scope_string()
            .starts_with("pages_show_list,pages_manage_posts"));
    }

    #[test]
    fn test_instagram_shares_graph_endpoints() {
        let instagram = PlatformProfile::instagram();
        let facebook = PlatformProfile::facebook();
        assert_eq!(instagram.token_url, facebook.token_url);
        assert_ne!(instagram.scopes, facebook.scopes);
        assert!(!instagram.supports_refresh);
    }
}
