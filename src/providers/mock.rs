//! Scripted provider adapter.
//!
//! Available to unit tests and, behind the `test-utils` feature, to
//! integration tests, so the whole OAuth/publish pipeline runs without
//! platform credentials. Outcomes are scripted per call; once a script runs
//! dry the adapter succeeds.

use super::{
    AccountRef, AnalyticsPoint, AnalyticsStream, ClientInfo, ProviderAdapter, PublishedPost,
    TokenSet,
};
use crate::error::AdapterError;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Scripted adapter for tests
pub struct MockAdapter {
    identifier: String,
    display_name: String,
    supports_refresh: bool,
    delay: Duration,
    authenticate_script: Mutex<VecDeque<Result<TokenSet, AdapterError>>>,
    refresh_script: Mutex<VecDeque<Result<TokenSet, AdapterError>>>,
    post_script: Mutex<VecDeque<Result<PublishedPost, AdapterError>>>,
    analytics_points: Mutex<Vec<AnalyticsPoint>>,
    authenticate_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    post_calls: AtomicUsize,
    revoke_calls: AtomicUsize,
}

impl MockAdapter {
    /// Adapter that always succeeds and supports refresh.
    pub fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            display_name: format!("Mock {}", identifier),
            supports_refresh: true,
            delay: Duration::ZERO,
            authenticate_script: Mutex::new(VecDeque::new()),
            refresh_script: Mutex::new(VecDeque::new()),
            post_script: Mutex::new(VecDeque::new()),
            analytics_points: Mutex::new(Vec::new()),
            authenticate_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            post_calls: AtomicUsize::new(0),
            revoke_calls: AtomicUsize::new(0),
        }
    }

    /// Adapter for a platform that cannot refresh tokens.
    pub fn without_refresh(identifier: &str) -> Self {
        Self {
            supports_refresh: false,
            ..Self::new(identifier)
        }
    }

    /// Simulated latency applied to refresh and post calls.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script_authenticate(&self, outcome: Result<TokenSet, AdapterError>) {
        lock(&self.authenticate_script).push_back(outcome);
    }

    pub fn script_refresh(&self, outcome: Result<TokenSet, AdapterError>) {
        lock(&self.refresh_script).push_back(outcome);
    }

    pub fn script_post(&self, outcome: Result<PublishedPost, AdapterError>) {
        lock(&self.post_script).push_back(outcome);
    }

    pub fn set_analytics(&self, points: Vec<AnalyticsPoint>) {
        *lock(&self.analytics_points) = points;
    }

    pub fn authenticate_calls(&self) -> usize {
        self.authenticate_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn post_calls(&self) -> usize {
        self.post_calls.load(Ordering::SeqCst)
    }

    pub fn revoke_calls(&self) -> usize {
        self.revoke_calls.load(Ordering::SeqCst)
    }

    /// Token set returned when no authenticate outcome is scripted.
    pub fn default_tokens(code: &str) -> TokenSet {
        TokenSet {
            access_token: format!("mock-access-{}", code),
            refresh_token: Some(format!("mock-refresh-{}", code)),
            expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
            scopes: ["publish".to_string()].into_iter().collect(),
            internal_id: "mock-account".to_string(),
            metadata: BTreeMap::from([("handle".to_string(), "@mock".to_string())]),
        }
    }

    async fn simulate_latency(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // A panicking test thread must not wedge the others
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn required_scopes(&self) -> BTreeSet<String> {
        ["publish".to_string(), "read".to_string()]
            .into_iter()
            .collect()
    }

    fn generate_auth_url(
        &self,
        client: &ClientInfo,
        state: &str,
        code_challenge: &str,
    ) -> Result<String, AdapterError> {
        client.ensure_complete(&self.identifier)?;
        Ok(format!(
            "https://mock.example.com/{}/authorize?client_id={}&redirect_uri={}&state={}&code_challenge={}&code_challenge_method=S256",
            self.identifier,
            urlencoding::encode(&client.client_id),
            urlencoding::encode(&client.redirect_uri),
            urlencoding::encode(state),
            urlencoding::encode(code_challenge)
        ))
    }

    async fn authenticate(
        &self,
        code: &str,
        code_verifier: &str,
        _client: &ClientInfo,
    ) -> Result<TokenSet, AdapterError> {
        self.authenticate_calls.fetch_add(1, Ordering::SeqCst);
        if code_verifier.is_empty() {
            return Err(AdapterError::AuthExchange("missing code_verifier".to_string()));
        }
        let scripted = lock(&self.authenticate_script).pop_front();
        scripted.unwrap_or_else(|| Ok(Self::default_tokens(code)))
    }

    async fn refresh_token(
        &self,
        _refresh_token: &str,
        _client: &ClientInfo,
    ) -> Result<TokenSet, AdapterError> {
        let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.supports_refresh {
            return Err(AdapterError::TokenExpired(format!(
                "{} does not support token refresh",
                self.identifier
            )));
        }
        self.simulate_latency().await;

        let scripted = lock(&self.refresh_script).pop_front();
        scripted.unwrap_or_else(|| {
            Ok(TokenSet {
                access_token: format!("mock-refreshed-{}", call),
                refresh_token: None,
                expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
                scopes: BTreeSet::new(),
                internal_id: String::new(),
                metadata: BTreeMap::new(),
            })
        })
    }

    async fn post(
        &self,
        account: &AccountRef,
        _access_token: &str,
        _details: &crate::providers::PostDetails,
    ) -> Result<PublishedPost, AdapterError> {
        let call = self.post_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.simulate_latency().await;

        let scripted = lock(&self.post_script).pop_front();
        scripted.unwrap_or_else(|| {
            let id = format!("{}-post-{}", account.internal_id, call);
            Ok(PublishedPost {
                platform_url: format!("https://mock.example.com/{}/{}", self.identifier, id),
                platform_post_id: id,
            })
        })
    }

    fn analytics(&self, _account: &AccountRef, _access_token: &str, _days_back: u32) -> AnalyticsStream {
        let points = lock(&self.analytics_points).clone();
        stream::iter(points.into_iter().map(Ok)).boxed()
    }

    async fn revoke(&self, _access_token: &str, _client: &ClientInfo) -> Result<(), AdapterError> {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
