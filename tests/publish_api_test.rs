// Integration tests for /posts publishing endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use socialsync::api::{create_router, AppState};
use socialsync::config::{LimitConfig, ProviderConfig, SocialSyncConfig};
use socialsync::providers::{MockAdapter, ProviderRegistry};
use socialsync::rate_limit::OperationClass;
use socialsync::vault::TokenCipher;
use socialsync::AdapterError;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    twitter: Arc<MockAdapter>,
    facebook: Arc<MockAdapter>,
}

fn create_test_app(twitter_post_limit: Option<u32>, facebook_delay: Duration) -> TestApp {
    let mut config = SocialSyncConfig::default();
    config.storage.database_path = ":memory:".to_string();
    config.resilience.base_delay_ms = 1;
    config.resilience.max_delay_ms = 5;
    config.resilience.acquire_max_wait_ms = 0;

    let mut twitter_config = ProviderConfig {
        client_id: Some("tw-client".to_string()),
        client_secret: Some("tw-secret".to_string()),
        ..Default::default()
    };
    if let Some(capacity) = twitter_post_limit {
        twitter_config.limits.push(LimitConfig {
            operation: OperationClass::Post,
            capacity,
            window_seconds: 900,
        });
    }
    config.providers.insert("twitter".to_string(), twitter_config);
    config.providers.insert(
        "facebook".to_string(),
        ProviderConfig {
            client_id: Some("fb-client".to_string()),
            client_secret: Some("fb-secret".to_string()),
            ..Default::default()
        },
    );

    let twitter = Arc::new(MockAdapter::new("twitter"));
    let facebook = Arc::new(MockAdapter::new("facebook").with_delay(facebook_delay));

    let mut registry = ProviderRegistry::all_enabled();
    registry.register(twitter.clone()).unwrap();
    registry.register(facebook.clone()).unwrap();

    let cipher = TokenCipher::from_base64_key(&TokenCipher::generate_key()).unwrap();
    let state = AppState::from_config(&config, registry, cipher).unwrap();

    TestApp {
        router: create_router(state, &[]),
        twitter,
        facebook,
    }
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    user: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("X-User-Id", user);
    let request = match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

async fn connect_account(app: &Router, user: &str, provider: &str) -> String {
    let (status, body) = send(
        app,
        "POST",
        &format!("/social-accounts/connect/{}", provider),
        user,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let state = body["state"].as_str().unwrap().to_string();

    let (status, body) = send(
        app,
        "GET",
        &format!(
            "/social-accounts/callback/{}?code=abc&state={}",
            provider, state
        ),
        user,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["integration"]["id"].as_str().unwrap().to_string()
}

fn publish_body(text: &str, integration_ids: &[&str]) -> Value {
    let targets: Vec<Value> = integration_ids
        .iter()
        .map(|id| json!({ "integration_id": id }))
        .collect();
    json!({ "text": text, "targets": targets })
}

/// Find the result for one integration in a publish response.
fn result_for<'a>(body: &'a Value, integration_id: &str) -> &'a Value {
    body["results"]
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["integration_id"] == integration_id)
        .unwrap()
}

#[tokio::test]
async fn test_publish_to_two_accounts() {
    let app = create_test_app(None, Duration::ZERO);
    let tw = connect_account(&app.router, "u1", "twitter").await;
    let fb = connect_account(&app.router, "u1", "facebook").await;

    let (status, body) = send(
        &app.router,
        "POST",
        "/posts/post-1/publish",
        "u1",
        Some(publish_body("Hello world", &[&tw, &fb])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["post_id"], "post-1");
    assert_eq!(body["results"].as_array().unwrap().len(), 2);

    let twitter = result_for(&body, &tw);
    assert_eq!(twitter["provider"], "twitter");
    assert_eq!(twitter["outcome"]["status"], "PUBLISHED");
    assert_eq!(twitter["outcome"]["platform_post_id"], "mock-account-post-1");

    assert_eq!(result_for(&body, &fb)["outcome"]["status"], "PUBLISHED");
    assert_eq!(app.twitter.post_calls(), 1);
    assert_eq!(app.facebook.post_calls(), 1);
}

/// One failing target does not sink the others.
#[tokio::test]
async fn test_publish_partial_failure() {
    let app = create_test_app(None, Duration::ZERO);
    let tw = connect_account(&app.router, "u1", "twitter").await;
    let fb = connect_account(&app.router, "u1", "facebook").await;
    app.facebook.script_post(Err(AdapterError::PlatformRejected(
        "duplicate status".into(),
    )));

    let (status, body) = send(
        &app.router,
        "POST",
        "/posts/post-1/publish",
        "u1",
        Some(publish_body("Hello", &[&tw, &fb, "missing"])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(result_for(&body, &tw)["outcome"]["status"], "PUBLISHED");

    let facebook = &result_for(&body, &fb)["outcome"];
    assert_eq!(facebook["status"], "FAILED");
    assert_eq!(facebook["error_kind"], "PLATFORM_REJECTED");
    assert_eq!(facebook["retryable"], false);
    assert_eq!(app.facebook.post_calls(), 1);

    let missing = result_for(&body, "missing");
    assert_eq!(missing["provider"], Value::Null);
    assert_eq!(missing["outcome"]["error_kind"], "NOT_FOUND");
}

/// Targets owned by another user are reported, never posted to.
#[tokio::test]
async fn test_publish_to_other_users_account() {
    let app = create_test_app(None, Duration::ZERO);
    let tw = connect_account(&app.router, "u1", "twitter").await;

    let (status, body) = send(
        &app.router,
        "POST",
        "/posts/post-1/publish",
        "intruder",
        Some(publish_body("Hello", &[&tw])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result_for(&body, &tw)["outcome"]["error_kind"], "NOT_FOUND");
    assert_eq!(app.twitter.post_calls(), 0);
}

/// The second post inside the window is rejected locally with a wait hint.
#[tokio::test]
async fn test_publish_rate_limited_locally() {
    let app = create_test_app(Some(1), Duration::ZERO);
    let tw = connect_account(&app.router, "u1", "twitter").await;

    let (_, body) = send(
        &app.router,
        "POST",
        "/posts/post-1/publish",
        "u1",
        Some(publish_body("first", &[&tw])),
    )
    .await;
    assert_eq!(result_for(&body, &tw)["outcome"]["status"], "PUBLISHED");

    let (status, body) = send(
        &app.router,
        "POST",
        "/posts/post-2/publish",
        "u1",
        Some(publish_body("second", &[&tw])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let outcome = &result_for(&body, &tw)["outcome"];
    assert_eq!(outcome["status"], "RATE_LIMITED");
    assert!(outcome["retry_after_ms"].as_u64().unwrap() > 0);
    assert_eq!(app.twitter.post_calls(), 1);
}

/// Republishing the same content is answered from the ledger.
#[tokio::test]
async fn test_republish_same_content_is_deduplicated() {
    let app = create_test_app(None, Duration::ZERO);
    let tw = connect_account(&app.router, "u1", "twitter").await;

    for _ in 0..2 {
        let (_, body) = send(
            &app.router,
            "POST",
            "/posts/post-1/publish",
            "u1",
            Some(publish_body("same text", &[&tw])),
        )
        .await;
        assert_eq!(
            result_for(&body, &tw)["outcome"]["platform_post_id"],
            "mock-account-post-1"
        );
    }
    assert_eq!(app.twitter.post_calls(), 1);
}

#[tokio::test]
async fn test_publications_listing() {
    let app = create_test_app(None, Duration::ZERO);
    let tw = connect_account(&app.router, "u1", "twitter").await;

    send(
        &app.router,
        "POST",
        "/posts/post-1/publish",
        "u1",
        Some(publish_body("Hello", &[&tw])),
    )
    .await;

    let (status, body) = send(&app.router, "GET", "/posts/post-1/publications", "u1", None).await;
    assert_eq!(status, StatusCode::OK);
    let publications = body["publications"].as_array().unwrap();
    assert_eq!(publications.len(), 1);
    assert_eq!(publications[0]["integration_id"], tw.as_str());
    assert_eq!(publications[0]["outcome"]["status"], "PUBLISHED");

    // Scoped to the caller
    let (_, body) = send(&app.router, "GET", "/posts/post-1/publications", "u2", None).await;
    assert!(body["publications"].as_array().unwrap().is_empty());
}

/// Cancelling mid-flight marks pending targets cancelled.
#[tokio::test]
async fn test_cancel_in_flight_publish() {
    let app = create_test_app(None, Duration::from_millis(500));
    let fb = connect_account(&app.router, "u1", "facebook").await;

    let router = app.router.clone();
    let fb_target = fb.clone();
    let publish = tokio::spawn(async move {
        send(
            &router,
            "POST",
            "/posts/post-1/publish",
            "u1",
            Some(publish_body("slow", &[&fb_target])),
        )
        .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let (status, body) = send(&app.router, "POST", "/posts/post-1/cancel", "u1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], true);

    let (_, body) = publish.await.unwrap();
    let outcome = &result_for(&body, &fb)["outcome"];
    assert_eq!(outcome["status"], "FAILED");
    assert_eq!(outcome["error_kind"], "CANCELLED");

    // Nothing recorded for a cancelled target
    let (_, body) = send(&app.router, "GET", "/posts/post-1/publications", "u1", None).await;
    assert!(body["publications"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_unknown_post() {
    let app = create_test_app(None, Duration::ZERO);
    let (status, body) = send(&app.router, "POST", "/posts/nope/cancel", "u1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], false);
}

#[tokio::test]
async fn test_publish_validation() {
    let app = create_test_app(None, Duration::ZERO);

    let (status, _) = send(
        &app.router,
        "POST",
        "/posts/post-1/publish",
        "u1",
        Some(json!({ "text": "hi", "targets": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app.router,
        "POST",
        "/posts/post-1/publish",
        "u1",
        Some(json!({ "text": "   ", "targets": [{ "integration_id": "x" }] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let too_many: Vec<String> = (0..51).map(|i| format!("int-{}", i)).collect();
    let ids: Vec<&str> = too_many.iter().map(String::as_str).collect();
    let (status, _) = send(
        &app.router,
        "POST",
        "/posts/post-1/publish",
        "u1",
        Some(publish_body("hi", &ids)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_publish_requires_identity() {
    let app = create_test_app(None, Duration::ZERO);
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/posts/post-1/publish")
                .header("Content-Type", "application/json")
                .body(Body::from(publish_body("hi", &["x"]).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
