//! Mock-based tests for the proxy path.
//!
//! These tests use wiremock to simulate upstream providers and drive the
//! full router, covering forwarding, alias rewriting, failover, quota
//! denial, and streaming accounting.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use indexmap::IndexMap;
use modelrelay::core::config::{
    ConfigStore, ModelBinding, ProviderConfig, RateLimits, RoutingConfig,
};
use modelrelay::{AppState, router};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct TestApp {
    app: Router,
    state: Arc<AppState>,
    _dir: TempDir,
}

fn provider(base_url: &str, api_key: &str, limits: RateLimits) -> ProviderConfig {
    ProviderConfig {
        base_url: base_url.to_string(),
        api_key: api_key.to_string(),
        limits,
        timeout: Some(5),
    }
}

fn binding(alias: Option<&str>) -> ModelBinding {
    ModelBinding {
        alias: alias.map(str::to_string),
        enable: true,
    }
}

/// Build an app whose `gpt-4o` model is bound to the given providers in
/// order.
fn build_app(providers: Vec<(&str, ProviderConfig, Option<&str>)>) -> TestApp {
    let mut api_provider = IndexMap::new();
    let mut bindings = IndexMap::new();
    for (name, config, alias) in providers {
        api_provider.insert(name.to_string(), config);
        bindings.insert(name.to_string(), binding(alias));
    }

    let mut model_config = IndexMap::new();
    model_config.insert("gpt-4o".to_string(), bindings);

    let config = RoutingConfig {
        api_provider,
        model_config,
        extra: IndexMap::new(),
    };

    let dir = TempDir::new().unwrap();
    let store = ConfigStore::new(dir.path().join("config.yaml"), config).unwrap();
    let state = Arc::new(AppState::new(Arc::new(store)));
    TestApp {
        app: router(state.clone()),
        state,
        _dir: dir,
    }
}

fn chat_request(payload: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("Content-Type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_simple_forward_hits_provider_with_credentials() {
    let upstream = MockServer::start().await;
    let upstream_body = json!({
        "id": "chatcmpl-1",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}}],
        "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
    });
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer sk-p1"))
        .and(body_partial_json(json!({"model": "gpt-4o"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(upstream_body.clone()))
        .expect(1)
        .mount(&upstream)
        .await;

    let harness = build_app(vec![(
        "p1",
        provider(
            &upstream.uri(),
            "sk-p1",
            RateLimits {
                rpm: Some(10),
                ..Default::default()
            },
        ),
        None,
    )]);

    let response = harness
        .app
        .oneshot(chat_request(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Hello"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body, upstream_body);

    let snapshot = harness.state.config.snapshot();
    let status = harness
        .state
        .limiter
        .status("p1", &snapshot.api_provider["p1"].limits);
    assert_eq!(status.rpm_used, 1);
    assert_eq!(status.tpm_used, 5);

    let records = harness.state.ledger.recent(10);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].total_tokens, 5);
}

#[tokio::test]
async fn test_alias_rewrites_model_upstream_only() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "gpt4o-mini"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-2",
            "model": "gpt4o-mini",
            "choices": []
        })))
        .expect(1)
        .mount(&upstream)
        .await;

    let harness = build_app(vec![(
        "p1",
        provider(&upstream.uri(), "sk-p1", RateLimits::default()),
        Some("gpt4o-mini"),
    )]);

    let response = harness
        .app
        .oneshot(chat_request(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Hello"}]
        })))
        .await
        .unwrap();

    // The upstream body is returned verbatim; the alias only affects the
    // outbound request, which the mock's matcher already verified.
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_failover_rolls_back_and_tries_next_provider() {
    let failing = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .expect(1)
        .mount(&failing)
        .await;

    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-3",
            "choices": [],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
        })))
        .expect(1)
        .mount(&healthy)
        .await;

    let harness = build_app(vec![
        (
            "p1",
            provider(&failing.uri(), "sk-p1", RateLimits::default()),
            None,
        ),
        (
            "p2",
            provider(&healthy.uri(), "sk-p2", RateLimits::default()),
            None,
        ),
    ]);

    let response = harness
        .app
        .oneshot(chat_request(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Hello"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let limits = RateLimits::default();
    // p1's reserve was rolled back, p2 holds the request.
    assert_eq!(harness.state.limiter.status("p1", &limits).rpm_used, 0);
    assert_eq!(harness.state.limiter.status("p2", &limits).rpm_used, 1);

    // Both attempts are in the ledger: one failure, one success.
    let records = harness.state.ledger.recent(10);
    assert_eq!(records.len(), 2);
}

#[tokio::test]
async fn test_all_providers_failing_returns_502() {
    let failing = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("down"))
        .mount(&failing)
        .await;

    let harness = build_app(vec![(
        "p1",
        provider(&failing.uri(), "sk-p1", RateLimits::default()),
        None,
    )]);

    let response = harness
        .app
        .oneshot(chat_request(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Hello"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_string(response).await;
    assert!(body.contains("upstream"));
}

#[tokio::test]
async fn test_quota_exhaustion_returns_503_without_reserving() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
        .expect(0)
        .mount(&upstream)
        .await;

    let limits = RateLimits {
        rpm: Some(1),
        ..Default::default()
    };
    let harness = build_app(vec![(
        "p1",
        provider(&upstream.uri(), "sk-p1", limits.clone()),
        None,
    )]);

    // One request already in flight.
    let _ticket = harness.state.limiter.reserve("p1");

    let response = harness
        .app
        .oneshot(chat_request(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Hello"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_string(response).await;
    assert!(body.contains("rpm"));
    assert!(body.contains("p1"));

    // No second reserve was taken.
    assert_eq!(harness.state.limiter.status("p1", &limits).rpm_used, 1);
}

#[tokio::test]
async fn test_unknown_model_returns_503_with_reason() {
    let harness = build_app(vec![(
        "p1",
        provider("https://unused.test/v1", "sk-p1", RateLimits::default()),
        None,
    )]);

    let response = harness
        .app
        .oneshot(chat_request(json!({
            "model": "no-such-model",
            "messages": [{"role": "user", "content": "Hello"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_missing_model_field_is_a_bad_request() {
    let harness = build_app(vec![(
        "p1",
        provider("https://unused.test/v1", "sk-p1", RateLimits::default()),
        None,
    )]);

    let response = harness
        .app
        .oneshot(chat_request(json!({
            "messages": [{"role": "user", "content": "Hello"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_streaming_relays_chunks_and_commits_usage() {
    let sse_body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"!\"}}]}\n\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":30,\"total_tokens\":42}}\n\n",
        "data: [DONE]\n\n"
    );

    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .expect(1)
        .mount(&upstream)
        .await;

    let harness = build_app(vec![(
        "p1",
        provider(&upstream.uri(), "sk-p1", RateLimits::default()),
        None,
    )]);

    let response = harness
        .app
        .oneshot(chat_request(json!({
            "model": "gpt-4o",
            "stream": true,
            "messages": [{"role": "user", "content": "Hello"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let body = body_string(response).await;
    assert!(body.contains("Hel"));
    assert!(body.contains("lo"));
    assert!(body.contains("data: [DONE]"));

    // The provider-reported usage was committed against tpm.
    let status = harness.state.limiter.status("p1", &RateLimits::default());
    assert_eq!(status.tpm_used, 42);
    assert_eq!(status.rpm_used, 1);

    let records = harness.state.ledger.recent(10);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].total_tokens, 42);
}

#[tokio::test]
async fn test_streaming_without_usage_commits_estimate() {
    let sse_body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"abcd\"}}]}\n\n",
        "data: [DONE]\n\n"
    );

    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .mount(&upstream)
        .await;

    let harness = build_app(vec![(
        "p1",
        provider(&upstream.uri(), "sk-p1", RateLimits::default()),
        None,
    )]);

    let response = harness
        .app
        .oneshot(chat_request(json!({
            "model": "gpt-4o",
            "stream": true,
            "max_tokens": 10,
            "messages": [{"role": "user", "content": "Hello"}]
        })))
        .await
        .unwrap();

    let _ = body_string(response).await;

    // hint (10) + ceil(4 chars / 4) = 11.
    let status = harness.state.limiter.status("p1", &RateLimits::default());
    assert_eq!(status.tpm_used, 11);
}

#[tokio::test]
async fn test_mid_stream_garbage_aborts_without_failover() {
    let sse_body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
        "<html>502 from some intermediate proxy</html>\n\n"
    );

    let broken = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .expect(1)
        .mount(&broken)
        .await;

    let fallback = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
        .expect(0)
        .mount(&fallback)
        .await;

    let harness = build_app(vec![
        (
            "p1",
            provider(&broken.uri(), "sk-p1", RateLimits::default()),
            None,
        ),
        (
            "p2",
            provider(&fallback.uri(), "sk-p2", RateLimits::default()),
            None,
        ),
    ]);

    let response = harness
        .app
        .oneshot(chat_request(json!({
            "model": "gpt-4o",
            "stream": true,
            "max_tokens": 10,
            "messages": [{"role": "user", "content": "Hello"}]
        })))
        .await
        .unwrap();

    // The stream begins as a 200; the failure surfaces inside the stream.
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("Hi"));
    assert!(body.contains("event: error"));
    assert!(body.ends_with("data: [DONE]\n\n"));

    // Observed usage was committed: hint (10) + ceil(2 chars / 4) = 11.
    let status = harness.state.limiter.status("p1", &RateLimits::default());
    assert_eq!(status.tpm_used, 11);
    assert_eq!(status.rpm_used, 1);

    let records = harness.state.ledger.recent(10);
    assert_eq!(records.len(), 1);
    assert!(records[0].error.is_some());
}

#[tokio::test]
async fn test_list_models_includes_auto_first() {
    let harness = build_app(vec![(
        "p1",
        provider("https://unused.test/v1", "sk-p1", RateLimits::default()),
        None,
    )]);

    let response = harness
        .app
        .oneshot(
            Request::builder()
                .uri("/v1/models")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["object"], "list");
    assert_eq!(body["data"][0]["id"], "auto");
    assert_eq!(body["data"][1]["id"], "gpt-4o");
}

#[tokio::test]
async fn test_api_usage_reports_window_state() {
    let harness = build_app(vec![(
        "p1",
        provider(
            "https://unused.test/v1",
            "sk-p1",
            RateLimits {
                rpm: Some(10),
                ..Default::default()
            },
        ),
        None,
    )]);

    let ticket = harness.state.limiter.reserve("p1");
    harness.state.limiter.commit(ticket, 25);

    let response = harness
        .app
        .oneshot(
            Request::builder()
                .uri("/api_usage")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["data"]["p1"]["rpm"]["current"], 1);
    assert_eq!(body["data"]["p1"]["rpm"]["limit"], 10);
    assert_eq!(body["data"]["p1"]["tpm"]["current"], 25);
}
