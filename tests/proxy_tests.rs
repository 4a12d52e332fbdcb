//! End-to-end router tests: mock IAM endpoint and mock upstream API
//!
//! Requests are driven through the full layer stack with
//! `tower::ServiceExt::oneshot`, so no listener is bound by the proxy itself.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::ServiceExt;
use wiremock::matchers::{body_string, header as header_is, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use watsonx_proxy::config::Config;
use watsonx_proxy::gateway::Gateway;
use watsonx_proxy::secrets::Secret;
use watsonx_proxy::token::TokenManager;
use watsonx_proxy::transport::HttpUpstream;

const INSTANCE: &str = "inst-test";
const IAM_PATH: &str = "/siusermgr/api/1.0/apikeys/token";

struct Harness {
    iam: MockServer,
    upstream: MockServer,
    app: Router,
}

/// Proxy wired to mock IAM and upstream servers
async fn harness(tweak: impl FnOnce(&mut Config)) -> Harness {
    let iam = MockServer::start().await;
    let upstream = MockServer::start().await;

    let mut config = Config::default();
    config.token.api_key = Some(Secret::from("test-api-key"));
    config.token.iam_url = format!("{}{IAM_PATH}", iam.uri());
    config.token.retries = 0;
    config.upstream.base_url = upstream.uri();
    config.upstream.instance_id = INSTANCE.to_string();
    config.upstream.request_timeout = Duration::from_millis(300);
    config.upstream.retry_base_delay = Duration::from_millis(10);
    config.health_check.interval = Duration::ZERO;
    tweak(&mut config);

    let tokens = TokenManager::with_iam(
        &config.token,
        Secret::from("test-api-key"),
        reqwest::Client::new(),
    );
    let transport =
        HttpUpstream::new(config.upstream.request_timeout, config.upstream.max_redirects).unwrap();
    let gateway = Gateway::with_parts(config, tokens, Arc::new(transport)).unwrap();

    Harness {
        iam,
        upstream,
        app: gateway.router(),
    }
}

async fn mount_iam_token(iam: &MockServer) {
    Mock::given(method("POST"))
        .and(path(IAM_PATH))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "token": "bearer-abc", "expires_in": 7200 })),
        )
        .mount(iam)
        .await;
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_service_info() {
    let h = harness(|_| {}).await;

    let (status, _, body) = send(&h.app, get("/")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "Watsonx Orchestrate Proxy");
    assert_eq!(body["status"], "running");
    assert_eq!(body["instance"], INSTANCE);
    assert_eq!(body["tokenCached"], false);
    assert_eq!(body["endpoints"]["orchestrate"]["agents"], "/v1/orchestrate/agents");
    assert_eq!(body["environment"], "development");
}

#[tokio::test]
async fn test_health_ok_with_working_exchange() {
    let h = harness(|_| {}).await;
    mount_iam_token(&h.iam).await;

    let (status, _, body) = send(&h.app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["tokenValid"], true);
    assert_eq!(body["instance"], INSTANCE);
    assert!(body["tokenExpiry"].is_string());
}

#[tokio::test]
async fn test_health_unavailable_when_exchange_fails() {
    let h = harness(|_| {}).await;
    Mock::given(method("POST"))
        .and(path(IAM_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .expect(1)
        .mount(&h.iam)
        .await;

    let (status, _, body) = send(&h.app, get("/health")).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["message"], "Failed to authenticate with Watsonx");
    assert_eq!(body["tokenValid"], false);
    assert!(body["error"].as_str().unwrap().contains("401"));
}

#[tokio::test]
async fn test_instance_path_is_rewritten_with_bearer_token() {
    let h = harness(|_| {}).await;
    mount_iam_token(&h.iam).await;
    Mock::given(method("POST"))
        .and(path(format!("/instances/{INSTANCE}/v1/orchestrate/agents")))
        .and(query_param("limit", "5"))
        .and(header_is("authorization", "Bearer bearer-abc"))
        .and(body_string(r#"{"name":"helper"}"#))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "agent-1" })))
        .expect(1)
        .mount(&h.upstream)
        .await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/orchestrate/agents?limit=5")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"name":"helper"}"#))
        .unwrap();
    let (status, _, body) = send(&h.app, request).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], "agent-1");
}

#[tokio::test]
async fn test_hop_by_hop_headers_are_stripped() {
    let h = harness(|_| {}).await;
    mount_iam_token(&h.iam).await;
    Mock::given(method("GET"))
        .and(path("/v2/skills"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&h.upstream)
        .await;

    let request = Request::builder()
        .uri("/v2/skills")
        .header("x-custom", "kept")
        .header("keep-alive", "timeout=5")
        .header("upgrade", "websocket")
        .header(header::AUTHORIZATION, "Bearer client-supplied")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::OK);

    let received = h.upstream.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let headers = &received[0].headers;
    assert_eq!(headers.get("x-custom").unwrap(), "kept");
    assert_eq!(headers.get("authorization").unwrap(), "Bearer bearer-abc");
    assert_eq!(headers.get("content-type").unwrap(), "application/json");
    assert!(headers.get("keep-alive").is_none());
    assert!(headers.get("upgrade").is_none());
}

#[tokio::test]
async fn test_upstream_error_status_passes_through_once() {
    let h = harness(|_| {}).await;
    mount_iam_token(&h.iam).await;
    Mock::given(method("GET"))
        .and(path("/v2/missing"))
        .respond_with(
            ResponseTemplate::new(404)
                .set_body_json(json!({ "error": "not found" }))
                .insert_header("set-cookie", "session=upstream"),
        )
        .expect(1)
        .mount(&h.upstream)
        .await;

    let (status, headers, body) = send(&h.app, get("/v2/missing")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "error": "not found" }));
    assert!(headers.get("set-cookie").is_none());
}

#[tokio::test]
async fn test_post_to_health_is_forwarded() {
    let h = harness(|_| {}).await;
    mount_iam_token(&h.iam).await;
    Mock::given(method("POST"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({ "upstream": true })))
        .expect(1)
        .mount(&h.upstream)
        .await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/health")
        .body(Body::from("{}"))
        .unwrap();
    let (status, _, body) = send(&h.app, request).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["upstream"], true);
}

#[tokio::test]
async fn test_timeouts_give_gateway_timeout_after_three_attempts() {
    let h = harness(|_| {}).await;
    mount_iam_token(&h.iam).await;
    Mock::given(method("GET"))
        .and(path("/v2/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .expect(3)
        .mount(&h.upstream)
        .await;

    let (status, _, body) = send(&h.app, get("/v2/slow")).await;

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error"], "Gateway Timeout");
    assert_eq!(body["message"], "Request to Watsonx timed out");
    assert!(body["details"].is_string());
}

#[tokio::test]
async fn test_production_errors_omit_details() {
    let h = harness(|config| config.server.environment = "production".to_string()).await;
    mount_iam_token(&h.iam).await;
    Mock::given(method("GET"))
        .and(path("/v2/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&h.upstream)
        .await;

    let (status, _, body) = send(&h.app, get("/v2/slow")).await;

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert!(body.get("details").is_none());
}

#[tokio::test]
async fn test_rate_limit_rejects_with_retry_after() {
    let h = harness(|config| config.rate_limit.max_requests = 2).await;

    for _ in 0..2 {
        let (status, _, _) = send(&h.app, get("/")).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, headers, body) = send(&h.app, get("/")).await;

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = headers[header::RETRY_AFTER].to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));
    assert_eq!(body["error"], "Too Many Requests");
    assert_eq!(body["message"], "Rate limit exceeded. Please try again later.");
    assert_eq!(body["retryAfter"], retry_after);
}

#[tokio::test]
async fn test_responses_carry_request_id() {
    let h = harness(|_| {}).await;

    let (_, headers, _) = send(&h.app, get("/")).await;

    assert!(headers.contains_key("x-request-id"));
}
