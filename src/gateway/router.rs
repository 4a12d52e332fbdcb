//! HTTP router and handlers

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, HeaderValue, Method, Response as HttpResponse, StatusCode, Uri},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use serde_json::json;
use tower_http::{
    LatencyUnit,
    catch_panic::CatchPanicLayer,
    cors::{self, AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    limit::RequestBodyLimitLayer,
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, error};

use super::proxy::{Forwarder, InboundRequest};
use super::rate_limit::{RateLimitState, rate_limit_middleware};
use super::trace::MakeProxyRequestId;
use crate::Error;
use crate::config::ServerConfig;
use crate::failsafe::{HealthReporter, HealthStatus};
use crate::token::TokenManager;

/// Shared application state
pub struct AppState {
    /// Forwarding pipeline
    pub forwarder: Forwarder,
    /// Token manager, for service info
    pub tokens: TokenManager,
    /// Health reporter
    pub health: Arc<HealthReporter>,
    /// Upstream instance id
    pub instance_id: String,
    /// Deployment environment name
    pub environment: String,
    /// Include internal error text in client error bodies
    pub expose_details: bool,
    /// Process start, for uptime
    pub started_at: Instant,
}

/// Create the router
pub fn create_router(state: Arc<AppState>, limits: Arc<RateLimitState>, server: &ServerConfig) -> Router {
    let expose_details = state.expose_details;

    Router::new()
        .route("/", get(service_info_handler).fallback(proxy_handler))
        .route("/health", get(health_handler).fallback(proxy_handler))
        .fallback(proxy_handler)
        .layer(middleware::from_fn_with_state(limits, rate_limit_middleware))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(server.max_body_size))
        .layer(cors_layer(server))
        .layer(CatchPanicLayer::custom(move |panic| panic_response(panic, expose_details)))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(
                    DefaultOnResponse::new()
                        .level(Level::INFO)
                        .latency_unit(LatencyUnit::Millis),
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeProxyRequestId))
        .with_state(state)
}

/// CORS for `*` (no credentials) or an explicit origin list (with credentials)
fn cors_layer(server: &ServerConfig) -> CorsLayer {
    match server.cors_origin_list() {
        None => CorsLayer::new()
            .allow_origin(cors::Any)
            .allow_methods(cors::Any)
            .allow_headers(cors::Any),
        Some(origins) => {
            let origins: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(AllowMethods::mirror_request())
                .allow_headers(AllowHeaders::mirror_request())
                .allow_credentials(true)
        }
    }
}

/// GET / - service information
async fn service_info_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.tokens.snapshot();

    Json(json!({
        "service": "Watsonx Orchestrate Proxy",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": {
            "health": "/health",
            "orchestrate": {
                "agents": "/v1/orchestrate/agents",
                "skills": "/v1/orchestrate/skills",
                "threads": "/v1/orchestrate/threads"
            },
            "api": "/* (proxies all requests to Watsonx)"
        },
        "instance": state.instance_id,
        "tokenCached": snapshot.cached,
        "tokenExpiry": snapshot.expires_at,
        "environment": state.environment
    }))
}

/// GET /health - token health
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.health.check().await {
        HealthStatus::Healthy { token_expiry } => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "message": "Watsonx proxy is running and authenticated",
                "tokenValid": true,
                "tokenExpiry": token_expiry,
                "instance": state.instance_id,
                "uptimeSeconds": state.started_at.elapsed().as_secs()
            })),
        ),
        HealthStatus::Unhealthy { error } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "message": "Failed to authenticate with Watsonx",
                "error": error.to_string(),
                "tokenValid": false
            })),
        ),
    }
}

/// Everything else - forwarded upstream
async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let inbound = InboundRequest {
        method,
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        headers,
        body,
    };

    match state.forwarder.forward(inbound).await {
        Ok(upstream) => {
            let mut response = Response::new(Body::from(upstream.body));
            *response.status_mut() = upstream.status;
            *response.headers_mut() = upstream.headers;
            response
        }
        Err(e) => error_response(&e, state.expose_details),
    }
}

/// JSON error response for `e`
fn error_response(e: &Error, expose_details: bool) -> Response {
    (e.status_code(), Json(e.client_body(expose_details))).into_response()
}

fn panic_response(panic: Box<dyn Any + Send + 'static>, expose_details: bool) -> HttpResponse<Body> {
    let message = panic
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| panic.downcast_ref::<&str>().map(|s| (*s).to_string()))
        .unwrap_or_else(|| "handler panicked".to_string());
    error!(panic = %message, "Unhandled panic in request handler");

    error_response(&Error::Internal(message), expose_details)
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use serde_json::Value;

    use super::*;

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_error_response_hides_details_in_production() {
        let err = Error::GatewayTimeout("no response within 30s".into());

        let response = error_response(&err, false);
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let body = json_body(response).await;
        assert_eq!(body["error"], "Gateway Timeout");
        assert!(body.get("details").is_none());
    }

    #[tokio::test]
    async fn test_error_response_includes_details_outside_production() {
        let err = Error::Transport("connection refused".into());

        let body = json_body(error_response(&err, true)).await;
        assert_eq!(body["error"], "Proxy Error");
        assert!(body["details"].as_str().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_panic_response_is_generic_500() {
        let response = panic_response(Box::new("boom"), false);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error"], "Internal Server Error");
        assert_eq!(body["message"], "An unexpected error occurred");
    }

    #[test]
    fn test_cors_layers_are_usable() {
        // Layering panics on invalid credential/wildcard combinations
        let mut server = ServerConfig::default();
        let _: Router = Router::new().layer(cors_layer(&server));
        server.cors_origins = "https://a.example, https://b.example".to_string();
        let _: Router = Router::new().layer(cors_layer(&server));
    }
}
