//! Rate-limit middleware
//!
//! Applies the per-client fixed-window limiter to every route. The client is
//! identified by its TCP peer address, or by the first `X-Forwarded-For`
//! entry when the proxy runs behind a trusted load balancer.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request, StatusCode, header::RETRY_AFTER},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::warn;

use crate::failsafe::{Admission, RateLimiter};

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Middleware state
pub struct RateLimitState {
    /// Shared limiter
    pub limiter: Arc<RateLimiter>,
    /// Use `X-Forwarded-For` for the client address
    pub trust_forwarded_for: bool,
}

/// Rate-limit middleware
pub async fn rate_limit_middleware(
    State(state): State<Arc<RateLimitState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.limiter.is_enabled() {
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let client = client_addr(request.headers(), peer, state.trust_forwarded_for);

    match state.limiter.admit(client) {
        Admission::Allow => next.run(request).await,
        Admission::Reject { retry_after_secs } => {
            warn!(client = %client, path = %request.uri().path(), retry_after_secs, "Rate limit exceeded");
            telemetry_metrics::counter!("watsonx_proxy_rate_limited_total").increment(1);
            rate_limited_response(retry_after_secs)
        }
    }
}

/// Address used as the rate-limit key
fn client_addr(headers: &HeaderMap, peer: Option<IpAddr>, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(addr) = forwarded {
            return addr;
        }
    }
    peer.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

fn rate_limited_response(retry_after_secs: u64) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(RETRY_AFTER, retry_after_secs.to_string())],
        Json(json!({
            "error": "Too Many Requests",
            "message": "Rate limit exceeded. Please try again later.",
            "retryAfter": retry_after_secs
        })),
    )
        .into_response()
}
