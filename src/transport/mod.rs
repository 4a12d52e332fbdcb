//! Upstream transport

mod http;

pub use self::http::HttpUpstream;

use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use thiserror::Error;

/// One outbound call; rebuilt for every retry
#[derive(Debug, Clone)]
pub struct ForwardAttempt {
    /// HTTP method, taken from the client request
    pub method: Method,
    /// Absolute target URL including the query string
    pub url: String,
    /// Outbound headers after the header policy
    pub headers: HeaderMap,
    /// Raw request body
    pub body: Bytes,
    /// Zero-based attempt index
    pub attempt: u32,
}

/// Response received from the upstream, any status
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    /// Upstream status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Raw response body
    pub body: Bytes,
}

/// Network-level failure of a single call
#[derive(Debug, Error)]
pub enum UpstreamFailure {
    /// No complete response within the request timeout
    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),

    /// Connection could not be established
    #[error("upstream connection failed: {0}")]
    Connect(String),

    /// Any other failure while sending or reading the response
    #[error("upstream request failed: {0}")]
    Request(String),
}

impl UpstreamFailure {
    /// Whether this failure was a timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Sends forward attempts to the upstream API
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send one attempt. Non-2xx statuses are returned as `Ok`.
    async fn send(&self, attempt: ForwardAttempt) -> Result<UpstreamResponse, UpstreamFailure>;
}
