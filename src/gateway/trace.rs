//! Request ID generation.
//!
//! Every request gets an `x-request-id` (kept if the client already sent
//! one). The ID is echoed on the response and, because inbound headers are
//! forwarded, reaches the upstream as well.

use axum::http::{HeaderValue, Request};
use tower_http::request_id::{MakeRequestId, RequestId};
use uuid::Uuid;

/// Generate a new request ID: a UUID v4 string.
#[must_use]
pub fn generate() -> String {
    Uuid::new_v4().to_string()
}

/// [`MakeRequestId`] backed by [`generate`]
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeProxyRequestId;

impl MakeRequestId for MakeProxyRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&generate()).ok().map(RequestId::new)
    }
}
