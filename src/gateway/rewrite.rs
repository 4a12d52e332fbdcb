//! Path and header rewriting for forwarded requests

use std::borrow::Cow;

use axum::http::header::{ACCEPT, AUTHORIZATION, CONNECTION, CONTENT_TYPE, HeaderName};
use axum::http::{HeaderMap, HeaderValue};
use regex::Regex;

use crate::token::BearerToken;
use crate::{Error, Result};

/// Inbound headers never copied to the upstream request
pub const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "accept-encoding",
];

/// Upstream headers copied back to the client
pub const FORWARDED_RESPONSE_HEADERS: &[&str] = &[
    "content-type",
    "x-request-id",
    "x-correlation-id",
    "cache-control",
];

const INSTANCES_SEGMENT: &str = "/instances/";
const JSON: &str = "application/json";

/// Adds the instance prefix to instance-scoped paths
#[derive(Debug, Clone)]
pub struct PathRewriter {
    pattern: Regex,
    prefix: String,
}

impl PathRewriter {
    /// Create a rewriter for `instance_id`; `pattern` is an unanchored regex
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `pattern` does not compile.
    pub fn new(pattern: &str, instance_id: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("invalid instance path pattern: {e}")))?;
        Ok(Self {
            pattern,
            prefix: format!("/instances/{instance_id}"),
        })
    }

    /// Rewritten path; unchanged unless it matches and has no instance segment
    #[must_use]
    pub fn rewrite<'a>(&self, path: &'a str) -> Cow<'a, str> {
        if self.pattern.is_match(path) && !path.contains(INSTANCES_SEGMENT) {
            Cow::Owned(format!("{}{path}", self.prefix))
        } else {
            Cow::Borrowed(path)
        }
    }
}

/// `{base_url}{path}` plus `?{query}` when a query is present
#[must_use]
pub fn target_url(base_url: &str, path: &str, query: Option<&str>) -> String {
    let base = base_url.trim_end_matches('/');
    match query.filter(|q| !q.is_empty()) {
        Some(q) => format!("{base}{path}?{q}"),
        None => format!("{base}{path}"),
    }
}

/// Build the upstream header set from the client's headers.
///
/// Hop-by-hop headers, headers named in `Connection`, and `accept-encoding`
/// are dropped. `Authorization` is replaced with the bearer token and
/// `Content-Type`/`Accept` default to JSON.
///
/// # Errors
///
/// Returns [`Error::Proxy`] if the token is not a valid header value.
pub fn outbound_headers(inbound: &HeaderMap, token: &BearerToken) -> Result<HeaderMap> {
    let connection_listed: Vec<HeaderName> = inbound
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    let mut headers = HeaderMap::with_capacity(inbound.len() + 3);
    for (name, value) in inbound {
        if STRIPPED_REQUEST_HEADERS.contains(&name.as_str()) || connection_listed.contains(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let mut auth = HeaderValue::from_str(&token.authorization())
        .map_err(|_| Error::Proxy("bearer token is not a valid header value".to_string()))?;
    auth.set_sensitive(true);
    headers.insert(AUTHORIZATION, auth);

    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON));
    }
    if !headers.contains_key(ACCEPT) {
        headers.insert(ACCEPT, HeaderValue::from_static(JSON));
    }

    Ok(headers)
}

/// Whitelisted subset of the upstream response headers
#[must_use]
pub fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in FORWARDED_RESPONSE_HEADERS {
        for value in upstream.get_all(*name) {
            headers.append(HeaderName::from_static(name), value.clone());
        }
    }
    headers
}
