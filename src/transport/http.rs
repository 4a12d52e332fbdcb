//! reqwest-backed upstream transport

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::{ForwardAttempt, Upstream, UpstreamFailure, UpstreamResponse};
use crate::Error;

/// HTTP transport for the upstream API
pub struct HttpUpstream {
    /// HTTP client
    client: Client,
    /// Per-attempt timeout (also set on the client)
    timeout: Duration,
}

impl HttpUpstream {
    /// Create a transport with a per-attempt `timeout` that follows at most
    /// `max_redirects` redirects
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the HTTP client cannot be built.
    pub fn new(timeout: Duration, max_redirects: usize) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(max_redirects))
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        Ok(Self { client, timeout })
    }

    fn classify(&self, e: &reqwest::Error) -> UpstreamFailure {
        if e.is_timeout() {
            UpstreamFailure::Timeout(self.timeout)
        } else if e.is_connect() {
            UpstreamFailure::Connect(e.to_string())
        } else {
            UpstreamFailure::Request(e.to_string())
        }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn send(&self, attempt: ForwardAttempt) -> Result<UpstreamResponse, UpstreamFailure> {
        debug!(method = %attempt.method, url = %attempt.url, attempt = attempt.attempt, "Sending upstream request");

        let response = self
            .client
            .request(attempt.method, &attempt.url)
            .headers(attempt.headers)
            .body(attempt.body)
            .send()
            .await
            .map_err(|e| self.classify(&e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| self.classify(&e))?;

        debug!(status = status.as_u16(), bytes = body.len(), "Upstream response received");

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}
