//! Forwarding pipeline
//!
//! Rewrites the client request for the upstream, injects the bearer token and
//! retries network-level failures with exponential backoff. Any HTTP status
//! the upstream returns is final.

use std::sync::Arc;

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, error, warn};

use super::rewrite::{self, PathRewriter};
use crate::config::UpstreamConfig;
use crate::error::AuthError;
use crate::failsafe::{Exhausted, RetryPolicy, with_retry};
use crate::token::TokenManager;
use crate::transport::{ForwardAttempt, Upstream, UpstreamFailure, UpstreamResponse};
use crate::{Error, Result};

/// Client request as received by the proxy
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// HTTP method
    pub method: Method,
    /// Request path, without query
    pub path: String,
    /// Raw query string
    pub query: Option<String>,
    /// Client headers
    pub headers: HeaderMap,
    /// Raw body
    pub body: Bytes,
}

/// Failure of a single forwarding attempt
#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Upstream(#[from] UpstreamFailure),
    #[error(transparent)]
    Build(Error),
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        !matches!(self, Self::Build(_))
    }

    fn outcome(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth_error",
            Self::Upstream(f) if f.is_timeout() => "timeout",
            Self::Upstream(_) => "network_error",
            Self::Build(_) => "invalid_request",
        }
    }

    fn into_error(self, attempts: u32) -> Error {
        match self {
            Self::Auth(e) => Error::Auth(e),
            Self::Upstream(UpstreamFailure::Timeout(timeout)) => Error::GatewayTimeout(format!(
                "no response within {timeout:?} after {attempts} attempt(s)"
            )),
            Self::Upstream(e) => Error::Transport(format!("{e} (after {attempts} attempt(s))")),
            Self::Build(e) => e,
        }
    }
}

/// Forwards client requests to the upstream API
pub struct Forwarder {
    upstream: Arc<dyn Upstream>,
    tokens: TokenManager,
    rewriter: PathRewriter,
    base_url: String,
    policy: RetryPolicy,
}

impl Forwarder {
    /// Create a forwarder
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the instance path pattern is invalid.
    pub fn new(config: &UpstreamConfig, tokens: TokenManager, upstream: Arc<dyn Upstream>) -> Result<Self> {
        Ok(Self {
            upstream,
            tokens,
            rewriter: PathRewriter::new(&config.instance_path_pattern, &config.instance_id)?,
            base_url: config.base_url.clone(),
            policy: RetryPolicy::new(config.retries, config.retry_base_delay),
        })
    }

    /// Forward `inbound` and return the upstream response, whatever its status.
    ///
    /// Makes at most `retries + 1` upstream calls.
    ///
    /// # Errors
    ///
    /// - [`Error::GatewayTimeout`] if the last attempt timed out
    /// - [`Error::Auth`] if no bearer token could be obtained
    /// - [`Error::Transport`] for other network failures
    /// - [`Error::Proxy`] if the outbound request could not be built
    pub async fn forward(&self, inbound: InboundRequest) -> Result<UpstreamResponse> {
        let path = self.rewriter.rewrite(&inbound.path);
        let url = rewrite::target_url(&self.base_url, &path, inbound.query.as_deref());
        debug!(method = %inbound.method, path = %inbound.path, target = %url, "Proxying request");

        let result = with_retry(&self.policy, "forward", AttemptError::is_retryable, |attempt| {
            self.attempt(&inbound, &url, attempt)
        })
        .await;

        match result {
            Ok(response) => {
                debug!(status = response.status.as_u16(), "Upstream responded");
                let headers = rewrite::response_headers(&response.headers);
                Ok(UpstreamResponse { headers, ..response })
            }
            Err(Exhausted { attempts, error: e }) => {
                error!(
                    method = %inbound.method,
                    path = %inbound.path,
                    attempts,
                    error = %e,
                    "Proxy request failed after retries"
                );
                Err(e.into_error(attempts))
            }
        }
    }

    async fn attempt(
        &self,
        inbound: &InboundRequest,
        url: &str,
        attempt: u32,
    ) -> std::result::Result<UpstreamResponse, AttemptError> {
        let outcome = self.try_attempt(inbound, url, attempt).await;

        let label = match &outcome {
            Ok(_) => "response",
            Err(e) => {
                warn!(attempt = attempt + 1, error = %e, "Upstream attempt failed");
                e.outcome()
            }
        };
        telemetry_metrics::counter!("watsonx_proxy_upstream_attempts_total", "outcome" => label)
            .increment(1);

        outcome
    }

    async fn try_attempt(
        &self,
        inbound: &InboundRequest,
        url: &str,
        attempt: u32,
    ) -> std::result::Result<UpstreamResponse, AttemptError> {
        let token = self.tokens.valid_token().await?;
        let headers = rewrite::outbound_headers(&inbound.headers, &token).map_err(AttemptError::Build)?;

        let response = self
            .upstream
            .send(ForwardAttempt {
                method: inbound.method.clone(),
                url: url.to_string(),
                headers,
                body: inbound.body.clone(),
                attempt,
            })
            .await?;

        Ok(response)
    }
}
