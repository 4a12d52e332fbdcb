//! Identity-token exchange
//!
//! Trades the long-lived IAM API key for a short-lived bearer token.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use super::BearerToken;
use crate::secrets::Secret;

/// Longest issuer body excerpt carried in an error
const MAX_ERROR_BODY: usize = 256;

/// Token as returned by the issuer
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// The bearer credential
    pub token: BearerToken,
    /// Lifetime in seconds, if the issuer reported one
    pub expires_in: Option<u64>,
}

/// Failure of a single exchange call
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The call did not complete within the exchange timeout
    #[error("IAM request timed out after {0:?}")]
    Timeout(Duration),

    /// Connection or protocol failure
    #[error("IAM request failed: {0}")]
    Network(String),

    /// Issuer answered with a non-success status
    #[error("IAM endpoint returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Truncated response body
        body: String,
    },

    /// Issuer body was not the expected JSON document
    #[error("IAM response could not be parsed: {0}")]
    Malformed(String),

    /// Issuer body had no usable `token` field
    #[error("IAM response did not contain a token")]
    MissingToken,
}

impl ExchangeError {
    /// Whether another attempt could succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Network(_) | Self::Status { .. }
        )
    }
}

/// Source of bearer tokens
#[async_trait]
pub trait IdentityExchange: Send + Sync {
    /// Exchange `api_key` for a fresh bearer token
    async fn exchange(&self, api_key: &Secret) -> Result<IssuedToken, ExchangeError>;
}

#[derive(Debug, Deserialize)]
struct IamTokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// IAM API-key exchange over HTTPS
pub struct IamExchange {
    client: Client,
    url: String,
    timeout: Duration,
}

impl IamExchange {
    /// Create an exchange against `url` with a per-call `timeout`
    #[must_use]
    pub fn new(client: Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl IdentityExchange for IamExchange {
    async fn exchange(&self, api_key: &Secret) -> Result<IssuedToken, ExchangeError> {
        debug!(url = %self.url, "Requesting bearer token");

        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .json(&json!({ "apikey": api_key.expose() }))
            .send()
            .await
            .map_err(|e| self.classify(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Status {
                status: status.as_u16(),
                body: truncate(&body, MAX_ERROR_BODY),
            });
        }

        let bytes = response.bytes().await.map_err(|e| self.classify(&e))?;
        let parsed: IamTokenResponse =
            serde_json::from_slice(&bytes).map_err(|e| ExchangeError::Malformed(e.to_string()))?;

        match parsed.token {
            Some(token) if !token.is_empty() => Ok(IssuedToken {
                token: BearerToken::new(token),
                expires_in: parsed.expires_in,
            }),
            _ => Err(ExchangeError::MissingToken),
        }
    }
}

impl IamExchange {
    fn classify(&self, e: &reqwest::Error) -> ExchangeError {
        if e.is_timeout() {
            ExchangeError::Timeout(self.timeout)
        } else {
            ExchangeError::Network(e.to_string())
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
