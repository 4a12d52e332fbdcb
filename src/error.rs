//! Error types for the watsonx proxy

use std::io;

use axum::http::StatusCode;
use serde_json::{Value, json};
use thiserror::Error;

/// Result type alias for the watsonx proxy
pub type Result<T> = std::result::Result<T, Error>;

/// Proxy errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Identity-token exchange failed after its retry budget
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Upstream call timed out on every attempt
    #[error("Gateway timeout: {0}")]
    GatewayTimeout(String),

    /// Upstream call failed at the connection level on every attempt
    #[error("Transport error: {0}")]
    Transport(String),

    /// Outbound request could not be constructed
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Identity-token exchange failure.
///
/// `Clone` because a single refresh result is handed to every caller that
/// was waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Token exchange failed after {attempts} attempt(s): {reason}")]
pub struct AuthError {
    /// Exchange calls made before giving up
    pub attempts: u32,
    /// Last underlying failure
    pub reason: String,
}

impl AuthError {
    /// Create an auth error from the last underlying failure
    pub fn new(attempts: u32, reason: impl Into<String>) -> Self {
        Self {
            attempts,
            reason: reason.into(),
        }
    }
}

impl Error {
    /// HTTP status reported to the client for this error
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short error label used as the `error` field of client responses
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::GatewayTimeout(_) => "Gateway Timeout",
            Self::Auth(_) | Self::Transport(_) | Self::Proxy(_) | Self::Http(_) => "Proxy Error",
            _ => "Internal Server Error",
        }
    }

    /// Human-readable message that never includes internal details
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::GatewayTimeout(_) => "Request to Watsonx timed out",
            Self::Auth(_) | Self::Transport(_) | Self::Proxy(_) | Self::Http(_) => {
                "Failed to proxy request to Watsonx"
            }
            _ => "An unexpected error occurred",
        }
    }

    /// JSON body returned to the client.
    ///
    /// `details` carries the internal error text and is only present when
    /// `expose_details` is set (non-production environments).
    #[must_use]
    pub fn client_body(&self, expose_details: bool) -> Value {
        let mut body = json!({
            "error": self.label(),
            "message": self.public_message(),
        });
        if expose_details {
            body["details"] = Value::String(self.to_string());
        }
        body
    }
}
