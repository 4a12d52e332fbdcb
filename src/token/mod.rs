//! Bearer token lifecycle
//!
//! - [`IdentityExchange`]: seam over the IAM API-key exchange
//! - [`TokenManager`]: caches one token, refreshes it ahead of expiry and
//!   coalesces concurrent refreshes into a single exchange

mod exchange;
mod manager;

pub use exchange::{ExchangeError, IamExchange, IdentityExchange, IssuedToken};
pub use manager::{RefreshStats, TokenManager, TokenSnapshot};

use crate::secrets::Secret;

/// Short-lived bearer credential for the upstream API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerToken(Secret);

impl BearerToken {
    /// Wrap a raw token
    pub fn new(token: impl Into<Secret>) -> Self {
        Self(token.into())
    }

    /// Raw token value. Callers must not log it.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.expose()
    }

    /// `Authorization` header value
    #[must_use]
    pub fn authorization(&self) -> String {
        format!("Bearer {}", self.0.expose())
    }
}
