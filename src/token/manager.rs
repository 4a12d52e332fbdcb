//! Token manager
//!
//! Holds at most one cached bearer token and at most one in-flight refresh.
//! Every caller that finds the token missing or expired awaits the same
//! shared refresh future, so N concurrent callers cost one exchange.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::{BearerToken, ExchangeError, IamExchange, IdentityExchange};
use crate::config::TokenConfig;
use crate::error::AuthError;
use crate::failsafe::{Exhausted, RetryPolicy, with_retry};
use crate::secrets::Secret;

/// Upper bound on how long a single token is trusted
const MAX_VALIDITY: Duration = Duration::from_secs(30 * 24 * 3600);

type RefreshFuture = Shared<BoxFuture<'static, Result<BearerToken, AuthError>>>;

struct CachedToken {
    token: BearerToken,
    expires_at: Instant,
    expires_at_utc: DateTime<Utc>,
}

#[derive(Default)]
struct TokenState {
    token: Option<CachedToken>,
    in_flight: Option<RefreshFuture>,
}

/// Cached-token view for the service-info endpoint
#[derive(Debug, Clone, Serialize)]
pub struct TokenSnapshot {
    /// Whether a token is held, expired or not
    pub cached: bool,
    /// When the held token stops being used
    pub expires_at: Option<DateTime<Utc>>,
}

/// Refresh counters since startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshStats {
    /// Exchange calls made
    pub attempts: u64,
    /// Refreshes that produced a token
    pub successes: u64,
    /// Refreshes that gave up
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

struct Inner {
    exchange: Arc<dyn IdentityExchange>,
    api_key: Secret,
    policy: RetryPolicy,
    default_lifetime: Duration,
    refresh_buffer: Duration,
    state: Mutex<TokenState>,
    counters: Counters,
}

/// Owner of the cached bearer token; cheap to clone
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

impl TokenManager {
    /// Create a manager over an arbitrary exchange
    #[must_use]
    pub fn new(config: &TokenConfig, api_key: Secret, exchange: Arc<dyn IdentityExchange>) -> Self {
        Self {
            inner: Arc::new(Inner {
                exchange,
                api_key,
                policy: RetryPolicy::new(config.retries, config.retry_base_delay),
                default_lifetime: config.default_lifetime,
                refresh_buffer: config.refresh_buffer,
                state: Mutex::new(TokenState::default()),
                counters: Counters::default(),
            }),
        }
    }

    /// Create a manager that exchanges against `config.iam_url`
    #[must_use]
    pub fn with_iam(config: &TokenConfig, api_key: Secret, client: reqwest::Client) -> Self {
        let exchange = IamExchange::new(client, config.iam_url.clone(), config.exchange_timeout);
        Self::new(config, api_key, Arc::new(exchange))
    }

    /// Return a token that has not reached its refresh point, refreshing if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] when the exchange keeps failing for the whole
    /// retry budget, or fails with a non-retryable error.
    pub async fn valid_token(&self) -> Result<BearerToken, AuthError> {
        let refresh = {
            let mut state = self.inner.state.lock();

            if let Some(cached) = &state.token
                && cached.expires_at > Instant::now()
            {
                return Ok(cached.token.clone());
            }

            if let Some(in_flight) = &state.in_flight {
                in_flight.clone()
            } else {
                let refresh = Arc::clone(&self.inner).refresh().boxed().shared();
                state.in_flight = Some(refresh.clone());
                refresh
            }
        };

        refresh.await
    }

    /// Cached-token metadata without I/O
    #[must_use]
    pub fn snapshot(&self) -> TokenSnapshot {
        let state = self.inner.state.lock();
        TokenSnapshot {
            cached: state.token.is_some(),
            expires_at: state.token.as_ref().map(|t| t.expires_at_utc),
        }
    }

    /// Drop the cached token; the next caller refreshes
    pub fn invalidate(&self) {
        self.inner.state.lock().token = None;
    }

    /// Refresh counters since startup
    #[must_use]
    pub fn stats(&self) -> RefreshStats {
        let c = &self.inner.counters;
        RefreshStats {
            attempts: c.attempts.load(Ordering::Relaxed),
            successes: c.successes.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    async fn refresh(self: Arc<Self>) -> Result<BearerToken, AuthError> {
        info!("Fetching new bearer token");

        let result = with_retry(
            &self.policy,
            "token_exchange",
            ExchangeError::is_retryable,
            |attempt| {
                let exchange = Arc::clone(&self.exchange);
                let api_key = self.api_key.clone();
                self.counters.attempts.fetch_add(1, Ordering::Relaxed);
                telemetry_metrics::counter!("watsonx_proxy_token_refresh_total", "outcome" => "attempt")
                    .increment(1);

                async move {
                    let outcome = exchange.exchange(&api_key).await;
                    if let Err(e) = &outcome {
                        warn!(attempt, error = %e, "Token exchange failed");
                    }
                    outcome
                }
            },
        )
        .await;

        match result {
            Ok(issued) => {
                let lifetime = issued
                    .expires_in
                    .map_or(self.default_lifetime, Duration::from_secs);
                let validity = lifetime
                    .saturating_sub(self.refresh_buffer)
                    .min(MAX_VALIDITY);
                let expires_at_utc = chrono::Duration::from_std(validity)
                    .ok()
                    .and_then(|d| Utc::now().checked_add_signed(d))
                    .unwrap_or_else(Utc::now);

                {
                    let mut state = self.state.lock();
                    state.token = Some(CachedToken {
                        token: issued.token.clone(),
                        expires_at: Instant::now() + validity,
                        expires_at_utc,
                    });
                    state.in_flight = None;
                }

                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                telemetry_metrics::counter!("watsonx_proxy_token_refresh_total", "outcome" => "success")
                    .increment(1);
                info!(expires_at = %expires_at_utc, "New bearer token obtained");

                Ok(issued.token)
            }
            Err(Exhausted { attempts, error: e }) => {
                self.state.lock().in_flight = None;

                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                telemetry_metrics::counter!("watsonx_proxy_token_refresh_total", "outcome" => "failure")
                    .increment(1);
                error!(attempts, error = %e, "Failed to obtain bearer token");

                Err(AuthError::new(attempts, e.to_string()))
            }
        }
    }
}
