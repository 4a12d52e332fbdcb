//! Token health reporting
//!
//! Health here means "a bearer token can be obtained". The on-demand check
//! and the periodic probe both go through [`TokenManager::valid_token`], so
//! neither can start a second refresh while one is running.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::AuthError;
use crate::token::TokenManager;

/// Probe outcome tracker
#[derive(Default)]
pub struct HealthTracker {
    /// Successful probes
    success_count: AtomicU64,
    /// Failed probes
    failure_count: AtomicU64,
    /// Failures since the last success
    consecutive_failures: AtomicU64,
    /// Last successful probe (millis since epoch)
    last_success: AtomicU64,
    /// Last failed probe (millis since epoch)
    last_failure: AtomicU64,
}

impl HealthTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful probe
    pub fn record_success(&self) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        let previous = self.consecutive_failures.swap(0, Ordering::Relaxed);
        self.last_success.store(now_millis(), Ordering::Relaxed);

        if previous > 0 {
            info!(after_failures = previous, "Token health recovered");
        }
    }

    /// Record a failed probe
    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure.store(now_millis(), Ordering::Relaxed);
    }

    /// Get current probe metrics
    #[must_use]
    pub fn metrics(&self) -> ProbeMetrics {
        let millis = |v: u64| (v > 0).then_some(v);
        ProbeMetrics {
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            last_success_ms: millis(self.last_success.load(Ordering::Relaxed)),
            last_failure_ms: millis(self.last_failure.load(Ordering::Relaxed)),
        }
    }
}

/// Probe metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProbeMetrics {
    /// Successful probes
    pub success_count: u64,
    /// Failed probes
    pub failure_count: u64,
    /// Failures since the last success
    pub consecutive_failures: u64,
    /// Last success timestamp (millis since epoch)
    pub last_success_ms: Option<u64>,
    /// Last failure timestamp (millis since epoch)
    pub last_failure_ms: Option<u64>,
}

/// Result of a health check
#[derive(Debug, Clone)]
pub enum HealthStatus {
    /// A bearer token is available
    Healthy {
        /// When the cached token stops being used
        token_expiry: Option<DateTime<Utc>>,
    },
    /// The token exchange failed
    Unhealthy {
        /// Why the token could not be obtained
        error: AuthError,
    },
}

impl HealthStatus {
    /// Whether the check passed
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }
}

/// On-demand and periodic token health checks
pub struct HealthReporter {
    tokens: TokenManager,
    tracker: HealthTracker,
    interval: Duration,
}

impl HealthReporter {
    /// Create a reporter; an `interval` of zero disables the background probe
    #[must_use]
    pub fn new(tokens: TokenManager, interval: Duration) -> Self {
        Self {
            tokens,
            tracker: HealthTracker::new(),
            interval,
        }
    }

    /// Obtain a valid token and report the outcome
    pub async fn check(&self) -> HealthStatus {
        match self.tokens.valid_token().await {
            Ok(_) => HealthStatus::Healthy {
                token_expiry: self.tokens.snapshot().expires_at,
            },
            Err(error) => HealthStatus::Unhealthy { error },
        }
    }

    /// Probe outcomes so far
    #[must_use]
    pub fn probe_metrics(&self) -> ProbeMetrics {
        self.tracker.metrics()
    }

    /// Run one probe and record it
    pub async fn probe_once(&self) -> HealthStatus {
        let status = self.check().await;
        match &status {
            HealthStatus::Healthy { .. } => {
                debug!("Health check passed");
                self.tracker.record_success();
                telemetry_metrics::counter!("watsonx_proxy_health_probe_total", "outcome" => "healthy")
                    .increment(1);
            }
            HealthStatus::Unhealthy { error: e } => {
                error!(error = %e, "Health check failed");
                self.tracker.record_failure();
                telemetry_metrics::counter!("watsonx_proxy_health_probe_total", "outcome" => "unhealthy")
                    .increment(1);
            }
        }
        status
    }

    /// Probe every interval until shutdown. Returns `None` when disabled.
    pub fn spawn_probe(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Option<JoinHandle<()>> {
        if self.interval.is_zero() {
            info!("Background health probe disabled");
            return None;
        }

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // First tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.recv() => break,
                }
                // A probe may sit out the whole exchange budget; shutdown wins
                tokio::select! {
                    _ = self.probe_once() => {}
                    _ = shutdown.recv() => break,
                }
            }
            debug!("Health probe stopping");
        }))
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;

    use super::*;
    use crate::config::TokenConfig;
    use crate::secrets::Secret;
    use crate::token::{BearerToken, ExchangeError, IdentityExchange, IssuedToken};

    /// Issues short-lived tokens while `up` is set
    struct ToggleExchange {
        up: AtomicBool,
        calls: AtomicU64,
    }

    #[async_trait]
    impl IdentityExchange for ToggleExchange {
        async fn exchange(&self, _: &Secret) -> Result<IssuedToken, ExchangeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.up.load(Ordering::SeqCst) {
                // Lifetime equal to the buffer, so every probe refreshes
                Ok(IssuedToken {
                    token: BearerToken::new("tok"),
                    expires_in: Some(300),
                })
            } else {
                Err(ExchangeError::MissingToken)
            }
        }
    }

    /// Never answers
    struct StalledExchange;

    #[async_trait]
    impl IdentityExchange for StalledExchange {
        async fn exchange(&self, _: &Secret) -> Result<IssuedToken, ExchangeError> {
            std::future::pending().await
        }
    }

    fn reporter(up: bool, interval: Duration) -> (Arc<HealthReporter>, Arc<ToggleExchange>) {
        let exchange = Arc::new(ToggleExchange {
            up: AtomicBool::new(up),
            calls: AtomicU64::new(0),
        });
        let tokens = TokenManager::new(&TokenConfig::default(), Secret::from("k"), exchange.clone());
        (Arc::new(HealthReporter::new(tokens, interval)), exchange)
    }

    #[test]
    fn test_tracker_counts_and_recovery() {
        let tracker = HealthTracker::new();

        tracker.record_failure();
        tracker.record_failure();
        assert_eq!(tracker.metrics().consecutive_failures, 2);
        assert!(tracker.metrics().last_success_ms.is_none());

        tracker.record_success();
        let metrics = tracker.metrics();
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.failure_count, 2);
        assert_eq!(metrics.consecutive_failures, 0);
        assert!(metrics.last_success_ms.is_some());
        assert!(metrics.last_failure_ms.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_reports_expiry_when_healthy() {
        let (reporter, _) = reporter(true, Duration::ZERO);

        let status = reporter.check().await;
        assert!(matches!(status, HealthStatus::Healthy { token_expiry: Some(_) }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_reports_error_when_exchange_fails() {
        let (reporter, _) = reporter(false, Duration::ZERO);

        match reporter.check().await {
            HealthStatus::Unhealthy { error } => assert_eq!(error.attempts, 1),
            HealthStatus::Healthy { .. } => panic!("expected unhealthy"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_disables_probe() {
        let (reporter, _) = reporter(true, Duration::ZERO);
        let (_tx, rx) = broadcast::channel(1);

        assert!(reporter.spawn_probe(rx).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_runs_each_interval_and_stops_on_shutdown() {
        let (reporter, exchange) = reporter(true, Duration::from_secs(60));
        let (tx, rx) = broadcast::channel(1);

        let handle = Arc::clone(&reporter).spawn_probe(rx).unwrap();

        // No probe before the first interval elapses
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(reporter.probe_metrics().success_count, 1);

        exchange.up.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        let metrics = reporter.probe_metrics();
        assert_eq!(metrics.failure_count, 1);
        assert_eq!(metrics.consecutive_failures, 1);

        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_running_health_check() {
        let tokens = TokenManager::new(&TokenConfig::default(), Secret::from("k"), Arc::new(StalledExchange));
        let reporter = Arc::new(HealthReporter::new(tokens, Duration::from_secs(60)));
        let (tx, rx) = broadcast::channel(1);

        let handle = reporter.spawn_probe(rx).unwrap();

        // First check is now waiting on the exchange
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!handle.is_finished());

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("background check should stop on shutdown")
            .unwrap();
    }
}
