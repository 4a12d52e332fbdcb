//! Proxy server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::proxy::Forwarder;
use super::rate_limit::RateLimitState;
use super::router::{AppState, create_router};
use crate::config::Config;
use crate::failsafe::{HealthReporter, RateLimiter};
use crate::token::TokenManager;
use crate::transport::{HttpUpstream, Upstream};
use crate::{Error, Result};

/// Characters of the API key shown in the startup banner
const MASKED_KEY_PREFIX: usize = 20;

/// Watsonx proxy server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Router state
    state: Arc<AppState>,
    /// Shared rate limiter
    limiter: Arc<RateLimiter>,
}

impl Gateway {
    /// Create the proxy with the real IAM exchange and HTTP upstream
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the API key is missing or the
    /// configuration is invalid, [`Error::Http`] if an HTTP client cannot be
    /// built.
    pub fn new(config: Config) -> Result<Self> {
        let api_key = config.api_key()?.clone();
        let iam_client = reqwest::Client::builder().build()?;
        let tokens = TokenManager::with_iam(&config.token, api_key, iam_client);
        let upstream = HttpUpstream::new(config.upstream.request_timeout, config.upstream.max_redirects)?;

        Self::with_parts(config, tokens, Arc::new(upstream))
    }

    /// Create the proxy over an existing token manager and upstream
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the instance path pattern is invalid.
    pub fn with_parts(config: Config, tokens: TokenManager, upstream: Arc<dyn Upstream>) -> Result<Self> {
        let forwarder = Forwarder::new(&config.upstream, tokens.clone(), upstream)?;
        let health = Arc::new(HealthReporter::new(tokens.clone(), config.health_check.interval));
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));

        let state = Arc::new(AppState {
            forwarder,
            tokens,
            health,
            instance_id: config.upstream.instance_id.clone(),
            environment: config.server.environment.clone(),
            expose_details: !config.server.is_production(),
            started_at: Instant::now(),
        });

        Ok(Self { config, state, limiter })
    }

    /// Effective configuration
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build the HTTP router.
    ///
    /// Requests need a `ConnectInfo<SocketAddr>` extension for per-client
    /// rate limiting; without one every client shares a single window.
    #[must_use]
    pub fn router(&self) -> Router {
        let limits = Arc::new(RateLimitState {
            limiter: Arc::clone(&self.limiter),
            trust_forwarded_for: self.config.server.trust_forwarded_for,
        });
        create_router(Arc::clone(&self.state), limits, &self.config.server)
    }

    /// Run until SIGINT or SIGTERM
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address is invalid, the port cannot be
    /// bound, or the server fails.
    pub async fn run(self) -> Result<()> {
        let server = &self.config.server;
        let addr = SocketAddr::new(
            server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            server.port,
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        self.log_banner();

        let sweeper = Arc::clone(&self.limiter).spawn_sweeper(shutdown_tx.subscribe());
        let probe = Arc::clone(&self.state.health).spawn_probe(shutdown_tx.subscribe());

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Shutting down background tasks...");
        if let Err(e) = sweeper.await {
            warn!(error = %e, "Rate-limit sweeper ended abnormally");
        }
        if let Some(probe) = probe
            && let Err(e) = probe.await
        {
            warn!(error = %e, "Health probe ended abnormally");
        }

        info!("Shutdown complete");
        Ok(())
    }

    fn log_banner(&self) {
        let config = &self.config;
        let masked = config
            .token
            .api_key
            .as_ref()
            .map(|key| key.masked(MASKED_KEY_PREFIX))
            .unwrap_or_default();

        info!("============================================================");
        info!("WATSONX ORCHESTRATE PROXY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %config.server.host, port = config.server.port, "Listening");
        info!(environment = %config.server.environment, "Environment");
        info!(base_url = %config.upstream.base_url, instance = %config.upstream.instance_id, "Upstream");
        info!(api_key = %masked, "Credentials");

        if self.limiter.is_enabled() {
            info!(
                window_ms = u64::try_from(config.rate_limit.window.as_millis()).unwrap_or(u64::MAX),
                max_requests = config.rate_limit.max_requests,
                "RATE LIMITING enabled"
            );
        } else {
            warn!("RATE LIMITING disabled");
        }

        match config.server.cors_origin_list() {
            None => info!("CORS: any origin"),
            Some(origins) => info!(?origins, "CORS: restricted"),
        }

        info!("Endpoints:");
        info!("  GET  http://{}:{}/        (service info)", config.server.host, config.server.port);
        info!("  GET  http://{}:{}/health  (token health)", config.server.host, config.server.port);
        info!("  ANY  http://{}:{}/*       (proxied to Watsonx)", config.server.host, config.server.port);
        info!("============================================================");
    }
}

/// Wait for SIGINT/SIGTERM, then notify background tasks
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    if shutdown_tx.send(()).is_err() {
        debug!("No background tasks to notify");
    }
}
