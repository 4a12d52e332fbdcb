//! Watsonx Orchestrate Proxy
//!
//! Credential-refreshing reverse proxy in front of the Watsonx Orchestrate
//! API. Clients call the proxy without credentials; the proxy exchanges a
//! long-lived API key for a short-lived bearer token and forwards the
//! request.
//!
//! # Features
//!
//! - **Token Manager**: cached bearer token, refreshed ahead of expiry, one
//!   exchange in flight no matter how many requests are waiting
//! - **Forwarding**: instance-scoped path rewriting, header scrubbing,
//!   bounded retries with exponential backoff
//! - **Rate limiting**: fixed window per client address
//! - **Health**: on-demand `/health` plus a periodic background probe
//! - **Production Ready**: structured logs, metrics, graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod gateway;
pub mod secrets;
pub mod token;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`.
///
/// # Errors
///
/// Returns [`Error::Internal`] if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    }
    .map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}

/// Install the Prometheus exporter on its own listener
///
/// # Errors
///
/// Returns [`Error::Config`] for an invalid host and [`Error::Internal`] if
/// the exporter cannot be installed.
#[cfg(feature = "metrics")]
pub fn setup_metrics(host: &str, port: u16) -> Result<std::net::SocketAddr> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    let ip: std::net::IpAddr = host
        .parse()
        .map_err(|e| Error::Config(format!("Invalid host: {e}")))?;
    let addr = std::net::SocketAddr::new(ip, port);

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| Error::Internal(format!("Failed to install metrics exporter: {e}")))?;

    Ok(addr)
}
