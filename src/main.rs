//! Watsonx Orchestrate Proxy
//!
//! Credential-refreshing reverse proxy for the Watsonx Orchestrate API.

use std::process::ExitCode;

use clap::Parser;
use tracing::{debug, error};

use watsonx_proxy::{
    cli::Cli,
    config::{self, Config},
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let dotenv = load_dotenv();
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match dotenv {
        Some(Ok(path)) => debug!(path = %path.display(), "Loaded .env"),
        Some(Err(e)) if !e.not_found() => error!(error = %e, "Failed to read .env"),
        _ => {}
    }

    run_server(cli).await
}

/// Load `.env` outside production
fn load_dotenv() -> Option<dotenvy::Result<std::path::PathBuf>> {
    let production = std::env::var("ENVIRONMENT").is_ok_and(|env| config::is_production_name(&env));
    (!production).then(dotenvy::dotenv)
}

/// Run the proxy server
async fn run_server(cli: Cli) -> ExitCode {
    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let gateway = match Gateway::new(config) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("Failed to start proxy: {e}");
            return ExitCode::FAILURE;
        }
    };

    #[cfg(feature = "metrics")]
    if gateway.config().metrics.enabled {
        let config = gateway.config();
        match watsonx_proxy::setup_metrics(&config.server.host, config.metrics.port) {
            Ok(addr) => tracing::info!(%addr, "Prometheus exporter listening"),
            Err(e) => {
                error!("{e}");
                return ExitCode::FAILURE;
            }
        }
    }

    match gateway.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Proxy error: {e}");
            ExitCode::FAILURE
        }
    }
}
