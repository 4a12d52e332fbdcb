//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// Watsonx Orchestrate Proxy - credential-refreshing reverse proxy
#[derive(Parser, Debug)]
#[command(name = "watsonx-proxy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "WATSONX_PROXY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on (overrides config and `PORT`)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "WATSONX_PROXY_LOG_FORMAT")]
    pub log_format: Option<String>,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_overrides_parse() {
        let cli = Cli::try_parse_from([
            "watsonx-proxy",
            "--port",
            "8080",
            "--host",
            "127.0.0.1",
            "--log-format",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.port, Some(8080));
        assert_eq!(cli.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(cli.log_format.as_deref(), Some("json"));
    }
}
