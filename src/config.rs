//! Configuration management
//!
//! Sources, later ones winning: built-in defaults, an optional YAML file,
//! `WATSONX_PROXY_<SECTION>__<FIELD>` variables, then the flat deployment
//! variables (`WATSONX_API_KEY`, `PORT`, ...) listed in [`FLAT_ENV_KEYS`].
//! CLI overrides are applied by the binary afterwards.

use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use regex::Regex;
use serde::Deserialize;
use url::Url;

use crate::secrets::Secret;
use crate::{Error, Result};

/// Prefix for nested environment overrides
pub const ENV_PREFIX: &str = "WATSONX_PROXY_";

/// Flat deployment variables and the config key each one sets
pub const FLAT_ENV_KEYS: &[(&str, &str)] = &[
    ("WATSONX_API_KEY", "token.api_key"),
    ("WATSONX_INSTANCE_ID", "upstream.instance_id"),
    ("PORT", "server.port"),
    ("ENVIRONMENT", "server.environment"),
    ("CORS_ORIGINS", "server.cors_origins"),
    ("RATE_LIMIT_WINDOW_MS", "rate_limit.window"),
    ("RATE_LIMIT_MAX_REQUESTS", "rate_limit.max_requests"),
    ("TOKEN_REFRESH_BUFFER", "token.refresh_buffer"),
    ("REQUEST_TIMEOUT", "upstream.request_timeout"),
    ("HEALTH_CHECK_INTERVAL", "health_check.interval"),
];

/// Flat variables taken verbatim; a numeric-looking key or id stays text
const TEXT_ENV_KEYS: &[&str] = &["WATSONX_API_KEY", "WATSONX_INSTANCE_ID", "ENVIRONMENT", "CORS_ORIGINS"];

/// Whether an `ENVIRONMENT` value names production (case-insensitive)
#[must_use]
pub fn is_production_name(environment: &str) -> bool {
    environment.trim().eq_ignore_ascii_case("production")
}

/// Main configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener and client-facing behaviour
    pub server: ServerConfig,
    /// Upstream API and forwarding
    pub upstream: UpstreamConfig,
    /// Identity-token exchange
    pub token: TokenConfig,
    /// Per-client rate limiting
    pub rate_limit: RateLimitConfig,
    /// Background health probe
    pub health_check: HealthCheckConfig,
    /// Prometheus exporter
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or the result fails [`validate`](Self::validate).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        Self::from_figment(figment)
    }

    /// Layer the environment providers over `figment` and extract
    fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(flat_env())
            .merge(flat_text_env())
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// The API key is not checked here so that tooling can load a config
    /// without credentials; the binary calls [`Config::api_key`] before
    /// binding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.upstream.base_url)
            .map_err(|e| Error::Config(format!("upstream.base_url is not a valid URL: {e}")))?;
        Url::parse(&self.token.iam_url)
            .map_err(|e| Error::Config(format!("token.iam_url is not a valid URL: {e}")))?;
        Regex::new(&self.upstream.instance_path_pattern).map_err(|e| {
            Error::Config(format!("upstream.instance_path_pattern is invalid: {e}"))
        })?;

        if self.upstream.instance_id.trim().is_empty() {
            return Err(Error::Config(
                "upstream.instance_id must not be empty".to_string(),
            ));
        }
        if self.rate_limit.enabled && self.rate_limit.window.is_zero() {
            return Err(Error::Config(
                "rate_limit.window must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// The configured API key
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the key is absent or blank.
    pub fn api_key(&self) -> Result<&Secret> {
        match &self.token.api_key {
            Some(key) if !key.is_blank() => Ok(key),
            _ => Err(Error::Config(
                "WATSONX_API_KEY environment variable is required".to_string(),
            )),
        }
    }
}

/// Maps the flat deployment variables onto dotted config keys
fn flat_env() -> Env {
    Env::raw().filter_map(|key| {
        let key = key.as_str().to_ascii_uppercase();
        FLAT_ENV_KEYS
            .iter()
            .find(|(var, _)| *var == key && !TEXT_ENV_KEYS.contains(var))
            .map(|(_, path)| (*path).into())
    })
}

/// The text-valued flat variables, unparsed
fn flat_text_env() -> Figment {
    FLAT_ENV_KEYS
        .iter()
        .filter(|(var, _)| TEXT_ENV_KEYS.contains(var))
        .filter_map(|(var, path)| std::env::var(var).ok().map(|value| (*path, value)))
        .fold(Figment::new(), |figment, (path, value)| {
            figment.merge(Serialized::default(path, value))
        })
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Deployment environment; `production` hides error details
    pub environment: String,
    /// `*` or a comma-separated list of allowed origins
    pub cors_origins: String,
    /// Use the first `X-Forwarded-For` entry as the client address
    pub trust_forwarded_for: bool,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            environment: "development".to_string(),
            cors_origins: "*".to_string(),
            trust_forwarded_for: false,
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

impl ServerConfig {
    /// Whether this is a production deployment
    #[must_use]
    pub fn is_production(&self) -> bool {
        is_production_name(&self.environment)
    }

    /// Explicit origin list, or `None` for any origin
    #[must_use]
    pub fn cors_origin_list(&self) -> Option<Vec<String>> {
        let trimmed = self.cors_origins.trim();
        if trimmed.is_empty() || trimmed == "*" {
            return None;
        }
        Some(
            trimmed
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }
}

/// Upstream API configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL all forwarded paths are appended to
    pub base_url: String,
    /// Instance id injected into instance-scoped paths
    #[serde(deserialize_with = "text::deserialize")]
    pub instance_id: String,
    /// Paths matching this regex get the `/instances/{id}` prefix
    pub instance_path_pattern: String,
    /// Per-attempt request timeout
    #[serde(deserialize_with = "duration_ms::deserialize")]
    pub request_timeout: Duration,
    /// Redirects followed per attempt
    pub max_redirects: usize,
    /// Retries after the first attempt on network failures
    pub retries: u32,
    /// Backoff before the first retry
    #[serde(deserialize_with = "duration_ms::deserialize")]
    pub retry_base_delay: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.dl.watson-orchestrate.ibm.com".to_string(),
            instance_id: "20251101-2338-1901-402d-f441a2b6b26b".to_string(),
            instance_path_pattern: "/v1/orchestrate".to_string(),
            request_timeout: Duration::from_secs(30),
            max_redirects: 5,
            retries: 2,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// Identity-token exchange configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// IAM API key; required to start the proxy
    pub api_key: Option<Secret>,
    /// Token exchange endpoint
    pub iam_url: String,
    /// Timeout for a single exchange call
    #[serde(deserialize_with = "duration_ms::deserialize")]
    pub exchange_timeout: Duration,
    /// Retries after the first exchange call
    pub retries: u32,
    /// Backoff before the first retry
    #[serde(deserialize_with = "duration_ms::deserialize")]
    pub retry_base_delay: Duration,
    /// Lifetime assumed when the issuer omits `expires_in`
    #[serde(deserialize_with = "duration_secs::deserialize")]
    pub default_lifetime: Duration,
    /// Margin subtracted from the issuer lifetime
    #[serde(deserialize_with = "duration_secs::deserialize")]
    pub refresh_buffer: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            iam_url: "https://iam.platform.saas.ibm.com/siusermgr/api/1.0/apikeys/token"
                .to_string(),
            exchange_timeout: Duration::from_secs(10),
            retries: 3,
            retry_base_delay: Duration::from_secs(1),
            default_lifetime: Duration::from_secs(7200),
            refresh_buffer: Duration::from_secs(300),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Fixed window length
    #[serde(deserialize_with = "duration_ms::deserialize")]
    pub window: Duration,
    /// Requests admitted per client per window
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_millis(60_000),
            max_requests: 100,
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Probe interval; zero disables the background probe
    #[serde(deserialize_with = "duration_ms::deserialize")]
    pub interval: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(60_000),
        }
    }
}

/// Prometheus exporter configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Install the exporter (requires the `metrics` feature)
    pub enabled: bool,
    /// Exporter port, separate from the proxy listener
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9464,
        }
    }
}

/// Either a bare number in the key's unit or a suffixed string
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Number(u64),
    Text(String),
}

fn parse_duration(raw: RawDuration, unit: fn(u64) -> Duration) -> std::result::Result<Duration, String> {
    let text = match raw {
        RawDuration::Number(n) => return Ok(unit(n)),
        RawDuration::Text(s) => s,
    };
    let s = text.trim();

    let parse = |digits: &str| {
        digits
            .trim()
            .parse::<u64>()
            .map_err(|e| format!("invalid duration {text:?}: {e}"))
    };

    // "ms" must be checked before "m" and "s"
    if let Some(ms) = s.strip_suffix("ms") {
        parse(ms).map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        parse(secs).map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        parse(mins).map(|m| Duration::from_secs(m.saturating_mul(60)))
    } else if let Some(hours) = s.strip_suffix('h') {
        parse(hours).map(|h| Duration::from_secs(h.saturating_mul(3600)))
    } else {
        parse(s).map(unit)
    }
}

/// Opaque text that a typed source may have read as a number
pub mod text {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawText {
        Text(String),
        Unsigned(u64),
        Signed(i64),
    }

    /// Deserialize a string, or a number as its decimal text
    ///
    /// # Errors
    ///
    /// Returns a deserialization error for any other value type.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match RawText::deserialize(deserializer)? {
            RawText::Text(s) => s,
            RawText::Unsigned(n) => n.to_string(),
            RawText::Signed(n) => n.to_string(),
        })
    }
}

/// Durations whose bare numbers are milliseconds
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    /// Deserialize `500`, `"500"`, `"500ms"`, `"30s"` or `"5m"`
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = super::RawDuration::deserialize(deserializer)?;
        super::parse_duration(raw, Duration::from_millis).map_err(serde::de::Error::custom)
    }
}

/// Durations whose bare numbers are seconds
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    /// Deserialize `300`, `"300"`, `"300s"` or `"5m"`
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = super::RawDuration::deserialize(deserializer)?;
        super::parse_duration(raw, Duration::from_secs).map_err(serde::de::Error::custom)
    }
}
