//! Redacting wrappers for credentials
//!
//! The IAM API key and the bearer token it buys must never show up in logs,
//! panics or `Debug` dumps of the configuration. Both are carried as
//! [`Secret`], which only hands out the raw value through [`Secret::expose`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer};

/// Redacted string secret; cheap to clone
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Arc<str>);

impl Secret {
    /// Wrap a secret value
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    /// Raw secret value. Callers must not log it.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Whether the secret is empty or whitespace only
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// First `visible` characters followed by an ellipsis, for startup logs
    #[must_use]
    pub fn masked(&self, visible: usize) -> String {
        let prefix: String = self.0.chars().take(visible).collect();
        format!("{prefix}...")
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        crate::config::text::deserialize(deserializer).map(Self::from)
    }
}
