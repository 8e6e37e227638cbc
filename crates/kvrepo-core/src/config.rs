//! Repository configuration.
//!
//! [`RepoConfig`] is read from YAML; every field has a default, so an empty
//! document is a valid configuration pointing at a local server. A few
//! settings can be overridden from the environment after parsing:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `KVREPO_URL` | `url` |
//! | `KVREPO_NAMESPACE` | `namespace` |
//! | `KVREPO_TOTAL_CONNECTIONS` | `total_connections` |
//!
//! ```yaml
//! url: "redis://cache:6379/0"
//! namespace: "orders"
//! total_connections: 4
//! default_retries: 5
//! ```

use std::path::Path;
use std::time::Duration;

use kvrepo_store::{Endpoint, MemoryStore, Timeouts};
use kvrepo_types::KeySpace;
use serde::Deserialize;

use crate::error::RepoError;
use crate::retry::RetryPolicy;

/// URL scheme selecting the in-process store.
pub const MEMORY_SCHEME: &str = "memory://";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value is outside its allowed range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

impl From<ConfigError> for RepoError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Settings for one repository.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepoConfig {
    /// Store URL. `memory://` selects the in-process store.
    #[serde(default = "default_url")]
    pub url: String,

    /// Key namespace; empty leaves keys unprefixed.
    #[serde(default)]
    pub namespace: String,

    /// Number of pooled connections.
    #[serde(default = "default_total_connections")]
    pub total_connections: usize,

    /// Attempt budget for idempotent single-shot operations.
    #[serde(default = "default_retries")]
    pub default_retries: u32,

    /// Attempt budget for committing a transaction batch.
    #[serde(default = "default_retries")]
    pub transaction_retries: u32,

    /// Backoff base delay in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Per-call timeout in milliseconds.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_url() -> String {
    "redis://localhost:6379".to_owned()
}

const fn default_total_connections() -> usize {
    2
}

const fn default_retries() -> u32 {
    5
}

const fn default_retry_base_delay_ms() -> u64 {
    50
}

const fn default_command_timeout_ms() -> u64 {
    1000
}

const fn default_connect_timeout_ms() -> u64 {
    5000
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            namespace: String::new(),
            total_connections: default_total_connections(),
            default_retries: default_retries(),
            transaction_retries: default_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl RepoConfig {
    /// Load configuration from a YAML file, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Override fields from `KVREPO_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Override fields from `lookup`, which maps a variable name to its value.
    /// Unparseable numbers are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("KVREPO_URL") {
            self.url = val;
        }
        if let Some(val) = lookup("KVREPO_NAMESPACE") {
            self.namespace = val;
        }
        if let Some(val) = lookup("KVREPO_TOTAL_CONNECTIONS").and_then(|v| v.parse().ok()) {
            self.total_connections = val;
        }
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an empty pool or a zero attempt
    /// budget.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.total_connections < 1 {
            return Err(ConfigError::Invalid(
                "total_connections must be at least 1".to_owned(),
            ));
        }
        if self.default_retries < 1 || self.transaction_retries < 1 {
            return Err(ConfigError::Invalid(
                "retry budgets must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    /// Returns `true` if `url` selects the in-process store.
    pub fn is_memory(&self) -> bool {
        self.url.starts_with(MEMORY_SCHEME)
    }

    /// The endpoint to connect to. A `memory://` URL yields a fresh, empty
    /// [`MemoryStore`] on every call.
    pub fn endpoint(&self) -> Endpoint {
        if self.is_memory() {
            Endpoint::Memory(MemoryStore::new())
        } else {
            Endpoint::Url(self.url.clone())
        }
    }

    /// Connect and command timeouts.
    pub const fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            command: Duration::from_millis(self.command_timeout_ms),
        }
    }

    /// Backoff settings.
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(self.retry_base_delay_ms))
    }

    /// Key namespace.
    pub fn keyspace(&self) -> KeySpace {
        KeySpace::new(self.namespace.clone())
    }
}
