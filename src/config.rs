//! Configuration management for Tollgate.
//!
//! Only the shared store location and credential are meant to change between
//! deployments. Policies are compiled in; see [`crate::ratelimit::PolicyRegistry`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TollgateError};

/// Prefix for environment variables, e.g. `TOLLGATE_STORE__URL`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Shared counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// In-process fallback configuration
    #[serde(default)]
    pub fallback: FallbackConfig,
}

/// Shared counter store (Redis) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store endpoint, e.g. `redis://cache.internal:6379`
    #[serde(default)]
    pub url: Option<String>,

    /// Store credential
    #[serde(default)]
    pub token: Option<String>,

    /// Prefix for every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Latency budget for a single increment, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl StoreConfig {
    /// Endpoint and credential, if both are present and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        let url = self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())?;
        let token = self.token.as_deref().map(str::trim).filter(|t| !t.is_empty())?;
        Some((url, token))
    }

    /// The increment timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

/// In-process fallback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// How often expired entries are swept, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl FallbackConfig {
    /// The sweep interval as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

fn default_sweep_interval() -> u64 {
    60
}

impl TollgateConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))
    }

    /// Load configuration from the environment, layered over an optional YAML file.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::with_name(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Load configuration from the environment only.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }
}
