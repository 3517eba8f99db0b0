//! Configuration management for Bulwark.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::circuit::CircuitConfig;
use crate::error::{BulwarkError, Result};
use crate::ratelimit::{ScopeLimit, DEFAULT_KEY_PREFIX};

/// Prefix for environment variable overrides, e.g.
/// `BULWARK__RATE_LIMITING__PER_CLIENT=false`.
pub const ENV_PREFIX: &str = "BULWARK";

/// Main configuration for the resilience layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulwarkConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub circuit_breakers: CircuitBreakingConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Limit for scopes without their own entry
    #[serde(default)]
    pub default: ScopeLimit,

    /// Per-scope limits, keyed by scope (usually the endpoint path)
    #[serde(default)]
    pub endpoints: HashMap<String, ScopeLimit>,

    /// Keep a separate bucket per client within each scope
    #[serde(default = "default_true")]
    pub per_client: bool,

    /// Namespace for bucket keys in a distributed store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Expiry of idle bucket keys in a distributed store, in seconds
    #[serde(default = "default_store_ttl_secs")]
    pub store_ttl_secs: u64,

    /// Upper bound on one distributed store call, in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Scopes that are never rate limited
    #[serde(default = "default_exempt_scopes")]
    pub exempt_scopes: Vec<String>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            default: ScopeLimit::default(),
            endpoints: HashMap::new(),
            per_client: default_true(),
            key_prefix: default_key_prefix(),
            store_ttl_secs: default_store_ttl_secs(),
            store_timeout_ms: default_store_timeout_ms(),
            exempt_scopes: default_exempt_scopes(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_store_ttl_secs() -> u64 {
    3600
}

fn default_store_timeout_ms() -> u64 {
    250
}

fn default_exempt_scopes() -> Vec<String> {
    vec!["/metrics".to_string()]
}

impl RateLimitingConfig {
    pub fn store_ttl(&self) -> Duration {
        Duration::from_secs(self.store_ttl_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Reject limits that could not build a bucket.
    pub fn validate(&self) -> Result<()> {
        let scopes = std::iter::once(("default", &self.default))
            .chain(self.endpoints.iter().map(|(k, v)| (k.as_str(), v)));

        for (scope, limit) in scopes {
            limit
                .bucket_config(&self.key_prefix, self.store_ttl())
                .map_err(|e| BulwarkError::Config(format!("scope '{}': {}", scope, e)))?;
        }

        if self.store_timeout_ms == 0 {
            return Err(BulwarkError::Config(
                "store_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitBreakingConfig {
    /// Config for services without their own entry
    #[serde(default)]
    pub default: CircuitConfig,

    /// Per-service overrides
    #[serde(default)]
    pub services: HashMap<String, CircuitConfig>,
}

impl CircuitBreakingConfig {
    pub fn validate(&self) -> Result<()> {
        self.default
            .validate()
            .map_err(|e| BulwarkError::Config(format!("default circuit: {}", e)))?;

        for (service, config) in &self.services {
            config
                .validate()
                .map_err(|e| BulwarkError::Config(format!("circuit '{}': {}", service, e)))?;
        }
        Ok(())
    }
}

impl BulwarkConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: BulwarkConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file with `BULWARK__*`
    /// environment overrides layered on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let config: BulwarkConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.rate_limiting.validate()?;
        self.circuit_breakers.validate()
    }
}
