//! Per-scope rate limit rules.
//!
//! A rule is expressed the way operators think about it, in requests per
//! minute with an optional burst, and converted into a bucket configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::bucket::BucketConfig;
use crate::error::{BulwarkError, Result};

/// Rate limit for one scope (usually an endpoint path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeLimit {
    /// Sustained requests allowed per minute
    pub requests_per_minute: u32,
    /// Largest instantaneous burst; defaults to `requests_per_minute`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_capacity: Option<u32>,
}

impl ScopeLimit {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            burst_capacity: None,
        }
    }

    pub fn with_burst(mut self, burst_capacity: u32) -> Self {
        self.burst_capacity = Some(burst_capacity);
        self
    }

    /// Tokens refilled per second.
    pub fn requests_per_second(&self) -> f64 {
        f64::from(self.requests_per_minute) / 60.0
    }

    /// Bucket capacity.
    pub fn capacity(&self) -> u32 {
        self.burst_capacity.unwrap_or(self.requests_per_minute)
    }

    /// Build the bucket configuration for this rule.
    pub fn bucket_config(&self, key_prefix: &str, store_ttl: Duration) -> Result<BucketConfig> {
        if self.requests_per_minute == 0 {
            return Err(BulwarkError::Config(
                "requests_per_minute must be greater than zero".to_string(),
            ));
        }

        Ok(BucketConfig::new(f64::from(self.capacity()), self.requests_per_second())?
            .with_key_prefix(key_prefix)
            .with_store_ttl(store_ttl))
    }
}

impl Default for ScopeLimit {
    fn default() -> Self {
        Self::new(60)
    }
}
