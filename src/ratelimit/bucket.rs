//! Token bucket configuration, state and the refill/consume arithmetic.

use std::time::Duration;

use serde::Serialize;

use crate::error::{BulwarkError, Result};

/// Default namespace for bucket keys in a distributed store.
pub const DEFAULT_KEY_PREFIX: &str = "rate_limit:";
/// Idle buckets expire from a distributed store after this long.
pub const DEFAULT_STORE_TTL: Duration = Duration::from_secs(3600);

/// Immutable parameters of one token bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketConfig {
    capacity: f64,
    refill_rate: f64,
    key_prefix: String,
    store_ttl: Duration,
}

impl BucketConfig {
    /// Create a bucket holding at most `capacity` tokens, refilled at
    /// `refill_rate` tokens per second.
    ///
    /// Both values must be finite and strictly positive.
    pub fn new(capacity: f64, refill_rate: f64) -> Result<Self> {
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(BulwarkError::Config(format!(
                "bucket capacity must be a positive number, got {}",
                capacity
            )));
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(BulwarkError::Config(format!(
                "bucket refill rate must be a positive number, got {}",
                refill_rate
            )));
        }
        if Duration::try_from_secs_f64(1.0 / refill_rate).is_err() {
            return Err(BulwarkError::Config(format!(
                "bucket refill rate {} is too small",
                refill_rate
            )));
        }

        Ok(Self {
            capacity,
            refill_rate,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            store_ttl: DEFAULT_STORE_TTL,
        })
    }

    /// Set the namespace used for keys in a distributed store.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set how long an idle key lives in a distributed store.
    pub fn with_store_ttl(mut self, ttl: Duration) -> Self {
        self.store_ttl = ttl;
        self
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn store_ttl(&self) -> Duration {
        self.store_ttl
    }

    /// The key under which `key` is stored in a distributed store.
    pub fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Time needed to refill a single token.
    pub fn refill_interval(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.refill_rate).unwrap_or(Duration::MAX)
    }
}

/// The result of one `consume` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether a token was taken
    pub allowed: bool,
    /// Whole tokens left in the bucket after the call
    pub remaining: u64,
}

impl Decision {
    pub(crate) fn from_tokens(allowed: bool, tokens: f64) -> Self {
        Self {
            allowed,
            remaining: tokens.max(0.0).floor() as u64,
        }
    }
}

/// Mutable state of one bucket key.
///
/// `0 <= tokens <= capacity` holds after every method.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill: Duration,
}

impl BucketState {
    /// A bucket seen for the first time starts full.
    pub fn full(config: &BucketConfig, now: Duration) -> Self {
        Self {
            tokens: config.capacity,
            last_refill: now,
        }
    }

    /// Tokens available at `now`, without mutating the state.
    pub fn available(&self, config: &BucketConfig, now: Duration) -> f64 {
        let elapsed = now.saturating_sub(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * config.refill_rate).clamp(0.0, config.capacity)
    }

    /// Bring the bucket up to date with `now`.
    ///
    /// A clock that moved backwards refills nothing and does not rewind
    /// `last_refill`.
    pub fn refill(&mut self, config: &BucketConfig, now: Duration) {
        self.tokens = self.available(config, now);
        self.last_refill = self.last_refill.max(now);
    }

    /// Refill, then take one token if a whole token is available.
    pub fn try_consume(&mut self, config: &BucketConfig, now: Duration) -> Decision {
        self.refill(config, now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Decision::from_tokens(true, self.tokens)
        } else {
            Decision::from_tokens(false, self.tokens)
        }
    }
}
