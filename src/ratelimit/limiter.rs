//! Token bucket with distributed state and local fallback.

use std::sync::Arc;

use tracing::{trace, warn};

use super::backend::BucketBackend;
use super::bucket::{BucketConfig, Decision};
use super::local::LocalBackend;
use crate::clock::Clock;

/// A rate limited bucket family: one bucket per key, all sharing a config.
///
/// When a distributed backend is configured it is authoritative. If it
/// fails, the call is answered from process-local state instead, which
/// keeps requests flowing with per-process rather than global limits.
pub struct TokenBucket {
    config: BucketConfig,
    local: LocalBackend,
    remote: Option<Arc<dyn BucketBackend>>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Create a bucket family backed only by process-local state.
    pub fn local(config: BucketConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            local: LocalBackend::new(),
            remote: None,
            clock,
        }
    }

    /// Create a bucket family backed by `remote`, falling back to local state.
    pub fn with_backend(
        config: BucketConfig,
        remote: Arc<dyn BucketBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            local: LocalBackend::new(),
            remote: Some(remote),
            clock,
        }
    }

    /// Take one token for `key`.
    ///
    /// Never fails: backend errors degrade to the local bucket.
    pub async fn consume(&self, key: &str) -> Decision {
        let now = self.clock.now();

        if let Some(remote) = &self.remote {
            match remote.consume(&self.config, key, now).await {
                Ok(decision) => {
                    trace!(
                        key = %key,
                        backend = remote.name(),
                        allowed = decision.allowed,
                        remaining = decision.remaining,
                        "Consumed token"
                    );
                    return decision;
                }
                Err(e) => {
                    warn!(
                        key = %key,
                        backend = remote.name(),
                        error = %e,
                        "Rate limit backend degraded, falling back to local state"
                    );
                }
            }
        }

        let decision = self.local.take(&self.config, key, now);
        trace!(
            key = %key,
            backend = "local",
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Consumed token"
        );
        decision
    }

    /// Tokens currently available in the local bucket for `key`.
    pub fn peek(&self, key: &str) -> f64 {
        self.local.peek(&self.config, key, self.clock.now())
    }

    /// Drop local buckets that have refilled completely.
    pub fn evict_idle(&self) -> usize {
        self.local.evict_idle(&self.config, self.clock.now())
    }

    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    pub fn is_distributed(&self) -> bool {
        self.remote.is_some()
    }

    /// Number of keys held in local state.
    pub fn local_key_count(&self) -> usize {
        self.local.len()
    }
}
