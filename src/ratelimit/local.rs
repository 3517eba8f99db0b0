//! Process-local bucket backend.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::backend::BucketBackend;
use super::bucket::{BucketConfig, BucketState, Decision};
use crate::error::StoreError;

/// In-process bucket states indexed by key.
///
/// Refill and consume for a key run while holding the map shard's write
/// lock, so concurrent callers on the same key are serialized and callers
/// on other shards are not.
#[derive(Debug, Default)]
pub struct LocalBackend {
    buckets: DashMap<String, BucketState>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refill and try to take one token for `key`.
    pub fn take(&self, config: &BucketConfig, key: &str, now: Duration) -> Decision {
        let mut state = self.buckets.entry(key.to_string()).or_insert_with(|| {
            debug!(
                key = %key,
                capacity = config.capacity(),
                refill_rate = config.refill_rate(),
                "Creating new local token bucket"
            );
            BucketState::full(config, now)
        });

        state.try_consume(config, now)
    }

    /// Tokens available for `key` at `now`. Unknown keys are full.
    pub fn peek(&self, config: &BucketConfig, key: &str, now: Duration) -> f64 {
        self.buckets
            .get(key)
            .map(|state| state.available(config, now))
            .unwrap_or_else(|| config.capacity())
    }

    /// Drop buckets that have refilled completely.
    ///
    /// A full bucket behaves exactly like one that was never created, so
    /// this frees memory without changing any future decision. Returns the
    /// number of buckets removed.
    pub fn evict_idle(&self, config: &BucketConfig, now: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, state| state.available(config, now) < config.capacity());
        before - self.buckets.len()
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Forget all keys.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

#[async_trait]
impl BucketBackend for LocalBackend {
    async fn consume(
        &self,
        config: &BucketConfig,
        key: &str,
        now: Duration,
    ) -> Result<Decision, StoreError> {
        Ok(self.take(config, key, now))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
