//! Bucket backend trait for abstracting local and distributed state.

use std::time::Duration;

use async_trait::async_trait;

use super::bucket::{BucketConfig, Decision};
use crate::error::StoreError;

/// Trait for token bucket storage backends.
///
/// Implementations must run refill-then-consume for one key as a single
/// atomic step. The local backend never fails; a distributed backend may,
/// and its failures are absorbed by [`TokenBucket`](super::TokenBucket).
#[async_trait]
pub trait BucketBackend: Send + Sync {
    /// Refill the bucket for `key` up to `now` and try to take one token.
    async fn consume(
        &self,
        config: &BucketConfig,
        key: &str,
        now: Duration,
    ) -> Result<Decision, StoreError>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}
