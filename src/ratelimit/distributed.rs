//! Distributed bucket backend over an atomic key-value store.
//!
//! The store owns bucket state so that every process sharing it enforces
//! one global limit. The whole refill-then-consume sequence must execute as
//! a single server-side operation; [`TOKEN_BUCKET_SCRIPT`] is the reference
//! implementation for Redis-compatible stores.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::backend::BucketBackend;
use super::bucket::{BucketConfig, Decision};
use crate::error::StoreError;

/// Default upper bound on a single store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// Atomic refill-and-consume script.
///
/// `KEYS[1]` is the bucket key, `ARGV` is capacity, refill rate (tokens per
/// second), now (epoch seconds) and TTL (seconds). Returns
/// `{allowed, tokens}` where `allowed` is 0 or 1 and `tokens` is a string,
/// since Redis truncates Lua numbers to integers in replies.
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local bucket = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(bucket[1]) or capacity
local last_refill = tonumber(bucket[2]) or now

local elapsed = math.max(0, now - last_refill)
tokens = math.min(capacity, tokens + (elapsed * refill_rate))
last_refill = math.max(last_refill, now)

local allowed = 0
if tokens >= 1.0 then
  tokens = tokens - 1.0
  allowed = 1
end

redis.call('HSET', key, 'tokens', tokens, 'last_refill', last_refill)
redis.call('EXPIRE', key, ttl)

return {allowed, tostring(tokens)}
"#;

/// Arguments for one atomic bucket operation.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenRequest {
    pub capacity: f64,
    pub refill_rate: f64,
    /// Current time in epoch seconds
    pub now: f64,
    /// Expiry applied to the key after the operation
    pub ttl: Duration,
}

impl TokenRequest {
    /// Script arguments in `ARGV` order.
    pub fn script_args(&self) -> [String; 4] {
        [
            self.capacity.to_string(),
            self.refill_rate.to_string(),
            self.now.to_string(),
            self.ttl.as_secs().max(1).to_string(),
        ]
    }
}

/// The store's answer to a [`TokenRequest`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenReply {
    pub allowed: bool,
    /// Tokens left after the operation
    pub tokens: f64,
}

/// The contract a distributed store client must satisfy.
///
/// Implementations run [`TOKEN_BUCKET_SCRIPT`] (or an equivalent atomic
/// operation) against `key` and report transport failures as
/// [`StoreError`].
#[async_trait]
pub trait AtomicStore: Send + Sync {
    async fn take_token(&self, key: &str, request: &TokenRequest)
        -> Result<TokenReply, StoreError>;
}

/// Bucket backend that delegates to an [`AtomicStore`].
///
/// The per-call timeout runs on the Tokio timer, so store calls need a
/// Tokio runtime. Polled from any other executor, every call reports
/// [`StoreError::Unavailable`] without reaching the store, and
/// [`TokenBucket`](super::TokenBucket) answers from local state.
pub struct DistributedBackend {
    store: Arc<dyn AtomicStore>,
    timeout: Duration,
}

impl DistributedBackend {
    pub fn new(store: Arc<dyn AtomicStore>) -> Self {
        Self {
            store,
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Bound each store call by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl BucketBackend for DistributedBackend {
    async fn consume(
        &self,
        config: &BucketConfig,
        key: &str,
        now: Duration,
    ) -> Result<Decision, StoreError> {
        let storage_key = config.storage_key(key);
        let request = TokenRequest {
            capacity: config.capacity(),
            refill_rate: config.refill_rate(),
            now: now.as_secs_f64(),
            ttl: config.store_ttl(),
        };

        if tokio::runtime::Handle::try_current().is_err() {
            return Err(StoreError::Unavailable(
                "no Tokio runtime to drive the store timeout".to_string(),
            ));
        }

        trace!(key = %storage_key, "Consuming token from distributed store");

        let reply = tokio::time::timeout(self.timeout, self.store.take_token(&storage_key, &request))
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))??;

        if !reply.tokens.is_finite() {
            return Err(StoreError::InvalidReply(format!(
                "non-finite token count {} for key {}",
                reply.tokens, storage_key
            )));
        }

        let tokens = reply.tokens.clamp(0.0, config.capacity());
        Ok(Decision::from_tokens(reply.allowed, tokens))
    }

    fn name(&self) -> &'static str {
        "distributed"
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn config() -> BucketConfig {
        BucketConfig::new(3.0, 1.0)
            .unwrap()
            .with_key_prefix("rate_limit:/api:")
    }

    #[test]
    fn test_consume_outside_tokio_runtime_is_unavailable() {
        let store = Arc::new(MemoryStore::default());
        let backend = DistributedBackend::new(store.clone());

        let result = futures::executor::block_on(backend.consume(
            &config(),
            "/api:1.2.3.4",
            Duration::from_secs(10),
        ));

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(store.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_consume_uses_prefixed_key() {
        let store = Arc::new(MemoryStore::default());
        let backend = DistributedBackend::new(store.clone());

        let decision = backend
            .consume(&config(), "/api:1.2.3.4", Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(decision, Decision { allowed: true, remaining: 2 });
        assert!(store.buckets.contains_key("rate_limit:/api:/api:1.2.3.4"));
    }

    #[tokio::test]
    async fn test_consume_exhausts_shared_state() {
        let store = Arc::new(MemoryStore::default());
        let first = DistributedBackend::new(store.clone());
        let second = DistributedBackend::new(store.clone());
        let now = Duration::from_secs(10);

        assert!(first.consume(&config(), "k", now).await.unwrap().allowed);
        assert!(second.consume(&config(), "k", now).await.unwrap().allowed);
        assert!(first.consume(&config(), "k", now).await.unwrap().allowed);
        assert!(!second.consume(&config(), "k", now).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_store_error_is_propagated() {
        let backend = DistributedBackend::new(Arc::new(FailingStore::default()));
        let result = backend.consume(&config(), "k", Duration::ZERO).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_hanging_store_times_out() {
        let backend = DistributedBackend::new(Arc::new(HangingStore))
            .with_timeout(Duration::from_millis(10));
        let result = backend.consume(&config(), "k", Duration::ZERO).await;
        assert_eq!(result, Err(StoreError::Timeout(Duration::from_millis(10))));
    }

    #[tokio::test]
    async fn test_reply_is_clamped_and_validated() {
        let backend = DistributedBackend::new(Arc::new(FixedStore(TokenReply {
            allowed: true,
            tokens: 99.0,
        })));
        let decision = backend.consume(&config(), "k", Duration::ZERO).await.unwrap();
        assert_eq!(decision.remaining, 3);

        let backend = DistributedBackend::new(Arc::new(FixedStore(TokenReply {
            allowed: false,
            tokens: f64::NAN,
        })));
        let result = backend.consume(&config(), "k", Duration::ZERO).await;
        assert!(matches!(result, Err(StoreError::InvalidReply(_))));
    }

    #[test]
    fn test_script_args_order() {
        let request = TokenRequest {
            capacity: 60.0,
            refill_rate: 1.0,
            now: 1700000000.5,
            ttl: Duration::from_secs(3600),
        };
        assert_eq!(
            request.script_args(),
            [
                "60".to_string(),
                "1".to_string(),
                "1700000000.5".to_string(),
                "3600".to_string()
            ]
        );
    }
}
