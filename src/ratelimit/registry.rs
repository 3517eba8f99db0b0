//! Routing of scopes to token buckets.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument};

use super::bucket::Decision;
use super::distributed::{AtomicStore, DistributedBackend};
use super::limiter::TokenBucket;
use super::rules::ScopeLimit;
use crate::clock::Clock;
use crate::config::RateLimitingConfig;
use crate::error::{AdmissionRejected, Result};
use crate::metrics::MetricsSink;

struct ScopedBucket {
    limit: ScopeLimit,
    bucket: TokenBucket,
}

/// The outcome of an admission check, with what a caller needs to build
/// rate limit response headers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Admission {
    pub scope: String,
    pub key: String,
    pub decision: Decision,
    /// Configured requests per minute for the scope
    pub limit: u32,
    /// Zero when allowed, otherwise the time to refill one token
    pub retry_after: Duration,
    /// The scope bypasses rate limiting entirely
    pub exempt: bool,
}

impl Admission {
    pub fn allowed(&self) -> bool {
        self.decision.allowed
    }

    /// Turn a rejection into an [`AdmissionRejected`] error.
    pub fn into_result(self) -> std::result::Result<Self, AdmissionRejected> {
        if self.decision.allowed {
            Ok(self)
        } else {
            Err(AdmissionRejected {
                scope: self.scope,
                key: self.key,
                limit: self.limit,
                retry_after: self.retry_after,
            })
        }
    }
}

/// Owns one token bucket per configured scope plus the default bucket.
///
/// Performs no I/O of its own; buckets may talk to a distributed store.
pub struct RateLimitRegistry {
    default: ScopedBucket,
    scopes: HashMap<String, ScopedBucket>,
    per_client: bool,
    exempt: HashSet<String>,
    metrics: Arc<dyn MetricsSink>,
}

impl RateLimitRegistry {
    /// Build a registry whose buckets live in process memory only.
    ///
    /// The config is validated first, as it is when loaded from a file.
    pub fn new(
        config: &RateLimitingConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        Self::build(config, None, clock, metrics)
    }

    /// Build a registry whose buckets live in `store`, with local fallback.
    pub fn with_store(
        config: &RateLimitingConfig,
        store: Arc<dyn AtomicStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        Self::build(config, Some(store), clock, metrics)
    }

    fn build(
        config: &RateLimitingConfig,
        store: Option<Arc<dyn AtomicStore>>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;

        let make_bucket = |limit: &ScopeLimit, prefix: String| -> Result<ScopedBucket> {
            let bucket_config = limit.bucket_config(&prefix, config.store_ttl())?;
            let bucket = match &store {
                Some(store) => TokenBucket::with_backend(
                    bucket_config,
                    Arc::new(DistributedBackend::new(store.clone()).with_timeout(config.store_timeout())),
                    clock.clone(),
                ),
                None => TokenBucket::local(bucket_config, clock.clone()),
            };
            Ok(ScopedBucket {
                limit: limit.clone(),
                bucket,
            })
        };

        let default = make_bucket(&config.default, config.key_prefix.clone())?;

        let mut scopes = HashMap::with_capacity(config.endpoints.len());
        for (scope, limit) in &config.endpoints {
            let prefix = format!("{}{}:", config.key_prefix, scope);
            scopes.insert(scope.clone(), make_bucket(limit, prefix)?);
        }

        info!(
            scopes = scopes.len(),
            per_client = config.per_client,
            distributed = store.is_some(),
            "Rate limit registry initialized"
        );

        Ok(Self {
            default,
            scopes,
            per_client: config.per_client,
            exempt: config.exempt_scopes.iter().cloned().collect(),
            metrics,
        })
    }

    fn scoped(&self, scope: &str) -> &ScopedBucket {
        self.scopes.get(scope).unwrap_or(&self.default)
    }

    /// The bucket for `scope`, or the default bucket for unknown scopes.
    pub fn resolve_bucket(&self, scope: &str) -> &TokenBucket {
        &self.scoped(scope).bucket
    }

    /// The rule applied to `scope`.
    pub fn limit_for(&self, scope: &str) -> &ScopeLimit {
        &self.scoped(scope).limit
    }

    /// Bucket key for a request on `scope` from `client_id`.
    pub fn build_key(&self, scope: &str, client_id: Option<&str>) -> String {
        match client_id {
            Some(client) if self.per_client => format!("{}:{}", scope, client),
            _ => scope.to_string(),
        }
    }

    /// Whether `scope` bypasses rate limiting.
    pub fn is_exempt(&self, scope: &str) -> bool {
        self.exempt.contains(scope)
    }

    /// Consume a token for a request on `scope` from `client_id`.
    #[instrument(skip(self), level = "trace")]
    pub async fn check(&self, scope: &str, client_id: Option<&str>) -> Admission {
        let scoped = self.scoped(scope);
        let key = self.build_key(scope, client_id);

        if self.is_exempt(scope) {
            return Admission {
                scope: scope.to_string(),
                key,
                decision: Decision {
                    allowed: true,
                    remaining: u64::from(scoped.limit.capacity()),
                },
                limit: scoped.limit.requests_per_minute,
                retry_after: Duration::ZERO,
                exempt: true,
            };
        }

        let decision = scoped.bucket.consume(&key).await;
        self.metrics.record_admission(scope, &key, &decision);

        let retry_after = if decision.allowed {
            Duration::ZERO
        } else {
            debug!(scope = %scope, key = %key, "Rate limit exceeded");
            scoped.bucket.config().refill_interval()
        };

        Admission {
            scope: scope.to_string(),
            key,
            decision,
            limit: scoped.limit.requests_per_minute,
            retry_after,
            exempt: false,
        }
    }

    /// Names of the configured scopes, excluding the default.
    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scopes.keys().map(String::as_str)
    }

    /// Drop fully refilled local buckets across all scopes.
    pub fn evict_idle(&self) -> usize {
        self.default.bucket.evict_idle()
            + self
                .scopes
                .values()
                .map(|s| s.bucket.evict_idle())
                .sum::<usize>()
    }
}
