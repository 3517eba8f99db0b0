//! Token bucket rate limiting and per-scope bucket routing.

mod backend;
mod bucket;
mod distributed;
mod limiter;
mod local;
mod registry;
mod rules;

pub use backend::BucketBackend;
pub use bucket::{BucketConfig, BucketState, Decision, DEFAULT_KEY_PREFIX, DEFAULT_STORE_TTL};
pub use distributed::{
    AtomicStore, DistributedBackend, TokenReply, TokenRequest, DEFAULT_STORE_TIMEOUT,
    TOKEN_BUCKET_SCRIPT,
};
pub use limiter::TokenBucket;
pub use local::LocalBackend;
pub use registry::{Admission, RateLimitRegistry};
pub use rules::ScopeLimit;
