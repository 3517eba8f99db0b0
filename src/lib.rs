//! Bulwark - Request-path resilience primitives
//!
//! This crate provides token-bucket rate limiting keyed by scope and client,
//! with optional state in a shared atomic store, and per-service circuit
//! breakers that shed load from failing dependencies.

pub mod circuit;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod ratelimit;

pub use circuit::{CircuitBreaker, CircuitRegistry, FailureKind, Phase};
pub use config::BulwarkConfig;
pub use error::{BulwarkError, GuardError, Result};
pub use ratelimit::{Admission, RateLimitRegistry, TokenBucket};
