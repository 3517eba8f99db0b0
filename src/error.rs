//! Error types for the Bulwark resilience layer.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Main error type for Bulwark setup and configuration.
#[derive(Error, Debug)]
pub enum BulwarkError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Layered configuration loading errors
    #[error("Configuration source error: {0}")]
    Source(#[from] ::config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Bulwark operations.
pub type Result<T> = std::result::Result<T, BulwarkError>;

/// A request was refused because its token bucket is empty.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Rate limit exceeded for '{key}' (limit {limit} requests per minute)")]
pub struct AdmissionRejected {
    /// The scope whose bucket rejected the request
    pub scope: String,
    /// The bucket key that was consumed from
    pub key: String,
    /// Configured requests per minute for the scope
    pub limit: u32,
    /// Time until at least one token is available again
    pub retry_after: Duration,
}

/// A call was refused because the circuit for its service is open.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Circuit breaker is OPEN for service '{service}'. Retry after {:.1} seconds", .retry_after.as_secs_f64())]
pub struct CircuitOpenError {
    /// Name of the protected service
    pub service: String,
    /// Remaining time before the breaker will admit a recovery probe
    pub retry_after: Duration,
}

/// Outcome of a guarded call that did not succeed.
///
/// `Inner` holds the operation's own error untouched, so callers can handle
/// it exactly as if the breaker were not there.
#[derive(Debug)]
pub enum GuardError<E> {
    /// The breaker refused to run the operation.
    Open(CircuitOpenError),
    /// The operation ran and failed.
    Inner(E),
}

impl<E> GuardError<E> {
    /// Returns `true` if the breaker rejected the call.
    pub fn is_open(&self) -> bool {
        matches!(self, GuardError::Open(_))
    }

    /// The operation's error, if the operation ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            GuardError::Inner(e) => Some(e),
            GuardError::Open(_) => None,
        }
    }

    /// The rejection, if the breaker refused the call.
    pub fn as_open(&self) -> Option<&CircuitOpenError> {
        match self {
            GuardError::Open(e) => Some(e),
            GuardError::Inner(_) => None,
        }
    }
}

impl<E> From<CircuitOpenError> for GuardError<E> {
    fn from(err: CircuitOpenError) -> Self {
        GuardError::Open(err)
    }
}

impl<E: fmt::Display> fmt::Display for GuardError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardError::Open(e) => write!(f, "{}", e),
            GuardError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GuardError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GuardError::Open(_) => None,
            GuardError::Inner(e) => e.source(),
        }
    }
}

/// Errors raised by a distributed bucket store.
///
/// These never reach callers of `consume`; they trigger the local fallback.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The store could not be reached or refused the command
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer within the configured timeout
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with something the bucket script never returns
    #[error("Invalid store reply: {0}")]
    InvalidReply(String),
}
