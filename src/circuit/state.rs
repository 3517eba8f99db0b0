//! Circuit breaker configuration and state records.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::to_datetime;
use crate::error::{BulwarkError, Result};

/// Phase of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Calls pass through
    Closed,
    /// Calls are rejected until the recovery timeout elapses
    Open,
    /// A single probe call at a time tests whether the dependency recovered
    HalfOpen,
}

impl Phase {
    /// Value exported on the phase gauge.
    pub fn gauge_value(&self) -> f64 {
        match self {
            Phase::Closed => 0.0,
            Phase::Open => 1.0,
            Phase::HalfOpen => 2.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Closed => "closed",
            Phase::Open => "open",
            Phase::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for one circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Classified failures in Closed before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Successes in HalfOpen before the circuit closes
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Time the circuit stays open before admitting a recovery probe
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,

    /// Error kinds that count as failures. Empty means every error counts.
    #[serde(default)]
    pub retryable_errors: HashSet<String>,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_timeout_seconds() -> f64 {
    60.0
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_seconds: default_timeout_seconds(),
            retryable_errors: HashSet::new(),
        }
    }
}

impl CircuitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = timeout.as_secs_f64();
        self
    }

    /// Restrict failures to the given error kinds.
    pub fn with_retryable_errors<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_errors = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Saturates at `Duration::MAX` for values [`validate`](Self::validate)
    /// would reject.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_seconds).unwrap_or(Duration::MAX)
    }

    /// Whether an error of `kind` counts against circuit health.
    pub fn is_retryable(&self, kind: &str) -> bool {
        self.retryable_errors.is_empty() || self.retryable_errors.contains(kind)
    }

    /// Reject thresholds of zero and non-positive timeouts.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(BulwarkError::Config(
                "failure_threshold must be greater than zero".to_string(),
            ));
        }
        if self.success_threshold == 0 {
            return Err(BulwarkError::Config(
                "success_threshold must be greater than zero".to_string(),
            ));
        }
        if !self.timeout_seconds.is_finite() || self.timeout_seconds <= 0.0 {
            return Err(BulwarkError::Config(format!(
                "timeout_seconds must be a positive number, got {}",
                self.timeout_seconds
            )));
        }
        if Duration::try_from_secs_f64(self.timeout_seconds).is_err() {
            return Err(BulwarkError::Config(format!(
                "timeout_seconds {} is too large",
                self.timeout_seconds
            )));
        }
        Ok(())
    }
}

/// Mutable state of one circuit, guarded by its breaker's lock.
#[derive(Debug, Clone)]
pub struct CircuitState {
    pub name: String,
    pub phase: Phase,
    pub failures: u64,
    pub successes: u64,
    pub total_requests: u64,
    pub state_changes: u64,
    /// Calls rejected while open
    pub rejected: u64,
    pub last_failure_at: Option<Duration>,
    pub last_success_at: Option<Duration>,
    pub opened_at: Option<Duration>,
    /// A half-open probe is currently running
    pub probe_in_flight: bool,
    /// Bumped on every phase change and reset; admissions from an older
    /// epoch cannot drive transitions.
    pub epoch: u64,
}

impl CircuitState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: Phase::Closed,
            failures: 0,
            successes: 0,
            total_requests: 0,
            state_changes: 0,
            rejected: 0,
            last_failure_at: None,
            last_success_at: None,
            opened_at: None,
            probe_in_flight: false,
            epoch: 0,
        }
    }

    /// Time since the circuit opened, if it is open.
    pub fn open_elapsed(&self, now: Duration) -> Option<Duration> {
        self.opened_at.map(|at| now.saturating_sub(at))
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            service_name: self.name.clone(),
            state: self.phase,
            failures: self.failures,
            successes: self.successes,
            total_requests: self.total_requests,
            state_changes: self.state_changes,
            rejected: self.rejected,
            last_failure_time: self.last_failure_at.and_then(to_datetime),
            last_success_time: self.last_success_at.and_then(to_datetime),
            opened_at: self.opened_at.and_then(to_datetime),
        }
    }
}

/// Read-only view of a circuit, suitable for admin endpoints and logs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub service_name: String,
    pub state: Phase,
    pub failures: u64,
    pub successes: u64,
    pub total_requests: u64,
    pub state_changes: u64,
    pub rejected: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
}
