//! Lazily created circuit breakers, one per downstream service.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::breaker::{CircuitBreaker, FailureKind};
use super::state::{CircuitConfig, CircuitSnapshot};
use crate::clock::Clock;
use crate::config::CircuitBreakingConfig;
use crate::error::{GuardError, Result};
use crate::metrics::MetricsSink;

/// Factory and cache of circuit breakers keyed by service name.
pub struct CircuitRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitConfig,
    overrides: HashMap<String, CircuitConfig>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl CircuitRegistry {
    /// Build a registry. Every configured circuit is validated up front.
    pub fn new(
        config: &CircuitBreakingConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            breakers: DashMap::new(),
            default_config: config.default.clone(),
            overrides: config.services.clone(),
            clock,
            metrics,
        })
    }

    /// The breaker for `service`, created on first use with its configured
    /// override or the default config.
    pub fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(service) {
            return breaker.clone();
        }

        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(service)
                    .unwrap_or(&self.default_config)
                    .clone();
                debug!(service = %service, "Creating circuit breaker");
                Arc::new(self.build(service, config))
            })
            .clone()
    }

    /// The breaker for `service`, created with `config` if it does not exist
    /// yet. An existing breaker keeps its original config.
    pub fn get_with(&self, service: &str, config: CircuitConfig) -> Result<Arc<CircuitBreaker>> {
        if let Some(breaker) = self.breakers.get(service) {
            return Ok(breaker.clone());
        }

        config.validate()?;
        Ok(self
            .breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                debug!(service = %service, "Creating circuit breaker with explicit config");
                Arc::new(self.build(service, config))
            })
            .clone())
    }

    /// Run `operation` through the breaker for `service`.
    pub async fn guard<F, Fut, T, E>(
        &self,
        service: &str,
        operation: F,
    ) -> std::result::Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: FailureKind,
    {
        self.get(service).guard(operation).await
    }

    /// Reset every breaker created so far.
    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.reset();
        }
    }

    /// Snapshots of every breaker, sorted by service name.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    fn build(&self, service: &str, config: CircuitConfig) -> CircuitBreaker {
        // Configs are validated before they reach here.
        CircuitBreaker::new(service, config, self.clock.clone(), self.metrics.clone())
            .unwrap_or_else(|e| unreachable!("validated circuit config rejected: {}", e))
    }
}
