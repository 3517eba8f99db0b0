//! Write-only metrics sink.
//!
//! The core emits counters and gauges but never stores them. Sinks must not
//! block and must not fail; the `metrics` facade used by [`RecorderMetrics`]
//! silently drops everything when no recorder is installed.

use crate::circuit::Phase;
use crate::ratelimit::Decision;

/// Destination for rate limiter and circuit breaker telemetry.
pub trait MetricsSink: Send + Sync {
    /// A token bucket admitted or rejected a request.
    fn record_admission(&self, scope: &str, key: &str, decision: &Decision);

    /// A circuit breaker changed (or was reset to) a phase.
    fn record_circuit_phase(&self, service: &str, phase: Phase);

    /// A guarded call failed with a classified error.
    fn record_circuit_failure(&self, service: &str, kind: &str);

    /// A guarded call was rejected because the circuit was open.
    fn record_circuit_rejection(&self, service: &str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_admission(&self, _scope: &str, _key: &str, _decision: &Decision) {}
    fn record_circuit_phase(&self, _service: &str, _phase: Phase) {}
    fn record_circuit_failure(&self, _service: &str, _kind: &str) {}
    fn record_circuit_rejection(&self, _service: &str) {}
}

/// Emits through the global `metrics` recorder.
///
/// # Metrics
/// - `rate_limit_requests_total` (counter): admissions by scope, key, result
/// - `rate_limit_remaining` (gauge): tokens left by scope, key
/// - `circuit_breaker_state` (gauge): 0=closed, 1=open, 2=half-open
/// - `circuit_breaker_failures_total` (counter): by service, error kind
/// - `circuit_breaker_requests_rejected_total` (counter): by service
#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderMetrics;

impl MetricsSink for RecorderMetrics {
    fn record_admission(&self, scope: &str, key: &str, decision: &Decision) {
        let result = if decision.allowed { "allowed" } else { "rejected" };
        ::metrics::counter!(
            "rate_limit_requests_total",
            "scope" => scope.to_string(),
            "key" => key.to_string(),
            "result" => result
        )
        .increment(1);

        if decision.allowed {
            ::metrics::gauge!(
                "rate_limit_remaining",
                "scope" => scope.to_string(),
                "key" => key.to_string()
            )
            .set(decision.remaining as f64);
        }
    }

    fn record_circuit_phase(&self, service: &str, phase: Phase) {
        ::metrics::gauge!("circuit_breaker_state", "service" => service.to_string())
            .set(phase.gauge_value());
    }

    fn record_circuit_failure(&self, service: &str, kind: &str) {
        ::metrics::counter!(
            "circuit_breaker_failures_total",
            "service" => service.to_string(),
            "error_kind" => kind.to_string()
        )
        .increment(1);
    }

    fn record_circuit_rejection(&self, service: &str) {
        ::metrics::counter!(
            "circuit_breaker_requests_rejected_total",
            "service" => service.to_string()
        )
        .increment(1);
    }
}

/// In-memory sink for assertions in tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct CapturingMetrics {
    pub admissions: parking_lot::Mutex<Vec<(String, String, Decision)>>,
    pub phases: parking_lot::Mutex<Vec<(String, Phase)>>,
    pub failures: parking_lot::Mutex<Vec<(String, String)>>,
    pub rejections: parking_lot::Mutex<Vec<String>>,
}

#[cfg(test)]
impl MetricsSink for CapturingMetrics {
    fn record_admission(&self, scope: &str, key: &str, decision: &Decision) {
        self.admissions
            .lock()
            .push((scope.to_string(), key.to_string(), *decision));
    }

    fn record_circuit_phase(&self, service: &str, phase: Phase) {
        self.phases.lock().push((service.to_string(), phase));
    }

    fn record_circuit_failure(&self, service: &str, kind: &str) {
        self.failures
            .lock()
            .push((service.to_string(), kind.to_string()));
    }

    fn record_circuit_rejection(&self, service: &str) {
        self.rejections.lock().push(service.to_string());
    }
}
