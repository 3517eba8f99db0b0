//! Circuit breaker state machine.
//!
//! # State Transitions
//! ```text
//! Closed   → Open:     failures >= failure_threshold
//! Open     → HalfOpen: timeout elapsed, checked lazily on the next call
//! HalfOpen → Closed:   successes >= success_threshold
//! HalfOpen → Open:     any classified failure
//! ```
//!
//! Only bookkeeping happens under the breaker's lock. The guarded operation
//! runs outside it, so a slow dependency never serializes callers. The
//! Open → HalfOpen transition and claiming the probe slot are one step, so
//! exactly one probe runs at a time.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::state::{CircuitConfig, CircuitSnapshot, CircuitState, Phase};
use crate::clock::Clock;
use crate::error::{CircuitOpenError, GuardError, Result};
use crate::metrics::MetricsSink;

/// Classifies an error for matching against `retryable_errors`.
pub trait FailureKind {
    fn failure_kind(&self) -> String;
}

impl FailureKind for std::io::Error {
    /// The `ErrorKind` variant name, e.g. `TimedOut`.
    fn failure_kind(&self) -> String {
        format!("{:?}", self.kind())
    }
}

/// How a guarded call ended.
enum Outcome<'a> {
    Success,
    Failure(&'a str),
    /// An error outside `retryable_errors`
    Ignored,
}

/// Admission to run one guarded call.
///
/// Dropping an unsettled permit (a cancelled future or a panicking
/// closure) frees the probe slot it may hold.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    epoch: u64,
    probe: bool,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            let mut state = self.breaker.state.lock();
            if state.epoch == self.epoch {
                state.probe_in_flight = false;
            }
        }
    }
}

/// Circuit breaker protecting one named dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    state: Mutex<CircuitState>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl CircuitBreaker {
    /// Create a closed breaker. Fails if `config` is invalid.
    pub fn new(
        name: impl Into<String>,
        config: CircuitConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;
        let name = name.into();

        Ok(Self {
            state: Mutex::new(CircuitState::new(name.clone())),
            name,
            config,
            clock,
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Current phase. An open circuit whose timeout has elapsed still
    /// reports `Open` until the next call moves it to `HalfOpen`.
    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        self.state.lock().snapshot()
    }

    /// Run `operation` if the circuit admits it.
    ///
    /// Errors are classified with [`FailureKind`]. The operation's error is
    /// returned unchanged in [`GuardError::Inner`].
    pub async fn guard<F, Fut, T, E>(&self, operation: F) -> std::result::Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: FailureKind,
    {
        self.guard_with(operation, |e: &E| e.failure_kind()).await
    }

    /// Like [`guard`](Self::guard) with a caller-supplied error classifier.
    pub async fn guard_with<F, Fut, T, E, C>(
        &self,
        operation: F,
        classify: C,
    ) -> std::result::Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        C: FnOnce(&E) -> String,
    {
        let permit = self.admit()?;
        let result = operation().await;
        self.complete(permit, result, classify)
    }

    /// Synchronous counterpart of [`guard`](Self::guard).
    pub fn guard_blocking<F, T, E>(&self, operation: F) -> std::result::Result<T, GuardError<E>>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        E: FailureKind,
    {
        self.guard_blocking_with(operation, |e: &E| e.failure_kind())
    }

    /// Synchronous counterpart of [`guard_with`](Self::guard_with).
    pub fn guard_blocking_with<F, T, E, C>(
        &self,
        operation: F,
        classify: C,
    ) -> std::result::Result<T, GuardError<E>>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        C: FnOnce(&E) -> String,
    {
        let permit = self.admit()?;
        let result = operation();
        self.complete(permit, result, classify)
    }

    /// Force the circuit closed and zero every counter.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let epoch = state.epoch;
        *state = CircuitState::new(self.name.clone());
        state.epoch = epoch + 1;
        drop(state);

        self.metrics.record_circuit_phase(&self.name, Phase::Closed);
        info!(service = %self.name, "Circuit breaker manually reset");
    }

    /// Decide whether a call may run, claiming the probe slot in HalfOpen.
    fn admit(&self) -> std::result::Result<Permit<'_>, CircuitOpenError> {
        let now = self.clock.now();
        let timeout = self.config.timeout();
        let mut state = self.state.lock();

        if state.phase == Phase::Open {
            let elapsed = state.open_elapsed(now).unwrap_or(Duration::ZERO);
            if elapsed < timeout {
                return Err(self.reject(&mut state, timeout - elapsed));
            }
            self.transition(&mut state, Phase::HalfOpen, now);
        }

        let probe = state.phase == Phase::HalfOpen;
        if probe {
            if state.probe_in_flight {
                return Err(self.reject(&mut state, Duration::ZERO));
            }
            state.probe_in_flight = true;
        }

        Ok(Permit {
            breaker: self,
            epoch: state.epoch,
            probe,
            settled: false,
        })
    }

    fn reject(&self, state: &mut CircuitState, retry_after: Duration) -> CircuitOpenError {
        state.rejected += 1;
        self.metrics.record_circuit_rejection(&self.name);
        debug!(
            service = %self.name,
            phase = %state.phase,
            retry_after_ms = retry_after.as_millis() as u64,
            "Circuit breaker rejected call"
        );

        CircuitOpenError {
            service: self.name.clone(),
            retry_after,
        }
    }

    fn complete<T, E, C>(
        &self,
        permit: Permit<'_>,
        result: std::result::Result<T, E>,
        classify: C,
    ) -> std::result::Result<T, GuardError<E>>
    where
        C: FnOnce(&E) -> String,
    {
        match result {
            Ok(value) => {
                self.settle(permit, Outcome::Success);
                Ok(value)
            }
            Err(e) => {
                let kind = classify(&e);
                if self.config.is_retryable(&kind) {
                    self.settle(permit, Outcome::Failure(&kind));
                } else {
                    debug!(
                        service = %self.name,
                        error_kind = %kind,
                        "Ignoring non-retryable error"
                    );
                    self.settle(permit, Outcome::Ignored);
                }
                Err(GuardError::Inner(e))
            }
        }
    }

    /// Record the outcome of an admitted call.
    ///
    /// Outcomes of calls admitted before the last phase change or reset
    /// only update totals and timestamps.
    fn settle(&self, mut permit: Permit<'_>, outcome: Outcome<'_>) {
        permit.settled = true;
        let now = self.clock.now();
        let mut state = self.state.lock();
        let current = permit.epoch == state.epoch;

        if permit.probe && current {
            state.probe_in_flight = false;
        }

        match outcome {
            Outcome::Ignored => {}
            Outcome::Success => {
                state.total_requests += 1;
                state.last_success_at = Some(now);
                if !current {
                    return;
                }

                state.successes += 1;
                if state.phase == Phase::HalfOpen
                    && state.successes >= u64::from(self.config.success_threshold)
                {
                    self.transition(&mut state, Phase::Closed, now);
                }
            }
            Outcome::Failure(kind) => {
                state.total_requests += 1;
                state.last_failure_at = Some(now);
                self.metrics.record_circuit_failure(&self.name, kind);
                if !current {
                    return;
                }

                state.failures += 1;
                let reopen = match state.phase {
                    Phase::Closed => state.failures >= u64::from(self.config.failure_threshold),
                    Phase::HalfOpen => true,
                    Phase::Open => false,
                };
                if reopen {
                    self.transition(&mut state, Phase::Open, now);
                }
            }
        }
    }

    fn transition(&self, state: &mut CircuitState, to: Phase, now: Duration) {
        let from = state.phase;
        state.phase = to;
        state.state_changes += 1;
        state.epoch += 1;

        match to {
            Phase::Open => {
                state.opened_at = Some(now);
                state.probe_in_flight = false;
                warn!(
                    service = %self.name,
                    from = %from,
                    failures = state.failures,
                    "Circuit breaker opened"
                );
            }
            Phase::HalfOpen => {
                state.successes = 0;
                info!(service = %self.name, "Circuit breaker entering half-open state");
            }
            Phase::Closed => {
                state.failures = 0;
                info!(
                    service = %self.name,
                    successes = state.successes,
                    "Circuit breaker closed"
                );
            }
        }

        self.metrics.record_circuit_phase(&self.name, to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::{CapturingMetrics, NoopMetrics};
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn breaker(config: CircuitConfig, clock: &ManualClock) -> CircuitBreaker {
        CircuitBreaker::new("backend", config, Arc::new(clock.clone()), Arc::new(NoopMetrics))
            .unwrap()
    }

    fn timeout_err() -> io::Error {
        io::Error::new(io::ErrorKind::TimedOut, "timed out")
    }

    async fn fail(b: &CircuitBreaker) -> std::result::Result<(), GuardError<io::Error>> {
        b.guard(|| async { Err::<(), _>(timeout_err()) }).await
    }

    async fn succeed(b: &CircuitBreaker) -> std::result::Result<u32, GuardError<io::Error>> {
        b.guard(|| async { Ok::<_, io::Error>(7) }).await
    }

    fn open_after(threshold: u32, timeout_secs: u64, clock: &ManualClock) -> CircuitBreaker {
        breaker(
            CircuitConfig::new()
                .with_failure_threshold(threshold)
                .with_success_threshold(2)
                .with_timeout(Duration::from_secs(timeout_secs)),
            clock,
        )
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = CircuitBreaker::new(
            "x",
            CircuitConfig::new().with_failure_threshold(0),
            Arc::new(ManualClock::default()),
            Arc::new(NoopMetrics),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_closed_passes_results_through() {
        let clock = ManualClock::default();
        let b = open_after(3, 10, &clock);

        assert_eq!(succeed(&b).await.unwrap(), 7);
        let snapshot = b.snapshot();
        assert_eq!(snapshot.state, Phase::Closed);
        assert_eq!(snapshot.successes, 1);
        assert_eq!(snapshot.total_requests, 1);
        assert!(snapshot.last_success_time.is_some());
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_rejects_without_invoking() {
        let clock = ManualClock::default();
        let b = open_after(3, 10, &clock);

        for _ in 0..2 {
            let err = fail(&b).await.unwrap_err();
            assert_eq!(err.into_inner().unwrap().kind(), io::ErrorKind::TimedOut);
            assert_eq!(b.phase(), Phase::Closed);
        }
        assert_err!(fail(&b).await);
        assert_eq!(b.phase(), Phase::Open);

        let invoked = AtomicUsize::new(0);
        clock.advance(Duration::from_secs(4));
        let result = b
            .guard(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, io::Error>(())
            })
            .await;

        let open = result.unwrap_err();
        let open = open.as_open().unwrap();
        assert_eq!(open.service, "backend");
        assert_eq!(open.retry_after, Duration::from_secs(6));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(b.snapshot().rejected, 1);
    }

    #[tokio::test]
    async fn test_successes_in_closed_do_not_reset_failures() {
        let clock = ManualClock::default();
        let b = open_after(3, 10, &clock);

        assert_err!(fail(&b).await);
        assert_ok!(succeed(&b).await);
        assert_err!(fail(&b).await);
        assert_ok!(succeed(&b).await);
        assert_err!(fail(&b).await);

        assert_eq!(b.phase(), Phase::Open);
    }

    #[tokio::test]
    async fn test_recovery_probe_after_timeout() {
        let clock = ManualClock::new(Duration::ZERO);
        let b = open_after(1, 10, &clock);

        assert_err!(fail(&b).await);
        assert_eq!(b.phase(), Phase::Open);

        clock.set(Duration::from_secs(11));
        assert_eq!(b.phase(), Phase::Open);
        assert_ok!(succeed(&b).await);
        assert_eq!(b.phase(), Phase::HalfOpen);
        assert_eq!(b.snapshot().successes, 1);
    }

    #[tokio::test]
    async fn test_half_open_success_path_closes() {
        let clock = ManualClock::default();
        let b = open_after(2, 10, &clock);

        assert_err!(fail(&b).await);
        assert_err!(fail(&b).await);
        clock.advance(Duration::from_secs(10));

        assert_ok!(succeed(&b).await);
        assert_eq!(b.phase(), Phase::HalfOpen);
        assert_ok!(succeed(&b).await);

        let snapshot = b.snapshot();
        assert_eq!(snapshot.state, Phase::Closed);
        assert_eq!(snapshot.failures, 0);
        assert_eq!(snapshot.state_changes, 3);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens_and_resets_timer() {
        let clock = ManualClock::new(Duration::ZERO);
        let b = open_after(1, 10, &clock);

        assert_err!(fail(&b).await);
        clock.set(Duration::from_secs(15));

        assert_err!(fail(&b).await);
        let snapshot = b.snapshot();
        assert_eq!(snapshot.state, Phase::Open);
        assert_eq!(snapshot.opened_at, crate::clock::to_datetime(Duration::from_secs(15)));

        // The new timer runs from t=15.
        clock.set(Duration::from_secs(20));
        let err = succeed(&b).await.unwrap_err();
        assert_eq!(err.as_open().unwrap().retry_after, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_non_retryable_errors_are_invisible() {
        let clock = ManualClock::default();
        let b = breaker(
            CircuitConfig::new()
                .with_failure_threshold(1)
                .with_retryable_errors(["TimedOut"]),
            &clock,
        );

        for _ in 0..5 {
            let err = b
                .guard(|| async {
                    Err::<(), _>(io::Error::new(io::ErrorKind::InvalidInput, "bad request"))
                })
                .await
                .unwrap_err();
            assert_eq!(err.into_inner().unwrap().kind(), io::ErrorKind::InvalidInput);
        }

        let snapshot = b.snapshot();
        assert_eq!(snapshot.state, Phase::Closed);
        assert_eq!(snapshot.failures, 0);
        assert_eq!(snapshot.total_requests, 0);

        assert_err!(fail(&b).await);
        assert_eq!(b.phase(), Phase::Open);
    }

    #[tokio::test]
    async fn test_single_probe_while_first_is_in_flight() {
        let clock = ManualClock::new(Duration::ZERO);
        let b = open_after(1, 10, &clock);
        assert_err!(fail(&b).await);
        clock.set(Duration::from_secs(11));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let probe = b.guard(|| async move {
            rx.await.map_err(|_| timeout_err())?;
            Ok::<_, io::Error>("recovered")
        });
        tokio::pin!(probe);
        assert!(futures::poll!(&mut probe).is_pending());
        assert_eq!(b.phase(), Phase::HalfOpen);

        let invoked = AtomicUsize::new(0);
        let second = b
            .guard(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, io::Error>("second")
            })
            .await;
        let rejected = second.unwrap_err();
        assert_eq!(rejected.as_open().unwrap().retry_after, Duration::ZERO);
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        tx.send(()).unwrap();
        assert_eq!(probe.await.unwrap(), "recovered");

        // The slot is free again for the next probe.
        assert_ok!(succeed(&b).await);
        assert_eq!(b.phase(), Phase::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_admit_one_probe() {
        let clock = ManualClock::new(Duration::ZERO);
        let b = Arc::new(open_after(1, 10, &clock));
        assert_err!(fail(&b).await);
        clock.set(Duration::from_secs(11));

        let admitted = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let b = b.clone();
                let admitted = admitted.clone();
                tokio::spawn(async move {
                    b.guard(|| async {
                        admitted.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, io::Error>(())
                    })
                    .await
                })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        let rejected = results
            .into_iter()
            .map(|r| r.unwrap())
            .filter(|r| matches!(r, Err(GuardError::Open(_))))
            .count();

        assert_eq!(admitted.load(Ordering::SeqCst), 1);
        assert_eq!(rejected, 15);
        assert_eq!(b.phase(), Phase::HalfOpen);
    }

    #[tokio::test]
    async fn test_dropped_probe_frees_slot() {
        let clock = ManualClock::new(Duration::ZERO);
        let b = open_after(1, 10, &clock);
        assert_err!(fail(&b).await);
        clock.set(Duration::from_secs(11));

        {
            let probe = b.guard(|| std::future::pending::<std::result::Result<(), io::Error>>());
            tokio::pin!(probe);
            assert!(futures::poll!(&mut probe).is_pending());
        }

        assert_ok!(succeed(&b).await);
    }

    #[tokio::test]
    async fn test_slow_call_does_not_block_other_callers() {
        let clock = ManualClock::default();
        let b = open_after(5, 10, &clock);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let slow = b.guard(|| async move {
            let _ = rx.await;
            Ok::<_, io::Error>(1)
        });
        tokio::pin!(slow);
        assert!(futures::poll!(&mut slow).is_pending());

        // The lock is not held while `slow` is pending.
        assert_eq!(succeed(&b).await.unwrap(), 7);

        tx.send(()).unwrap();
        assert_eq!(slow.await.unwrap(), 1);
        assert_eq!(b.snapshot().total_requests, 2);
    }

    #[tokio::test]
    async fn test_stale_outcomes_do_not_drive_transitions() {
        let clock = ManualClock::default();
        let b = open_after(1, 10, &clock);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let slow = b.guard(|| async move {
            let _ = rx.await;
            Err::<(), _>(timeout_err())
        });
        tokio::pin!(slow);
        assert!(futures::poll!(&mut slow).is_pending());

        assert_err!(fail(&b).await);
        assert_eq!(b.phase(), Phase::Open);
        let opened_at = b.snapshot().opened_at;

        clock.advance(Duration::from_secs(3));
        tx.send(()).unwrap();
        assert_err!(slow.await);

        let snapshot = b.snapshot();
        assert_eq!(snapshot.opened_at, opened_at);
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.total_requests, 2);
    }

    #[tokio::test]
    async fn test_reset_forces_closed() {
        let clock = ManualClock::default();
        let b = open_after(1, 60, &clock);

        assert_err!(fail(&b).await);
        assert_eq!(b.phase(), Phase::Open);

        b.reset();
        let snapshot = b.snapshot();
        assert_eq!(snapshot.state, Phase::Closed);
        assert_eq!(snapshot.failures, 0);
        assert_eq!(snapshot.total_requests, 0);
        assert!(snapshot.opened_at.is_none());
        assert_ok!(succeed(&b).await);
    }

    #[test]
    fn test_blocking_adapter_shares_state_machine() {
        let clock = ManualClock::default();
        let b = open_after(2, 10, &clock);

        for _ in 0..2 {
            let result = b.guard_blocking(|| Err::<(), _>(timeout_err()));
            assert!(matches!(result, Err(GuardError::Inner(_))));
        }
        assert_eq!(b.phase(), Phase::Open);

        let result = b.guard_blocking(|| Ok::<_, io::Error>(()));
        assert!(result.unwrap_err().is_open());
    }

    #[test]
    fn test_custom_classifier() {
        #[derive(Debug)]
        enum UpstreamError {
            Unavailable,
            NotFound,
        }

        let clock = ManualClock::default();
        let b = breaker(
            CircuitConfig::new()
                .with_failure_threshold(1)
                .with_retryable_errors(["unavailable"]),
            &clock,
        );
        let classify = |e: &UpstreamError| match e {
            UpstreamError::Unavailable => "unavailable".to_string(),
            UpstreamError::NotFound => "not_found".to_string(),
        };

        let _ = b.guard_blocking_with(|| Err::<(), _>(UpstreamError::NotFound), classify);
        assert_eq!(b.phase(), Phase::Closed);

        let _ = b.guard_blocking_with(|| Err::<(), _>(UpstreamError::Unavailable), classify);
        assert_eq!(b.phase(), Phase::Open);
    }

    #[tokio::test]
    async fn test_metrics_are_emitted() {
        let clock = ManualClock::default();
        let metrics = Arc::new(CapturingMetrics::default());
        let b = CircuitBreaker::new(
            "payments",
            CircuitConfig::new().with_failure_threshold(1),
            Arc::new(clock.clone()),
            metrics.clone(),
        )
        .unwrap();

        assert_err!(fail(&b).await);
        assert_err!(succeed(&b).await);

        assert_eq!(
            *metrics.phases.lock(),
            vec![("payments".to_string(), Phase::Open)]
        );
        assert_eq!(
            *metrics.failures.lock(),
            vec![("payments".to_string(), "TimedOut".to_string())]
        );
        assert_eq!(*metrics.rejections.lock(), vec!["payments".to_string()]);
    }
}
