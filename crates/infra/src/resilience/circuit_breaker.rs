//! Circuit breaker guarding fragile downstream calls.
//!
//! One breaker per protected operation name. State is process-local: each
//! process decides on its own whether a dependency looks unhealthy.
//!
//! Transitions:
//! - `Closed -> Open` once consecutive failures reach `failure_threshold`
//! - `Open -> HalfOpen` on the first call at or after `last_failure_at + recovery_timeout`
//! - `HalfOpen -> Closed` when the single trial call succeeds
//! - `HalfOpen -> Open` when it fails (refreshing `last_failure_at`)

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use modbridge_core::Clock;
use modbridge_observability::Metrics;

use crate::jobs::types::saturating_add;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are rejected without invoking the operation
    Open,
    /// One trial call decides the next state
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl core::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time after the last failure before a trial call is allowed
    pub recovery_timeout: Duration,
    /// How often the monitor logs the error rate
    pub monitoring_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            monitoring_interval: Duration::from_secs(10),
        }
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// The operation was not invoked.
    #[error("circuit breaker '{name}' is open; retry in {retry_after:?}")]
    Open { name: String, retry_after: Duration },
    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitBreakerError::Inner(e) => Some(e),
            CircuitBreakerError::Open { .. } => None,
        }
    }
}

/// Read view of a breaker for the operational surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub request_count: u64,
    pub error_rate: f64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    /// When an open breaker will admit its trial call
    pub next_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Counters {
    failure_count: u32,
    success_count: u64,
    request_count: u64,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    counters: Counters,
}

/// Process-local circuit breaker for one named operation.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            clock,
            metrics,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                counters: Counters::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Run `op` through the breaker.
    ///
    /// The lock is never held across the operation; a hung operation hangs
    /// only this call.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut permit = match self.admit() {
            Ok(permit) => permit,
            Err(retry_after) => {
                return Err(CircuitBreakerError::Open {
                    name: self.name.clone(),
                    retry_after,
                });
            }
        };

        match op().await {
            Ok(value) => {
                permit.settle(true);
                Ok(value)
            }
            Err(err) => {
                permit.settle(false);
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let guard = self.lock();
        let c = &guard.counters;
        let error_rate = if c.request_count == 0 {
            0.0
        } else {
            c.request_count.saturating_sub(c.success_count) as f64 / c.request_count as f64
        };
        let next_attempt_at = match guard.state {
            CircuitState::Open => c
                .last_failure_at
                .map(|at| saturating_add(at, self.config.recovery_timeout)),
            _ => None,
        };

        CircuitBreakerStatus {
            name: self.name.clone(),
            state: guard.state,
            failure_count: c.failure_count,
            success_count: c.success_count,
            request_count: c.request_count,
            error_rate,
            last_failure_at: c.last_failure_at,
            last_success_at: c.last_success_at,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_ms: self.config.recovery_timeout.as_millis() as u64,
            next_attempt_at,
        }
    }

    /// Force `Closed` and zero every counter.
    pub fn reset(&self) {
        let mut guard = self.lock();
        guard.counters = Counters::default();
        self.transition(&mut guard, CircuitState::Closed);
        info!(breaker = %self.name, "circuit breaker reset");
    }

    /// Open the circuit now; the recovery window starts from this moment.
    pub fn force_open(&self) {
        let mut guard = self.lock();
        guard.counters.last_failure_at = Some(self.clock.now());
        guard.counters.trial_in_flight = false;
        self.transition(&mut guard, CircuitState::Open);
        warn!(breaker = %self.name, "circuit breaker forced open");
    }

    /// Close the circuit and clear the failure streak.
    pub fn force_close(&self) {
        let mut guard = self.lock();
        guard.counters.failure_count = 0;
        guard.counters.trial_in_flight = false;
        self.transition(&mut guard, CircuitState::Closed);
        info!(breaker = %self.name, "circuit breaker forced closed");
    }

    /// Log and export the error rate every `monitoring_interval` until the handle is dropped.
    pub fn spawn_monitor(self: &Arc<Self>) -> MonitorHandle {
        let weak: Weak<Self> = Arc::downgrade(self);
        let every = self.config.monitoring_interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(breaker) = weak.upgrade() else {
                    break;
                };
                let status = breaker.status();
                breaker
                    .metrics
                    .record_breaker_error_rate(&status.name, status.error_rate);
                info!(
                    breaker = %status.name,
                    state = %status.state,
                    requests = status.request_count,
                    successes = status.success_count,
                    error_rate = status.error_rate,
                    "circuit breaker stats"
                );
            }
        });

        MonitorHandle { task }
    }

    /// Decide whether a call may run. `Err` carries the time left until a trial.
    fn admit(&self) -> Result<Permit<'_>, Duration> {
        let now = self.clock.now();
        let mut guard = self.lock();
        guard.counters.request_count += 1;

        let admitted = match guard.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed = guard
                    .counters
                    .last_failure_at
                    .map(|at| (now - at).to_std().unwrap_or(Duration::ZERO));
                match elapsed {
                    Some(elapsed) if elapsed < self.config.recovery_timeout => {
                        Err(self.config.recovery_timeout - elapsed)
                    }
                    _ => {
                        self.transition(&mut guard, CircuitState::HalfOpen);
                        guard.counters.trial_in_flight = true;
                        Ok(true)
                    }
                }
            }
            CircuitState::HalfOpen if guard.counters.trial_in_flight => Err(Duration::ZERO),
            CircuitState::HalfOpen => {
                guard.counters.trial_in_flight = true;
                Ok(true)
            }
        };
        drop(guard);

        match admitted {
            Ok(trial) => Ok(Permit {
                breaker: self,
                trial,
                settled: false,
            }),
            Err(retry_after) => {
                self.metrics.record_breaker_call(&self.name, "rejected");
                debug!(breaker = %self.name, ?retry_after, "call rejected by open circuit");
                Err(retry_after)
            }
        }
    }

    fn record(&self, trial: bool, success: bool) {
        let now = self.clock.now();
        let mut guard = self.lock();

        if success {
            guard.counters.success_count += 1;
            guard.counters.last_success_at = Some(now);
            if trial {
                guard.counters.trial_in_flight = false;
                guard.counters.failure_count = 0;
                self.transition(&mut guard, CircuitState::Closed);
            } else if guard.state == CircuitState::Closed {
                guard.counters.failure_count = 0;
            }
        } else {
            guard.counters.failure_count = guard.counters.failure_count.saturating_add(1);
            guard.counters.last_failure_at = Some(now);
            if trial {
                guard.counters.trial_in_flight = false;
                self.transition(&mut guard, CircuitState::Open);
            } else if guard.state == CircuitState::Closed
                && guard.counters.failure_count >= self.config.failure_threshold
            {
                self.transition(&mut guard, CircuitState::Open);
            }
        }
        drop(guard);

        let outcome = if success { "success" } else { "failure" };
        self.metrics.record_breaker_call(&self.name, outcome);
    }

    /// A trial whose caller went away before it finished frees the slot.
    fn abandon_trial(&self) {
        let mut guard = self.lock();
        if guard.state == CircuitState::HalfOpen {
            guard.counters.trial_in_flight = false;
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn transition(&self, guard: &mut BreakerState, to: CircuitState) {
        if guard.state == to {
            return;
        }
        let from = guard.state;
        guard.state = to;
        self.metrics.record_breaker_transition(&self.name, to.as_str());
        info!(breaker = %self.name, from = %from, to = %to, "circuit breaker state changed");
    }
}

struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    fn settle(&mut self, success: bool) {
        self.settled = true;
        self.breaker.record(self.trial, success);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.abandon_trial();
        }
    }
}

/// Owned handle to a breaker's monitor task. Dropping it stops the task.
#[derive(Debug)]
pub struct MonitorHandle {
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use modbridge_core::ManualClock;
    use modbridge_observability::metrics::names;
    use modbridge_observability::metrics::test_harness::MetricTestHarness;
    use proptest::prelude::*;

    fn breaker(threshold: u32, recovery: Duration) -> (CircuitBreaker, ManualClock, MetricTestHarness) {
        let clock = ManualClock::starting_now();
        let metrics = MetricTestHarness::new();
        let b = CircuitBreaker::new(
            "guild.sync",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: recovery,
                monitoring_interval: Duration::from_secs(10),
            },
            Arc::new(clock.clone()),
            metrics.metrics.clone(),
        );
        (b, clock, metrics)
    }

    async fn fail(b: &CircuitBreaker) -> CircuitBreakerError<&'static str> {
        b.call(|| async { Err::<(), _>("down") }).await.unwrap_err()
    }

    async fn succeed(b: &CircuitBreaker) -> Result<u32, CircuitBreakerError<&'static str>> {
        b.call(|| async { Ok(7) }).await
    }

    #[tokio::test]
    async fn opens_after_threshold_and_short_circuits() {
        let (b, _clock, metrics) = breaker(3, Duration::from_secs(30));
        for _ in 0..3 {
            assert!(matches!(fail(&b).await, CircuitBreakerError::Inner("down")));
        }
        assert_eq!(b.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let err = b
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_open());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(
            metrics.counter(names::BREAKER_CALLS, &[("breaker", "guild.sync"), ("outcome", "rejected")]),
            1
        );
        assert_eq!(
            metrics.counter(names::BREAKER_TRANSITIONS, &[("breaker", "guild.sync"), ("state", "OPEN")]),
            1
        );
    }

    #[tokio::test]
    async fn success_in_closed_resets_failure_streak() {
        let (b, _clock, _) = breaker(3, Duration::from_secs(30));
        fail(&b).await;
        fail(&b).await;
        succeed(&b).await.unwrap();
        fail(&b).await;
        fail(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.status().failure_count, 2);
    }

    #[tokio::test]
    async fn recovery_window_boundary_admits_one_trial() {
        let (b, clock, _) = breaker(1, Duration::from_secs(30));
        fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);

        clock.advance(Duration::from_millis(29_999));
        match fail(&b).await {
            CircuitBreakerError::Open { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_millis(1));
            }
            other => panic!("expected open, got {other:?}"),
        }

        clock.advance(Duration::from_millis(1));
        let invoked = AtomicU32::new(0);
        b.call(|| async {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok::<_, &str>(())
        })
        .await
        .unwrap();
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.status().failure_count, 0);
    }

    #[tokio::test]
    async fn failed_trial_reopens_and_refreshes_window() {
        let (b, clock, _) = breaker(1, Duration::from_secs(10));
        fail(&b).await;
        clock.advance(Duration::from_secs(10));

        assert!(matches!(fail(&b).await, CircuitBreakerError::Inner(_)));
        assert_eq!(b.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(5));
        assert!(fail(&b).await.is_open());
        let status = b.status();
        assert_eq!(status.next_attempt_at, status.last_failure_at.map(|t| t + chrono::Duration::seconds(10)));
    }

    #[tokio::test]
    async fn unbounded_recovery_timeout_saturates_next_attempt() {
        let (b, _clock, _) = breaker(1, Duration::MAX);
        fail(&b).await;

        let status = b.status();
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.next_attempt_at, Some(chrono::DateTime::<chrono::Utc>::MAX_UTC));
        assert!(fail(&b).await.is_open());
    }

    #[tokio::test]
    async fn concurrent_calls_during_trial_are_rejected() {
        let (b, clock, _) = breaker(1, Duration::from_secs(1));
        fail(&b).await;
        clock.advance(Duration::from_secs(1));

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = b.call(|| async move {
            let _ = release_rx.await;
            Ok::<_, &str>(())
        });
        tokio::pin!(trial);

        // Drive the trial until it parks on the channel.
        assert!(futures_poll_once(trial.as_mut()).await.is_none());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(succeed(&b).await.unwrap_err().is_open());

        release_tx.send(()).unwrap();
        trial.await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    async fn futures_poll_once<F: Future + Unpin>(mut fut: F) -> Option<F::Output> {
        std::future::poll_fn(|cx| match std::pin::Pin::new(&mut fut).poll(cx) {
            std::task::Poll::Ready(v) => std::task::Poll::Ready(Some(v)),
            std::task::Poll::Pending => std::task::Poll::Ready(None),
        })
        .await
    }

    #[tokio::test]
    async fn status_counts_every_request() {
        let (b, _clock, _) = breaker(2, Duration::from_secs(30));
        succeed(&b).await.unwrap();
        fail(&b).await;
        fail(&b).await;
        fail(&b).await; // rejected

        let status = b.status();
        assert_eq!(status.request_count, 4);
        assert_eq!(status.success_count, 1);
        assert!((status.error_rate - 0.75).abs() < f64::EPSILON);
        assert_eq!(status.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn manual_overrides() {
        let (b, clock, _) = breaker(5, Duration::from_secs(30));
        b.force_open();
        assert!(fail(&b).await.is_open());

        b.force_close();
        succeed(&b).await.unwrap();

        b.force_open();
        clock.advance(Duration::from_secs(30));
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);

        b.reset();
        let status = b.status();
        assert_eq!(status.request_count, 0);
        assert_eq!(status.success_count, 0);
        assert_eq!(status.last_success_at, None);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_reports_error_rate_until_dropped() {
        let (b, _clock, metrics) = breaker(5, Duration::from_secs(30));
        succeed(&b).await.unwrap();
        for _ in 0..3 {
            fail(&b).await;
        }
        let b = Arc::new(b);
        let labels = [("breaker", "guild.sync")];

        let handle = b.spawn_monitor();
        assert_eq!(metrics.gauge(names::BREAKER_ERROR_RATE, &labels), None);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(metrics.gauge(names::BREAKER_ERROR_RATE, &labels), Some(0.75));
        assert!(!handle.is_finished());

        drop(handle);
        succeed(&b).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(metrics.gauge(names::BREAKER_ERROR_RATE, &labels), Some(0.75));
        assert!((b.status().error_rate - 0.6).abs() < f64::EPSILON);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: once the streak reaches the threshold while closed, the
        /// next call is rejected without running the operation.
        #[test]
        fn threshold_streak_always_opens(outcomes in prop::collection::vec(any::<bool>(), 1..60), threshold in 1u32..6) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let (b, _clock, _) = breaker(threshold, Duration::from_secs(60));
                let mut streak = 0u32;
                for ok in outcomes {
                    let was_open = b.state() == CircuitState::Open;
                    let invoked = AtomicU32::new(0);
                    let result = b.call(|| async {
                        invoked.fetch_add(1, Ordering::SeqCst);
                        if ok { Ok(()) } else { Err("x") }
                    }).await;

                    if was_open {
                        let rejected = matches!(result, Err(CircuitBreakerError::Open { .. }));
                        prop_assert!(rejected);
                        prop_assert_eq!(invoked.load(Ordering::SeqCst), 0);
                        continue;
                    }

                    streak = if ok { 0 } else { streak + 1 };
                    if streak >= threshold {
                        prop_assert_eq!(b.state(), CircuitState::Open);
                    }
                }
                Ok(())
            })?;
        }
    }
}
