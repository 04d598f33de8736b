use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::buffer::metrics::MetricsSink;
use crate::config::CircuitBreakerConfig;

#[derive(Error, Debug)]
pub enum CircuitError<E> {
    #[error("Circuit breaker is open")]
    Open,
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub open_transitions: u64,
    pub rejected_calls: u64,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    total_failures: u64,
    total_successes: u64,
    open_transitions: u64,
    rejected_calls: u64,
    opened_at: Option<Instant>,
}

/// Wraps a fallible async operation and fails fast once the operation
/// has failed `failure_threshold` times in a row. After `cooldown`, a
/// single trial call is allowed through; its outcome decides whether the
/// breaker closes again or re-opens.
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    metrics: Arc<dyn MetricsSink>,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            cooldown: config.cooldown,
            metrics,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                total_failures: 0,
                total_successes: 0,
                open_transitions: 0,
                rejected_calls: 0,
                opened_at: None,
            }),
        }
    }

    /// Runs `operation` unless the breaker is open and still cooling
    /// down, in which case the operation is not invoked at all.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire() {
            return Err(CircuitError::Open);
        }

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(CircuitError::Inner(err))
            }
        }
    }

    /// Admission check. Transitions open -> half-open when the cooldown
    /// has elapsed, allowing exactly one trial call.
    fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                // A trial is already in flight; reject concurrent calls.
                inner.rejected_calls += 1;
                false
            }
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.cooldown);
                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    self.record_transition("half_open");
                    tracing::debug!("circuit breaker half-open, allowing trial call");
                    true
                } else {
                    inner.rejected_calls += 1;
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.total_successes += 1;
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            self.record_transition("closed");
            tracing::info!("circuit breaker closed after successful trial");
        }
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.total_failures += 1;
        inner.consecutive_failures += 1;

        let should_open = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.failure_threshold;
        if should_open && inner.state != CircuitState::Open {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.open_transitions += 1;
            self.record_transition("open");
            tracing::warn!(
                consecutive_failures = inner.consecutive_failures,
                "circuit breaker opened"
            );
        }
    }

    fn record_transition(&self, state: &str) {
        self.metrics
            .increment_counter("ingest_circuit_transitions_total", &[("state", state)], 1);
    }

    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open => !inner
                .opened_at
                .is_some_and(|at| at.elapsed() >= self.cooldown),
            _ => false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock();
        CircuitStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            open_transitions: inner.open_transitions,
            rejected_calls: inner.rejected_calls,
        }
    }

    /// Manual override: closes the breaker and clears failure counts.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            self.record_transition("closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::metrics::{AtomicMetricsSink, NoopMetricsSink};

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown,
            },
            Arc::new(NoopMetricsSink),
        )
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = breaker(2, Duration::from_secs(60));

        for _ in 0..2 {
            let result: Result<(), _> = breaker.execute(|| async { Err::<(), _>("io") }).await;
            assert!(matches!(result, Err(CircuitError::Inner(_))));
        }
        assert!(breaker.is_open());

        // The wrapped operation must not run while open.
        let mut invoked = false;
        let result: Result<(), CircuitError<&str>> = breaker
            .execute(|| {
                invoked = true;
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(CircuitError::Open)));
        assert!(!invoked);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let breaker = breaker(3, Duration::from_secs(60));
        let _: Result<(), CircuitError<&str>> =
            breaker.execute(|| async { Err::<(), _>("x") }).await;
        let _: Result<(), CircuitError<&str>> =
            breaker.execute(|| async { Err::<(), _>("x") }).await;
        let _ = breaker.execute(|| async { Ok::<_, &str>(()) }).await;
        let _: Result<(), CircuitError<&str>> =
            breaker.execute(|| async { Err::<(), _>("x") }).await;
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn half_open_trial_closes_on_success() {
        let breaker = breaker(1, Duration::from_millis(10));
        let _: Result<(), CircuitError<&str>> =
            breaker.execute(|| async { Err::<(), _>("x") }).await;
        assert!(breaker.is_open());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = breaker.execute(|| async { Ok::<_, &str>("ok") }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_trial_reopens_on_failure() {
        let breaker = breaker(1, Duration::from_millis(10));
        let _: Result<(), CircuitError<&str>> =
            breaker.execute(|| async { Err::<(), _>("x") }).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        let result: Result<(), _> = breaker.execute(|| async { Err::<(), _>("x") }).await;
        assert!(matches!(result, Err(CircuitError::Inner(_))));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.is_open());
    }

    #[tokio::test]
    async fn state_transitions_reach_the_metrics_sink() {
        let sink = Arc::new(AtomicMetricsSink::new());
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::from_millis(10),
            },
            sink.clone() as Arc<dyn MetricsSink>,
        );

        let _: Result<(), CircuitError<&str>> =
            breaker.execute(|| async { Err::<(), _>("x") }).await;
        assert_eq!(
            sink.counter_value_with("ingest_circuit_transitions_total", &[("state", "open")]),
            1
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = breaker.execute(|| async { Ok::<_, &str>(()) }).await;
        assert_eq!(
            sink.counter_value_with(
                "ingest_circuit_transitions_total",
                &[("state", "half_open")]
            ),
            1
        );
        assert_eq!(
            sink.counter_value_with("ingest_circuit_transitions_total", &[("state", "closed")]),
            1
        );
    }

    #[tokio::test]
    async fn reset_closes_an_open_breaker() {
        let breaker = breaker(1, Duration::from_secs(60));
        let _: Result<(), CircuitError<&str>> =
            breaker.execute(|| async { Err::<(), _>("x") }).await;
        assert!(breaker.is_open());
        breaker.reset();
        assert!(!breaker.is_open());
        assert_eq!(breaker.stats().consecutive_failures, 0);
    }
}
