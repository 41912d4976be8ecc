//! Three-state circuit breaker.
//!
//! Protects an unreliable collaborator (the database, the alert webhook)
//! from cascading failures. The breaker moves between three states:
//!
//! ```text
//! CLOSED --[failure_threshold consecutive failures]--> OPEN
//! OPEN   --[reset_timeout elapsed, next call]--------> HALF_OPEN
//! HALF_OPEN --[half_open_probes successes]-----------> CLOSED
//! HALF_OPEN --[any failure]--------------------------> OPEN
//! ```
//!
//! While OPEN the breaker rejects immediately with [`BreakerError::Open`],
//! which callers must treat as non-retryable. Every transition publishes a
//! numeric state gauge (`circuit_breaker.<name>.state`, 0 = closed,
//! 1 = open, 2 = half-open) and failures increment
//! `circuit_breaker.<name>.failures` on the injected registry.
//!
//! # Thread Safety
//!
//! State lives behind a single mutex; the guarded section only covers the
//! bookkeeping around each call, never the call itself.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::warn;

use crate::metrics::MetricsRegistry;

/// Default consecutive failures before the breaker opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time the breaker stays open before probing.
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(30);

/// Default successful probes required to close from half-open.
pub const DEFAULT_HALF_OPEN_PROBES: u32 = 2;

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are rejected immediately.
    Open,
    /// A limited number of probe calls pass through.
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used for the state gauge.
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Failure returned when the breaker rejects a call without forwarding it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("circuit breaker '{name}' is open")]
pub struct BreakerError {
    /// Breaker that rejected the call.
    pub name: String,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in CLOSED before opening.
    pub failure_threshold: u32,
    /// Time in OPEN before the next call is allowed through as a probe.
    pub reset_timeout: Duration,
    /// Successful probes in HALF_OPEN required to close.
    pub half_open_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            half_open_probes: DEFAULT_HALF_OPEN_PROBES,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    probe_successes: u32,
    last_change: Instant,
}

/// Three-state circuit breaker with metric emission on transitions.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
    registry: Arc<MetricsRegistry>,
}

impl CircuitBreaker {
    /// Creates a closed breaker publishing metrics under
    /// `circuit_breaker.<name>.*`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        config: BreakerConfig,
        registry: Arc<MetricsRegistry>,
    ) -> Self {
        let name = name.into();
        registry.set_gauge(
            &format!("circuit_breaker.{name}.state"),
            CircuitState::Closed.as_gauge(),
        );
        Self {
            name,
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                probe_successes: 0,
                last_change: Instant::now(),
            }),
            registry,
        }
    }

    /// Current breaker state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state.lock().expect("breaker lock poisoned").state
    }

    /// Asks the breaker for permission to place a call.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError`] while the breaker is open and the reset
    /// timeout has not elapsed.
    pub fn acquire(&self) -> Result<(), BreakerError> {
        let mut guard = self.state.lock().expect("breaker lock poisoned");
        match guard.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                if guard.last_change.elapsed() > self.config.reset_timeout {
                    self.transition(&mut guard, CircuitState::HalfOpen);
                    Ok(())
                } else {
                    Err(BreakerError {
                        name: self.name.clone(),
                    })
                }
            },
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut guard = self.state.lock().expect("breaker lock poisoned");
        match guard.state {
            CircuitState::Closed => {
                guard.consecutive_failures = 0;
            },
            CircuitState::HalfOpen => {
                guard.probe_successes += 1;
                if guard.probe_successes >= self.config.half_open_probes {
                    self.transition(&mut guard, CircuitState::Closed);
                }
            },
            CircuitState::Open => {},
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        self.registry
            .increment(&format!("circuit_breaker.{}.failures", self.name));
        let mut guard = self.state.lock().expect("breaker lock poisoned");
        match guard.state {
            CircuitState::Closed => {
                guard.consecutive_failures += 1;
                if guard.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut guard, CircuitState::Open);
                }
            },
            CircuitState::HalfOpen => {
                self.transition(&mut guard, CircuitState::Open);
            },
            CircuitState::Open => {},
        }
    }

    /// Runs `call` through the breaker, recording the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerOutcome::Rejected`] when the breaker is open (the
    /// call never ran), or [`BreakerOutcome::Inner`] with the call's own
    /// error.
    pub fn call<T, E>(&self, call: impl FnOnce() -> Result<T, E>) -> Result<T, BreakerOutcome<E>> {
        self.acquire().map_err(BreakerOutcome::Rejected)?;
        match call() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            },
            Err(err) => {
                self.record_failure();
                Err(BreakerOutcome::Inner(err))
            },
        }
    }

    fn transition(&self, guard: &mut BreakerState, next: CircuitState) {
        if guard.state == next {
            return;
        }
        warn!(breaker = %self.name, from = %guard.state, to = %next, "circuit breaker transition");
        guard.state = next;
        guard.last_change = Instant::now();
        guard.consecutive_failures = 0;
        guard.probe_successes = 0;
        self.registry.set_gauge(
            &format!("circuit_breaker.{}.state", self.name),
            next.as_gauge(),
        );
    }
}

/// Outcome of a guarded call: rejected by the breaker, or the call's own
/// failure.
#[derive(Debug, Error)]
pub enum BreakerOutcome<E> {
    /// The breaker was open; the call never ran.
    #[error(transparent)]
    Rejected(BreakerError),
    /// The call ran and failed.
    #[error(transparent)]
    Inner(E),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(reset_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: 3,
                reset_timeout,
                half_open_probes: 2,
            },
            Arc::new(MetricsRegistry::new()),
        )
    }

    #[test]
    fn opens_after_threshold_failures() {
        let b = breaker(Duration::from_secs(30));
        for _ in 0..2 {
            b.acquire().expect("closed");
            b.record_failure();
        }
        assert_eq!(b.state(), CircuitState::Closed);
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        // The very next call is rejected.
        assert!(b.acquire().is_err());
    }

    #[test]
    fn success_resets_failure_streak() {
        let b = breaker(Duration::from_secs(30));
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_after_reset_timeout_then_closes_on_probes() {
        let b = breaker(Duration::from_millis(10));
        for _ in 0..3 {
            b.record_failure();
        }
        assert_eq!(b.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(15));
        b.acquire().expect("probe allowed after reset timeout");
        assert_eq!(b.state(), CircuitState::HalfOpen);

        b.record_success();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let b = breaker(Duration::from_millis(10));
        for _ in 0..3 {
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(15));
        b.acquire().expect("probe allowed");
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn state_gauge_tracks_transitions() {
        let registry = Arc::new(MetricsRegistry::new());
        let b = CircuitBreaker::new(
            "db",
            BreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_secs(30),
                half_open_probes: 2,
            },
            Arc::clone(&registry),
        );
        assert_eq!(registry.gauge("circuit_breaker.db.state"), 0.0);
        b.record_failure();
        assert_eq!(registry.gauge("circuit_breaker.db.state"), 1.0);
        assert_eq!(registry.counter("circuit_breaker.db.failures"), 1);
    }

    #[test]
    fn call_wrapper_forwards_and_counts() {
        let b = breaker(Duration::from_secs(30));
        let ok: Result<i32, BreakerOutcome<&str>> = b.call(|| Ok(7));
        assert_eq!(ok.expect("ok"), 7);
        let err: Result<i32, BreakerOutcome<&str>> = b.call(|| Err("boom"));
        assert!(matches!(err, Err(BreakerOutcome::Inner("boom"))));
    }
}
