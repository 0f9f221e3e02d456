//! Per-URL circuit breaker for session creation
//!
//! Counts consecutive session-creation failures only; tool-call failures on
//! an established session never trip the breaker. After `threshold`
//! consecutive failures the breaker opens for `reset` seconds, then admits a
//! single half-open trial whose outcome closes or re-opens the circuit.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Circuit states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing fast
    Open,
    /// One trial creation in flight
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    reset: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Breaker opening after `threshold` consecutive creation failures and
    /// re-trialing after `reset`.
    #[must_use]
    pub fn new(threshold: u32, reset: Duration) -> Self {
        Self {
            threshold,
            reset,
            inner: Mutex::new(Inner::Closed { failures: 0 }),
        }
    }

    /// Whether a session creation may proceed right now.
    ///
    /// An open breaker past its reset window transitions to half-open and
    /// admits the caller as the trial.
    pub fn allow_creation(&self) -> bool {
        let mut inner = self.inner.lock();
        match &*inner {
            Inner::Closed { .. } | Inner::HalfOpen => true,
            Inner::Open { since } => {
                if since.elapsed() >= self.reset {
                    *inner = Inner::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful session creation.
    pub fn record_success(&self) {
        *self.inner.lock() = Inner::Closed { failures: 0 };
    }

    /// Record a failed session creation.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match &mut *inner {
            Inner::Closed { failures } => {
                *failures += 1;
                if *failures >= self.threshold {
                    *inner = Inner::Open {
                        since: Instant::now(),
                    };
                }
            }
            Inner::HalfOpen => {
                *inner = Inner::Open {
                    since: Instant::now(),
                };
            }
            Inner::Open { .. } => {}
        }
    }

    /// Current state, for metrics.
    pub fn state(&self) -> CircuitState {
        match &*self.inner.lock() {
            Inner::Closed { .. } => CircuitState::Closed,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen => CircuitState::HalfOpen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_at_exactly_threshold() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(60));
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_creation());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_creation());
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_trial_closes_or_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        assert!(!breaker.allow_creation());

        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.allow_creation());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.allow_creation());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
