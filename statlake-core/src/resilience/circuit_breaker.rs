//! Circuit breaker guarding the upstream data source.
//!
//! CLOSED → (N consecutive failures) → OPEN → (recovery timeout) → HALF_OPEN.
//! A half-open breaker admits exactly one trial call: success closes it,
//! failure re-opens it. While open, callers fail fast without touching the
//! wrapped operation. HTTP 403 trips the breaker immediately.

use crate::clock::{system_clock, Clock};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Refusing calls until the recovery timeout expires.
    Open,
    /// One trial call may test for recovery.
    HalfOpen,
}

/// Returned when the breaker refuses a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("circuit open (retry in {}ms)", .remaining.as_millis())]
pub struct CircuitOpen {
    pub remaining: Duration,
}

/// Error from [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum CallError<E> {
    #[error(transparent)]
    Open(CircuitOpen),
    #[error(transparent)]
    Inner(E),
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

/// Circuit breaker that prevents hammering a failing provider.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a breaker using the system clock.
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self::with_clock(failure_threshold, recovery_timeout, system_clock())
    }

    pub fn with_clock(
        failure_threshold: u32,
        recovery_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                last_failure_at: None,
                trial_in_flight: false,
            }),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            clock,
        }
    }

    /// Default upstream breaker: trips after 5 consecutive failures, 60s recovery.
    pub fn default_upstream() -> Self {
        Self::new(5, Duration::from_secs(60))
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Ask for permission to make one call.
    ///
    /// The returned permit must be resolved with [`BreakerPermit::success`] or
    /// [`BreakerPermit::failure`]. Dropping it unresolved releases a half-open
    /// trial slot without changing state.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, CircuitOpen> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(BreakerPermit::new(self, false)),
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!("circuit breaker half-open, admitting trial call");
                    Ok(BreakerPermit::new(self, true))
                } else {
                    Err(CircuitOpen {
                        remaining: self.recovery_timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(CircuitOpen {
                        remaining: Duration::ZERO,
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(BreakerPermit::new(self, true))
                }
            }
        }
    }

    /// Check if a call would currently be admitted, without reserving a slot.
    pub fn is_allowed(&self) -> bool {
        let now = self.clock.now();
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !inner.trial_in_flight,
            CircuitState::Open => inner
                .opened_at
                .map(|at| now.saturating_duration_since(at) >= self.recovery_timeout)
                .unwrap_or(true),
        }
    }

    /// Run `f` under the breaker.
    pub fn call<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, CallError<E>> {
        let permit = self.try_acquire().map_err(CallError::Open)?;
        match f() {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(CallError::Inner(e))
            }
        }
    }

    /// Record a successful request. Resets the failure counter and closes the breaker.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!("circuit breaker closed after successful trial");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// Record a failure. Trips the breaker at the threshold or on a failed trial.
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_at = Some(wall);
        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failure_count >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            tracing::warn!(
                failure_count = inner.failure_count,
                threshold = self.failure_threshold,
                recovery_timeout_ms = self.recovery_timeout.as_millis() as u64,
                "circuit breaker opened"
            );
        }
        inner.trial_in_flight = false;
    }

    /// Immediately trip the breaker (for 403 Forbidden / IP ban).
    pub fn trip(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.last_failure_at = Some(self.clock.wall());
        inner.trial_in_flight = false;
        tracing::warn!("circuit breaker tripped");
    }

    /// Current state. An open breaker whose recovery timeout has elapsed reports `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now();
        let inner = self.inner.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at))
                if now.saturating_duration_since(at) >= self.recovery_timeout =>
            {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state();
        let inner = self.inner.lock();
        CircuitSnapshot {
            state,
            failure_count: inner.failure_count,
            failure_threshold: self.failure_threshold,
            last_failure_at: inner.last_failure_at,
        }
    }

    /// Remaining cooldown time (zero if not open).
    pub fn remaining_cooldown(&self) -> Duration {
        let now = self.clock.now();
        let inner = self.inner.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) => self
                .recovery_timeout
                .saturating_sub(now.saturating_duration_since(at)),
            _ => Duration::ZERO,
        }
    }

    fn release_trial(&self) {
        self.inner.lock().trial_in_flight = false;
    }
}

/// Permission for a single call through the breaker.
#[must_use = "resolve the permit with success() or failure()"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            resolved: false,
        }
    }

    /// Whether this permit is the half-open recovery trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record_failure();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.release_trial();
        }
    }
}
