//! Injectable time source.
//!
//! The circuit breaker, the rate limiter and the query cache never call
//! `Instant::now()` directly; they ask a `Clock`. Production code uses
//! `SystemClock`, tests use `ManualClock` and advance it explicitly so TTL and
//! window behaviour is deterministic.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A monotonic + wall-clock time source.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant, used for windows, cooldowns and TTLs.
    fn now(&self) -> Instant;

    /// Wall-clock time, used for persisted timestamps.
    fn wall(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shared handle to the system clock.
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    wall_base: DateTime<Utc>,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            wall_base: Utc::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Total time advanced since creation.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }

    fn wall(&self) -> DateTime<Utc> {
        let offset = *self.offset.lock();
        self.wall_base
            + chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero())
    }
}
