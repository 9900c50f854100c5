//! Sliding-window rate limiter, keyed by integration identifier.
//!
//! The upstream source does not advertise limits, so they are enforced
//! client-side. Each identifier keeps the instants of its admitted calls;
//! `allow` prunes everything older than the window before deciding, so no
//! rolling interval of `window` ever contains more than `max_requests`
//! admitted calls.

use crate::clock::{system_clock, Clock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A `(max_requests, window)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub max_requests: u32,
    #[serde(with = "duration_secs")]
    pub window: Duration,
}

impl RateLimitRule {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    /// 30 requests per minute.
    pub fn upstream_default() -> Self {
        Self::new(30, Duration::from_secs(60))
    }
}

/// Per-identifier sliding-window limiter.
#[derive(Debug)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Admit one call for `id` if fewer than `max_requests` calls were admitted
    /// within the trailing `window`.
    pub fn allow(&self, id: &str, max_requests: u32, window: Duration) -> bool {
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        let entries = windows.entry(id.to_string()).or_default();
        prune(entries, now, window);

        if entries.len() < max_requests as usize {
            entries.push_back(now);
            true
        } else {
            tracing::debug!(
                integration = id,
                max_requests,
                window_ms = window.as_millis() as u64,
                "rate limit reached"
            );
            false
        }
    }

    /// [`allow`](Self::allow) with a rule.
    pub fn allow_rule(&self, id: &str, rule: &RateLimitRule) -> bool {
        self.allow(id, rule.max_requests, rule.window)
    }

    /// Calls admitted for `id` within the trailing `window`.
    pub fn requests_in_window(&self, id: &str, window: Duration) -> usize {
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        match windows.get_mut(id) {
            Some(entries) => {
                prune(entries, now, window);
                entries.len()
            }
            None => 0,
        }
    }

    /// Time until the next call for `id` would be admitted (zero if it would be now).
    pub fn retry_after(&self, id: &str, max_requests: u32, window: Duration) -> Duration {
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        let Some(entries) = windows.get_mut(id) else {
            return Duration::ZERO;
        };
        prune(entries, now, window);
        if entries.len() < max_requests as usize {
            return Duration::ZERO;
        }
        let excess = entries.len() + 1 - max_requests as usize;
        entries
            .get(excess - 1)
            .map(|oldest| window.saturating_sub(now.saturating_duration_since(*oldest)))
            .unwrap_or(Duration::ZERO)
    }

    /// Forget all history for `id`.
    pub fn reset(&self, id: &str) {
        self.windows.lock().remove(id);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop entries that fell out of the window. An entry exactly `window` old is expired.
fn prune(entries: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = entries.front() {
        if now.saturating_duration_since(*front) >= window {
            entries.pop_front();
        } else {
            break;
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
