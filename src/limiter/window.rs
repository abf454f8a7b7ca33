//! Sliding-window counters with temporary blocking.
//!
//! A window stays open while requests keep arriving within `window` of the
//! previous one; a quiet period longer than `window` resets the count. Once
//! the count passes `max_requests` the key is blocked for `block_for`, and
//! blocked requests are not accounted at all.

use crate::clock::{saturating_add, Clock};
use crate::ModwardenError;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Idle windows are swept once every this many checks.
const PURGE_EVERY: u64 = 1024;

/// Threshold settings for one limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RatePolicy {
    /// Requests allowed per window before blocking.
    pub max_requests: u32,

    /// Quiet period that closes a window.
    #[serde(with = "crate::config::duration_secs")]
    pub window: Duration,

    /// How long a key stays blocked once over the threshold.
    #[serde(with = "crate::config::duration_secs")]
    pub block_for: Duration,
}

impl RatePolicy {
    pub(crate) fn validate(&self, name: &str) -> Result<(), ModwardenError> {
        if self.max_requests == 0 {
            return Err(ModwardenError::ConfigError(format!(
                "{}.max_requests must be at least 1",
                name
            )));
        }
        if self.window.is_zero() || self.block_for.is_zero() {
            return Err(ModwardenError::ConfigError(format!(
                "{}.window and {}.block_for must be non-zero",
                name, name
            )));
        }
        Ok(())
    }
}

/// Outcome of accounting one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Request admitted; `count` is its position in the current window.
    Allowed {
        /// Requests seen in the current window, including this one.
        count: u32,
    },
    /// Request denied until `until`.
    Blocked {
        /// When the block lifts.
        until: DateTime<Utc>,
        /// `true` if this request is the one that tripped the block.
        newly_blocked: bool,
    },
}

impl Admission {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }

    /// Whole seconds until the block lifts, rounded up; zero when allowed.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        match self {
            Admission::Allowed { .. } => 0,
            Admission::Blocked { until, .. } => {
                let millis = (*until - now).num_milliseconds().max(0) as u64;
                millis.div_ceil(1000)
            }
        }
    }
}

/// Accounting state for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateWindow {
    /// Requests in the current window.
    pub count: u32,

    /// When the current window opened.
    pub window_start: DateTime<Utc>,

    /// Last accounted request.
    pub last_request: DateTime<Utc>,

    /// Set while the key is blocked.
    pub blocked_until: Option<DateTime<Utc>>,
}

impl RateWindow {
    /// Open a window with one request at `now`.
    pub fn start(now: DateTime<Utc>) -> Self {
        Self {
            count: 1,
            window_start: now,
            last_request: now,
            blocked_until: None,
        }
    }

    /// Account one request, handling block expiry and window rollover.
    pub fn record(&mut self, policy: &RatePolicy, now: DateTime<Utc>) -> Admission {
        if let Some(until) = self.blocked_until {
            if until > now {
                return Admission::Blocked {
                    until,
                    newly_blocked: false,
                };
            }
            *self = Self::start(now);
            return Admission::Allowed { count: 1 };
        }

        if elapsed(self.last_request, now) <= policy.window {
            self.count = self.count.saturating_add(1);
            self.last_request = now;

            if self.count > policy.max_requests {
                let until = saturating_add(now, policy.block_for);
                self.blocked_until = Some(until);
                return Admission::Blocked {
                    until,
                    newly_blocked: true,
                };
            }
        } else {
            *self = Self::start(now);
        }

        Admission::Allowed { count: self.count }
    }

    /// Unblocked and quiet for longer than `ttl`.
    pub fn is_idle(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let unblocked = self.blocked_until.map_or(true, |until| until <= now);
        unblocked && elapsed(self.last_request, now) > ttl
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// Concurrency-safe map of rate windows.
///
/// Each check runs its read-modify-write under the map's per-shard entry
/// lock, so two concurrent requests for one key can never both take the
/// last slot.
pub struct RateCounter {
    policy: RatePolicy,
    ttl: Duration,
    windows: DashMap<String, RateWindow>,
    checks: AtomicU64,
}

impl RateCounter {
    /// Create a counter; idle windows older than `ttl` are forgotten.
    pub fn new(policy: RatePolicy, ttl: Duration) -> Self {
        Self {
            policy,
            ttl,
            windows: DashMap::new(),
            checks: AtomicU64::new(0),
        }
    }

    /// Account one request for `key`.
    pub fn check(&self, key: &str, clock: &dyn Clock) -> Admission {
        let now = clock.now_utc();

        let admission = match self.windows.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let window = entry.get_mut();
                if window.is_idle(self.ttl, now) {
                    *window = RateWindow::start(now);
                    Admission::Allowed { count: 1 }
                } else {
                    window.record(&self.policy, now)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(RateWindow::start(now));
                Admission::Allowed { count: 1 }
            }
        };

        if self.checks.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            self.purge_idle(clock);
        }

        admission
    }

    /// Snapshot of the window for `key`, if tracked.
    pub fn window(&self, key: &str) -> Option<RateWindow> {
        self.windows.get(key).map(|w| w.value().clone())
    }

    /// Drop windows idle for longer than the TTL. Returns how many were removed.
    pub fn purge_idle(&self, clock: &dyn Clock) -> usize {
        let now = clock.now_utc();
        let before = self.windows.len();
        self.windows.retain(|_, w| !w.is_idle(self.ttl, now));
        before.saturating_sub(self.windows.len())
    }

    /// Number of tracked keys.
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}
