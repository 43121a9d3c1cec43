//! Time source abstraction.
//!
//! The engine reads "now" through a [`Clock`] so that scheduled times,
//! retry delays, and retention can be driven deterministically in tests.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// Upper bound on how far ahead [`deadline_after`] places a deadline.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.write() {
            *now = add_saturating(*now, by);
        }
    }

    /// Jump to a specific instant.
    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.write() {
            *now = to;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.read().map(|now| *now).unwrap_or_else(|e| *e.into_inner())
    }
}

/// Convert a std duration, saturating at chrono's range.
pub fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::MAX)
}

/// `at + d`, clamped to the latest representable time.
pub fn add_saturating(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_add_signed(to_chrono(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `start + limit` as a monotonic deadline, capped at a far-future instant.
pub fn deadline_after(start: Instant, limit: Duration) -> Instant {
    start + limit.min(FAR_FUTURE)
}

/// `at - d`, clamped to the earliest representable time.
pub fn sub_saturating(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(to_chrono(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
