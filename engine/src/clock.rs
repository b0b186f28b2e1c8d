//! Injectable time source.
//!
//! The engine never reads the system clock. Every operation that depends on
//! time takes a [`Timestamp`] (milliseconds since the epoch) and callers get
//! those from a [`Clock`]. Tests drive a [`ManualClock`] so backoff, staleness
//! and garbage collection are fully deterministic.

use crate::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A source of wall-clock time in milliseconds.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the epoch.
    fn now(&self) -> Timestamp;
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Jump to an absolute time.
    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move the clock forward and return the new time.
    pub fn advance(&self, by: Duration) -> Timestamp {
        self.now.fetch_add(millis(by), Ordering::SeqCst) + millis(by)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Convert a duration to whole milliseconds, saturating.
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
