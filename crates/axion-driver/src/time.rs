//! Driver clock.
//!
//! Request timing is reported in nanoseconds on a monotonic clock shared by
//! the whole driver instance. Tests substitute a manual clock.

use std::sync::Arc;
use std::time::Instant;

/// Source of driver timestamps in nanoseconds.
pub trait TimeStamper: Send + Sync {
    /// Current timestamp in nanoseconds. Monotonic within one driver
    /// instance.
    fn now_ns(&self) -> i64;

    /// Current timestamp in microseconds.
    fn now_us(&self) -> i64 {
        self.now_ns() / 1000
    }
}

/// Monotonic wall-clock time stamper.
pub struct MonotonicTimeStamper {
    epoch: Instant,
}

impl MonotonicTimeStamper {
    /// Creates a stamper whose epoch is now.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            epoch: Instant::now(),
        })
    }
}

impl TimeStamper for MonotonicTimeStamper {
    fn now_ns(&self) -> i64 {
        i64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }
}
