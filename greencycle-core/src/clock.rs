//! Millisecond clock that never repeats a value.
//!
//! Record writes and published events are stamped from one shared
//! [`MonotonicClock`]. Each [`tick`](MonotonicClock::tick) returns
//! `max(wall_now, last + 1)`, so two writes landing in the same wall-clock
//! millisecond still get distinct timestamps and a strict `updated_at > T`
//! cursor neither skips nor repeats them.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start above a previously observed value (for recovery and tests).
    pub fn starting_at(last: i64) -> Self {
        Self {
            last: AtomicI64::new(last),
        }
    }

    /// Issue a fresh timestamp, strictly greater than every earlier one.
    pub fn tick(&self) -> i64 {
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let next = now_millis().max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(observed) => last = observed,
            }
        }
    }

    /// Highest timestamp issued so far (0 before the first tick).
    pub fn last(&self) -> i64 {
        self.last.load(Ordering::Acquire)
    }
}
