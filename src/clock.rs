//! Clock sources
//!
//! Leases, schedules and backup tags read wall-clock time only through the
//! [`Clock`] trait so that time-dependent logic can be driven by a
//! [`ManualClock`] in tests.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// A source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// A clock source that guarantees monotonically increasing timestamps.
///
/// Lease expiry comparisons must never observe time going backward after an
/// NTP adjustment, otherwise a holder could see its own lease "un-expire".
pub struct BoundedClock {
    /// High-water mark: the largest timestamp we've ever returned (nanos)
    high_water_ns: AtomicI64,
}

impl BoundedClock {
    pub fn new() -> Self {
        Self {
            high_water_ns: AtomicI64::new(0),
        }
    }

    /// Returns a monotonically increasing nanosecond timestamp.
    ///
    /// If the wall clock has gone backward, returns the previous high-water
    /// mark + 1ns instead.
    pub fn now_nanos(&self) -> i64 {
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        loop {
            let prev = self.high_water_ns.load(Ordering::Acquire);
            let ts = wall.max(prev + 1);
            match self.high_water_ns.compare_exchange_weak(
                prev,
                ts,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ts,
                Err(_) => continue,
            }
        }
    }
}

impl Default for BoundedClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for BoundedClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.now_nanos())
    }
}

/// Manually driven clock for tests and simulations.
pub struct ManualClock {
    now_ns: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now_ns: AtomicI64::new(start.timestamp_nanos_opt().unwrap_or(0)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.now_ns
            .store(now.timestamp_nanos_opt().unwrap_or(0), Ordering::Release);
    }

    pub fn advance(&self, by: std::time::Duration) {
        self.now_ns
            .fetch_add(by.as_nanos() as i64, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.now_ns.load(Ordering::Acquire))
    }
}
