//! Clock adapters.
//!
//! - [`SystemClock`] reads the host wall clock (Unix seconds) and keeps a
//!   monotonic start instant for uptime.
//! - [`ManualClock`] is a settable clock for simulation and tests; the
//!   scheduler and policies see whatever time it is told.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::app::ports::ClockPort;

/// Host wall clock.
pub struct SystemClock {
    start: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Seconds since this clock was created (monotonic).
    pub fn uptime_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl ClockPort for SystemClock {
    fn now(&self) -> f64 {
        // A wall clock before 1970 reads as the epoch.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Settable clock.  Stores the `f64` bit pattern atomically so it can be
/// shared with the scheduler and worker threads.
#[derive(Debug)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            bits: AtomicU64::new(start.to_bits()),
        }
    }

    pub fn set(&self, now: f64) {
        self.bits.store(now.to_bits(), Ordering::Release);
    }

    pub fn advance(&self, secs: f64) {
        // Single writer in practice; a CAS loop keeps concurrent advances exact.
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            let next = (f64::from_bits(current) + secs).to_bits();
            match self
                .bits
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

impl ClockPort for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}
