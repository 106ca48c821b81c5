//! Time sources for the event loop.
//!
//! The loop caches one timestamp per iteration and every countdown primitive
//! computes its deadline from that cached value. Where the timestamp comes
//! from is pluggable: [`WallClock`] for production, [`VirtualClock`] for the
//! lab loop, where time moves only when the loop would otherwise block.

use crate::types::Time;
use std::sync::atomic::{AtomicU64, Ordering};

/// Time source abstraction for getting the current time.
pub trait TimeSource: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// Monotonic wall clock; the epoch is the moment the clock was created.
#[derive(Debug)]
pub struct WallClock {
    epoch: std::time::Instant,
}

impl WallClock {
    /// Creates a new wall clock time source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for WallClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now(&self) -> Time {
        Time::from_nanos(self.epoch.elapsed().as_nanos() as u64)
    }
}

/// Virtual time source for the lab loop.
///
/// # Example
///
/// ```
/// use tickslot::event_loop::{TimeSource, VirtualClock};
/// use tickslot::types::Time;
///
/// let clock = VirtualClock::new();
/// assert_eq!(clock.now(), Time::ZERO);
///
/// clock.advance(250_000_000);
/// assert_eq!(clock.now(), Time::from_millis(250));
/// ```
#[derive(Debug, Default)]
pub struct VirtualClock {
    now: AtomicU64,
}

impl VirtualClock {
    /// Creates a new virtual clock starting at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
        }
    }

    /// Creates a virtual clock starting at the given time.
    #[must_use]
    pub fn starting_at(time: Time) -> Self {
        Self {
            now: AtomicU64::new(time.as_nanos()),
        }
    }

    /// Advances time by the given number of nanoseconds.
    pub fn advance(&self, nanos: u64) {
        self.now.fetch_add(nanos, Ordering::Release);
    }

    /// Advances time to the given absolute time.
    ///
    /// Moving backwards is a no-op; virtual time stays monotonic.
    pub fn advance_to(&self, time: Time) {
        self.now.fetch_max(time.as_nanos(), Ordering::AcqRel);
    }
}

impl TimeSource for VirtualClock {
    fn now(&self) -> Time {
        Time::from_nanos(self.now.load(Ordering::Acquire))
    }
}
