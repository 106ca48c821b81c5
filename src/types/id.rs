//! Identifier and timestamp types.
//!
//! Loop handles and facade timers are stored in generation-checked arenas;
//! the identifiers here wrap those arena indices with type safety so a stale
//! id can never address a recycled slot.

use crate::util::ArenaIndex;
use core::fmt;
use std::ops::Add;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

static SCHEDULER_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Identifies one primitive (timer, check marker, idle marker) owned by an
/// event loop.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(pub(crate) ArenaIndex);

impl HandleId {
    #[must_use]
    pub(crate) const fn from_arena(index: ArenaIndex) -> Self {
        Self(index)
    }

    #[must_use]
    pub(crate) const fn arena_index(self) -> ArenaIndex {
        self.0
    }
}

impl fmt::Debug for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleId({}:{})", self.0.index(), self.0.generation())
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "H{}", self.0.index())
    }
}

/// Identifies a timeout, interval or immediate registered with
/// [`Timers`](crate::timers::Timers).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub(crate) ArenaIndex);

impl TimerId {
    #[must_use]
    pub(crate) const fn from_arena(index: ArenaIndex) -> Self {
        Self(index)
    }

    #[must_use]
    pub(crate) const fn arena_index(self) -> ArenaIndex {
        self.0
    }
}

impl fmt::Debug for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimerId({}:{})", self.0.index(), self.0.generation())
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0.index())
    }
}

/// Process-unique label for a scheduler instance, used in log output.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchedulerId(u32);

impl SchedulerId {
    /// Allocates the next scheduler label.
    #[must_use]
    pub fn next() -> Self {
        Self(SCHEDULER_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw label value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for SchedulerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SchedulerId({})", self.0)
    }
}

impl fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// A monotonic loop timestamp.
///
/// With a wall clock this is time since the clock was created; in the lab
/// loop it is virtual time that only moves when the loop blocks.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(u64);

impl Time {
    /// The zero instant (epoch).
    pub const ZERO: Self = Self(0);

    /// The maximum representable instant.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a new time from nanoseconds since epoch.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Creates a new time from milliseconds since epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Creates a new time from seconds since epoch.
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000_000_000))
    }

    /// Returns the time as nanoseconds since epoch.
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Returns the time as milliseconds since epoch (truncated).
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Adds a delay in milliseconds, saturating on overflow.
    #[must_use]
    pub const fn saturating_add_millis(self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis.saturating_mul(1_000_000)))
    }

    /// Adds a duration in nanoseconds, saturating on overflow.
    #[must_use]
    pub const fn saturating_add_nanos(self, nanos: u64) -> Self {
        Self(self.0.saturating_add(nanos))
    }

    /// Returns the nanoseconds between two times, 0 if `self` is earlier.
    #[must_use]
    pub const fn duration_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Returns whole milliseconds until `later`, rounded up, 0 if already
    /// reached.
    ///
    /// Rounding up keeps a re-arm from firing a fraction of a millisecond
    /// before the deadline it was computed from.
    #[must_use]
    pub const fn millis_until(self, later: Self) -> u64 {
        let nanos = later.0.saturating_sub(self.0);
        nanos.div_ceil(1_000_000)
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        self.saturating_add_nanos(u64::try_from(rhs.as_nanos()).unwrap_or(u64::MAX))
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Time({}ns)", self.0)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000_000_000 {
            write!(
                f,
                "{}.{:03}s",
                self.0 / 1_000_000_000,
                (self.0 / 1_000_000) % 1000
            )
        } else if self.0 >= 1_000_000 {
            write!(f, "{}ms", self.0 / 1_000_000)
        } else if self.0 >= 1_000 {
            write!(f, "{}us", self.0 / 1_000)
        } else {
            write!(f, "{}ns", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_conversions() {
        assert_eq!(Time::from_secs(1).as_nanos(), 1_000_000_000);
        assert_eq!(Time::from_millis(1).as_nanos(), 1_000_000);
        assert_eq!(Time::from_nanos(1_500_000_000).as_millis(), 1500);
    }

    #[test]
    fn millis_until_rounds_up() {
        let now = Time::from_millis(10);
        assert_eq!(now.millis_until(Time::from_millis(15)), 5);
        assert_eq!(now.millis_until(now.saturating_add_nanos(1)), 1);
        assert_eq!(now.millis_until(Time::from_millis(3)), 0);
    }

    #[test]
    fn add_millis_saturates() {
        assert_eq!(Time::MAX.saturating_add_millis(1), Time::MAX);
        assert_eq!(
            Time::from_millis(5).saturating_add_millis(10),
            Time::from_millis(15)
        );
    }

    #[test]
    fn adding_a_huge_duration_saturates() {
        assert_eq!(Time::from_millis(5) + Duration::MAX, Time::MAX);
        assert_eq!(Time::ZERO + Duration::from_secs(u64::MAX / 2), Time::MAX);
        assert_eq!(
            Time::from_millis(5) + Duration::from_millis(10),
            Time::from_millis(15)
        );
    }

    #[test]
    fn display_picks_unit() {
        assert_eq!(Time::from_millis(1500).to_string(), "1.500s");
        assert_eq!(Time::from_millis(20).to_string(), "20ms");
        assert_eq!(Time::from_nanos(2_500).to_string(), "2us");
        assert_eq!(Time::from_nanos(7).to_string(), "7ns");
    }

    #[test]
    fn scheduler_ids_are_unique() {
        let a = SchedulerId::next();
        let b = SchedulerId::next();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), format!("S{}", a.as_u32()));
    }
}
