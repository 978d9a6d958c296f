//! Time sources for the rate drivers.
//!
//! Decay events and ban entries are stamped with a measurement from a
//! [`Clock`]; the background workers compare those stamps against
//! the same clock to figure out how long they still have to sleep.
//! The fake clock allows mocking the passage of time in tests.

use parking_lot::Mutex;
use std::fmt::Debug;
use std::ops::Add;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// A measurement from a clock.
pub trait Reference: Sized + Add<Duration, Output = Self> + Ord + Copy + Send + Sync + Debug {
    /// Determines the time that separates two measurements of a
    /// clock. Returns the zero duration if `earlier` is actually
    /// later than `self`.
    fn duration_since(&self, earlier: Self) -> Duration;
}

/// A time source used by rate drivers.
pub trait Clock: Default + Clone + Send + Sync + 'static {
    /// A measurement of a monotonically increasing clock.
    type Instant: Reference + 'static;

    /// Returns a measurement of the clock.
    fn now(&self) -> Self::Instant;
}

/// The default clock that reports [`Instant`]s.
pub type DefaultClock = MonotonicClock;

impl Reference for Instant {
    fn duration_since(&self, earlier: Self) -> Duration {
        self.saturating_duration_since(earlier)
    }
}

impl Reference for SystemTime {
    /// Returns the difference in times between the two
    /// SystemTimes. Due to the fallible nature of SystemTimes,
    /// returns the zero duration if a negative duration would
    /// result (e.g. due to system clock adjustments).
    fn duration_since(&self, earlier: Self) -> Duration {
        SystemTime::duration_since(self, earlier).unwrap_or_else(|_| Duration::new(0, 0))
    }
}

/// The monotonic clock implemented by [`Instant`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    type Instant = Instant;

    fn now(&self) -> Self::Instant {
        Instant::now()
    }
}

/// The non-monotonic clock implemented by [`SystemTime`]. Stamps
/// taken from this clock are meaningful across processes, which is
/// what the shared-store driver needs.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    type Instant = SystemTime;

    fn now(&self) -> Self::Instant {
        SystemTime::now()
    }
}

/// A mock implementation of a clock tracking [`Instant`]s. All it
/// does is keep track of what "now" is by allowing the program to
/// increment the current time (taken at time of construction) by some
/// arbitrary [`Duration`].
///
/// Clones share the same notion of "now".
#[derive(Debug, Clone)]
pub struct FakeAbsoluteClock {
    now: Arc<Mutex<Instant>>,
}

impl Default for FakeAbsoluteClock {
    fn default() -> Self {
        FakeAbsoluteClock {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }
}

impl FakeAbsoluteClock {
    /// Advances the fake clock by the given amount.
    pub fn advance(&self, by: Duration) {
        *(self.now.lock()) += by
    }
}

impl Clock for FakeAbsoluteClock {
    type Instant = Instant;

    fn now(&self) -> Self::Instant {
        *self.now.lock()
    }
}

/// Returns how much of `period` is left, measured from `start`, at
/// the moment `now`. Returns `None` once the period has fully
/// elapsed.
pub fn remaining<P: Reference>(period: Duration, start: P, now: P) -> Option<Duration> {
    period
        .checked_sub(now.duration_since(start))
        .filter(|left| *left > Duration::new(0, 0))
}
