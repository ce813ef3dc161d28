//! Time sources for the event loop.
//!
//! The scheduler never reads the system clock directly. It asks a [`Clock`]
//! for the current [`Time`] and, when nothing is runnable yet, asks the same
//! clock how long it should park. A [`WallClock`] answers with real time; a
//! [`VirtualClock`] jumps straight to the deadline so tests stay deterministic.

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Absolute point in time, in nanoseconds since the clock's epoch.
///
/// The range covers a little over 584 years from the epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Time(u64);

const NANOS_PER_MILLI: u64 = 1_000_000;

impl Time {
    /// The clock's epoch.
    pub const ZERO: Time = Time(0);

    /// Saturates at the end of the clock range.
    pub const fn from_millis(ms: u64) -> Self {
        Time(ms.saturating_mul(NANOS_PER_MILLI))
    }

    pub const fn from_nanos(nanos: u64) -> Self {
        Time(nanos)
    }

    /// Whole milliseconds since the epoch, rounded down.
    pub const fn as_millis(self) -> u64 {
        self.0 / NANOS_PER_MILLI
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Adds a delay, returning `None` if the result leaves the clock range.
    pub fn checked_add(self, delay: Duration) -> Option<Time> {
        let nanos = u64::try_from(delay.as_nanos()).ok()?;
        self.0.checked_add(nanos).map(Time)
    }

    /// Time elapsed since `earlier`, or zero if `earlier` is in the future.
    pub fn saturating_duration_since(self, earlier: Time) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % NANOS_PER_MILLI == 0 {
            write!(f, "{}ms", self.as_millis())
        } else {
            write!(f, "{:?}", Duration::from_nanos(self.0))
        }
    }
}

/// A monotonic time source driving the scheduler.
pub trait Clock {
    /// Current time.
    fn now(&self) -> Time;

    /// Called when the earliest pending timer is due at `deadline` and nothing
    /// else is runnable.
    ///
    /// Returns the real-time duration the loop should block for (waking early
    /// if external work is handed in). A clock that controls time itself moves
    /// to `deadline` and returns `None`.
    fn park_for(&self, deadline: Time) -> Option<Duration>;
}

/// Real monotonic time, with its epoch at construction.
#[derive(Debug, Clone, Copy)]
pub struct WallClock {
    epoch: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for WallClock {
    fn now(&self) -> Time {
        let elapsed = self.epoch.elapsed().as_nanos();
        Time(u64::try_from(elapsed).unwrap_or(u64::MAX))
    }

    fn park_for(&self, deadline: Time) -> Option<Duration> {
        let target = self.epoch + Duration::from_nanos(deadline.as_nanos());
        Some(target.saturating_duration_since(Instant::now()))
    }
}

/// Manually driven time for deterministic runs.
///
/// Clones share the same underlying time, so a test can hand one clone to the
/// scheduler and keep another to simulate long synchronous work from inside a
/// task action.
///
/// ```
/// use std::time::Duration;
/// use tideloop::{Clock, Time, VirtualClock};
///
/// let clock = VirtualClock::new();
/// clock.advance(Duration::from_millis(250));
/// assert_eq!(clock.now(), Time::from_millis(250));
/// ```
#[derive(Debug, Clone, Default)]
pub struct VirtualClock {
    now: Rc<Cell<Time>>,
}

impl VirtualClock {
    /// A virtual clock starting at [`Time::ZERO`].
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(time: Time) -> Self {
        Self {
            now: Rc::new(Cell::new(time)),
        }
    }

    /// Moves time forward by `delta`, saturating at the end of the clock range.
    pub fn advance(&self, delta: Duration) {
        let nanos = u64::try_from(delta.as_nanos()).unwrap_or(u64::MAX);
        let now = self.now.get().as_nanos();
        self.now.set(Time(now.saturating_add(nanos)));
    }

    /// Moves time forward to `time`. Earlier targets are ignored.
    pub fn advance_to(&self, time: Time) {
        if time > self.now.get() {
            self.now.set(time);
        }
    }

    /// Sets the current time unconditionally.
    pub fn set(&self, time: Time) {
        self.now.set(time);
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Time {
        self.now.get()
    }

    fn park_for(&self, deadline: Time) -> Option<Duration> {
        self.advance_to(deadline);
        None
    }
}
