//! Tick counter abstractions shared by every periodic component.
//!
//! The scheduler exposes a free-running millisecond counter that rolls over
//! after `u32::MAX`. Every relative-time comparison in the core goes through
//! [`Tick::wrapping_since`] so the rollover never produces a bogus age.

use core::time::Duration;

use portable_atomic::{AtomicU32, Ordering};

/// Millisecond timestamp sampled from the wrapping scheduler counter.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Tick(u32);

impl Tick {
    /// Timestamp value used by blocks that were never written.
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn from_millis(millis: u32) -> Self {
        Self(millis)
    }

    #[must_use]
    pub const fn as_millis(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Milliseconds elapsed from `earlier` to `self`, modulo 2^32.
    #[must_use]
    pub const fn wrapping_since(self, earlier: Tick) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// Advances the timestamp, wrapping past `u32::MAX`.
    #[must_use]
    pub const fn wrapping_add_millis(self, millis: u32) -> Self {
        Self(self.0.wrapping_add(millis))
    }
}

/// Converts a [`Duration`] to whole milliseconds, saturating at `u32::MAX`.
#[must_use]
pub fn duration_to_millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

/// Returns `true` when `timestamp` is at most `interval` old at `now`.
///
/// The comparison is inclusive: an age of exactly `interval` is still fresh.
#[must_use]
pub fn is_within(now: Tick, timestamp: Tick, interval: Duration) -> bool {
    now.wrapping_since(timestamp) <= duration_to_millis(interval)
}

/// Source of the scheduler tick counter.
pub trait TickSource {
    /// Returns the current value of the wrapping millisecond counter.
    fn now(&self) -> Tick;
}

impl<T> TickSource for &T
where
    T: TickSource + ?Sized,
{
    fn now(&self) -> Tick {
        (**self).now()
    }
}

/// Tick source advanced explicitly by its owner (host tests, simulator).
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU32,
}

impl ManualClock {
    #[must_use]
    pub const fn new(start: u32) -> Self {
        Self {
            millis: AtomicU32::new(start),
        }
    }

    /// Jumps the counter to an absolute value.
    pub fn set(&self, millis: u32) {
        self.millis.store(millis, Ordering::Relaxed);
    }

    /// Moves the counter forward, wrapping past `u32::MAX`.
    pub fn advance(&self, millis: u32) {
        // fetch_add wraps on overflow
        self.millis.fetch_add(millis, Ordering::Relaxed);
    }
}

impl TickSource for ManualClock {
    fn now(&self) -> Tick {
        Tick(self.millis.load(Ordering::Relaxed))
    }
}

/// Measures a bounded wait against the tick counter.
///
/// The stopwatch starts on the first poll after a reset so a wait budget is
/// independent of how often the owning task runs.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Stopwatch {
    started_at: Option<Tick>,
}

impl Stopwatch {
    #[must_use]
    pub const fn new() -> Self {
        Self { started_at: None }
    }

    /// Clears the start mark so the next poll starts a fresh wait.
    pub fn reset(&mut self) {
        self.started_at = None;
    }

    /// Returns the tick the current wait started at, if one is running.
    #[must_use]
    pub const fn started_at(&self) -> Option<Tick> {
        self.started_at
    }

    /// Polls the wait, returning `true` once more than `budget` has elapsed.
    pub fn exceeded(&mut self, now: Tick, budget: Duration) -> bool {
        let started = *self.started_at.get_or_insert(now);
        !is_within(now, started, budget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_since_handles_rollover() {
        let before = Tick::from_millis(u32::MAX - 9);
        let after = before.wrapping_add_millis(20);

        assert_eq!(after.as_millis(), 10);
        assert_eq!(after.wrapping_since(before), 20);
    }

    #[test]
    fn is_within_is_inclusive() {
        let stamp = Tick::from_millis(50);
        let interval = Duration::from_millis(100);

        assert!(is_within(Tick::from_millis(150), stamp, interval));
        assert!(!is_within(Tick::from_millis(151), stamp, interval));
    }

    #[test]
    fn stopwatch_starts_on_first_poll() {
        let mut watch = Stopwatch::new();
        let budget = Duration::from_millis(30);

        assert!(!watch.exceeded(Tick::from_millis(1_000), budget));
        assert_eq!(watch.started_at(), Some(Tick::from_millis(1_000)));
        assert!(!watch.exceeded(Tick::from_millis(1_030), budget));
        assert!(watch.exceeded(Tick::from_millis(1_031), budget));

        watch.reset();
        assert!(!watch.exceeded(Tick::from_millis(2_000), budget));
    }

    #[test]
    fn stopwatch_survives_counter_rollover() {
        let mut watch = Stopwatch::new();
        let budget = Duration::from_millis(10);

        assert!(!watch.exceeded(Tick::from_millis(u32::MAX - 4), budget));
        assert!(!watch.exceeded(Tick::from_millis(5), budget));
        assert!(watch.exceeded(Tick::from_millis(6), budget));
    }

    #[test]
    fn manual_clock_wraps() {
        let clock = ManualClock::new(u32::MAX);
        clock.advance(2);
        assert_eq!(clock.now(), Tick::from_millis(1));
    }
}
