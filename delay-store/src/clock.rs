use std::fmt::Debug;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use quanta::Instant;

/// Source of millisecond timestamps comparable with the governor's.
pub trait Clock: Debug + Send + Sync {
    /// Milliseconds since the Unix epoch, never going backwards.
    fn now_millis(&self) -> u64;
}

/// Monotonic millisecond clock anchored to the wall clock once.
///
/// The epoch offset is sampled at construction; after that the clock only
/// advances with the TSC-backed `quanta` clock, so wall-clock steps never make
/// `now_millis` jump backwards.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    clock: quanta::Clock,
    anchor: Instant,
    start_ms: u64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        let start_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self::with_clock_at(quanta::Clock::new(), start_ms)
    }

    /// Builds a clock reading `start_ms` now and advancing with `clock`.
    ///
    /// Pair with `quanta::Clock::mock()` for deterministic tests.
    pub fn with_clock_at(clock: quanta::Clock, start_ms: u64) -> Self {
        let anchor = clock.now();
        Self {
            clock,
            anchor,
            start_ms,
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now_millis(&self) -> u64 {
        let elapsed = self.clock.now().duration_since(self.anchor);
        self.start_ms + elapsed.as_millis() as u64
    }
}
