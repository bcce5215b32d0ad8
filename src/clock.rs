//! Boot-relative time and cadence helpers.
//!
//! Everything in the node is scheduled in whole seconds since boot,
//! the resolution the original timers provide. `Clock` wraps a
//! monotonic [`Instant`] and adds a skew that simulations and tests
//! use to drive hours of schedule through in microseconds.
//!
//! The cadence helpers follow one convention: a `last` timestamp of 0
//! means "never armed", and the first check fires immediately. A
//! `last` stamped in the future (used to stagger the first oneshot)
//! simply delays the first firing.

use std::time::Instant;

/// Monotonic seconds-since-boot source.
pub struct Clock {
    boot: Instant,
    skew_secs: u64,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            boot: Instant::now(),
            skew_secs: 0,
        }
    }

    /// Whole seconds since boot.
    pub fn now(&self) -> u32 {
        let real = self.boot.elapsed().as_secs() + self.skew_secs;
        real.min(u32::MAX as u64) as u32
    }

    /// Milliseconds since boot, for the fine-grained poll timers.
    pub fn now_ms(&self) -> u64 {
        self.boot.elapsed().as_millis() as u64 + self.skew_secs * 1000
    }

    /// Advance simulated time. Used by tests and the host simulator.
    pub fn advance(&mut self, secs: u32) {
        self.skew_secs += secs as u64;
    }

    /// Advance simulated time by milliseconds, rounded down to whole
    /// seconds for the second-resolution callers.
    pub fn advance_ms(&mut self, ms: u64) {
        self.skew_secs += ms / 1000;
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// True when `interval_secs` have elapsed since `last`, without
/// stamping. `last == 0` fires immediately; a future `last` waits.
pub fn would_fire(clock: &Clock, last: u32, interval_secs: u32) -> bool {
    if last == 0 {
        return true;
    }
    let now = clock.now();
    now >= last && now - last >= interval_secs
}

/// [`would_fire`], stamping `last = now` when it fires.
pub fn fire(clock: &Clock, last: &mut u32, interval_secs: u32) -> bool {
    if !would_fire(clock, *last, interval_secs) {
        return false;
    }
    *last = clock.now();
    true
}

/// [`would_fire`], advancing `last` by whole multiples of the interval
/// so the cadence stays anchored instead of drifting with poll jitter.
pub fn fire_aligned(clock: &Clock, last: &mut u32, interval_secs: u32) -> bool {
    if !would_fire(clock, *last, interval_secs) {
        return false;
    }
    let now = clock.now();
    if *last == 0 || interval_secs == 0 {
        *last = now;
    } else {
        *last += ((now - *last) / interval_secs) * interval_secs;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unarmed_timer_fires_immediately() {
        let clock = Clock::new();
        let mut last = 0;
        assert!(fire(&clock, &mut last, 60));
        assert_ne!(last, 0);
    }

    #[test]
    fn test_fire_respects_interval() {
        let mut clock = Clock::new();
        clock.advance(100);
        let mut last = 0;
        assert!(fire(&clock, &mut last, 60));
        assert!(!fire(&clock, &mut last, 60));
        clock.advance(59);
        assert!(!fire(&clock, &mut last, 60));
        clock.advance(1);
        assert!(fire(&clock, &mut last, 60));
    }

    #[test]
    fn test_future_last_delays_first_fire() {
        let mut clock = Clock::new();
        clock.advance(100);
        // Stagger: armed 40s into the future with a 60s interval.
        let mut last = clock.now() + 40;
        assert!(!fire(&clock, &mut last, 60));
        clock.advance(40);
        assert!(!fire(&clock, &mut last, 60));
        clock.advance(60);
        assert!(fire(&clock, &mut last, 60));
    }

    #[test]
    fn test_aligned_fire_does_not_drift() {
        let mut clock = Clock::new();
        clock.advance(10);
        let mut last = 0;
        assert!(fire_aligned(&clock, &mut last, 60));
        let anchor = last;
        // Poll arrives 75s later; the stamp advances by one whole interval.
        clock.advance(75);
        assert!(fire_aligned(&clock, &mut last, 60));
        assert_eq!(last, anchor + 60);
    }

    #[test]
    fn test_advance_ms_accumulates() {
        let mut clock = Clock::new();
        let t0 = clock.now_ms();
        clock.advance_ms(2500);
        assert!(clock.now_ms() >= t0 + 2000);
    }
}
