// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-frequency loop helper.
//!
//! ```no_run
//! use robus::time::clock::WallClock;
//! use robus::time::rate::WallRate;
//!
//! let clock = WallClock::shared();
//! let mut rate = WallRate::new(clock, 10.0)?;
//! for _ in 0..100 {
//!     // do periodic work
//!     if !rate.sleep() {
//!         // overran the cycle (or the clock shut down)
//!     }
//! }
//! # Ok::<(), robus::Error>(())
//! ```

use std::sync::Arc;

use super::clock::{Clock, SimClock, WallClock};
use super::TimeSpan;
use crate::error::{Error, Result};

/// Keeps a loop running at a fixed frequency on one clock domain.
///
/// `sleep()` targets `start + expected_cycle` and then advances the window
/// by exactly one cycle. When the loop body overruns its cycle, `sleep()`
/// does not try to catch up: the window still advances by one cycle and the
/// call reports the overrun by returning `false`.
pub struct Rate<C: Clock> {
    clock: Arc<C>,
    start: C::Stamp,
    expected_cycle: C::Span,
    actual_cycle: C::Span,
}

/// [`Rate`] over monotonic wall time.
pub type WallRate = Rate<WallClock>;

/// [`Rate`] over node (possibly simulated) time.
pub type SimRate = Rate<SimClock>;

impl<C: Clock> Rate<C> {
    /// Create a rate targeting `frequency` cycles per second.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFrequency`] unless `frequency > 0`.
    pub fn new(clock: Arc<C>, frequency: f64) -> Result<Self> {
        if !(frequency > 0.0) {
            return Err(Error::InvalidFrequency(frequency));
        }
        let expected_cycle = C::Span::from_secs_f64(1.0 / frequency);
        Ok(Self::with_cycle(clock, expected_cycle))
    }

    /// Create a rate from an explicit cycle length.
    #[must_use]
    pub fn with_cycle(clock: Arc<C>, expected_cycle: C::Span) -> Self {
        let start = clock.now();
        Self {
            clock,
            start,
            expected_cycle,
            actual_cycle: C::Span::zero(),
        }
    }

    /// Sleep for whatever remains of the current cycle.
    ///
    /// Returns `true` when the cycle deadline was met (the call actually
    /// slept, or the deadline arrived exactly). Returns `false` when the
    /// deadline had already passed — no sleep happens, but the cycle window
    /// still advances by one `expected_cycle` so subsequent cycles stay on
    /// the original grid — or when the clock was shut down mid-sleep.
    pub fn sleep(&mut self) -> bool {
        let mut expected_end = self.start + self.expected_cycle;
        let actual_end = self.clock.now();

        // Clock jumped backwards (simulation reset): rebase on the new time.
        if actual_end < self.start {
            expected_end = actual_end + self.expected_cycle;
        }

        self.actual_cycle = actual_end - self.start;
        self.start = expected_end;

        if actual_end > expected_end {
            return false;
        }
        self.clock.sleep_until(expected_end)
    }

    /// Measured length of the previous cycle (work plus sleep).
    #[must_use]
    pub fn cycle_time(&self) -> C::Span {
        self.actual_cycle
    }

    /// The configured cycle length.
    #[must_use]
    pub fn expected_cycle_time(&self) -> C::Span {
        self.expected_cycle
    }

    /// Rebase the cycle window on the current time.
    pub fn reset(&mut self) {
        self.start = self.clock.now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{Duration, Time};

    #[test]
    fn test_rejects_non_positive_frequency() {
        let clock = WallClock::shared();
        assert!(WallRate::new(Arc::clone(&clock), 0.0).is_err());
        assert!(WallRate::new(clock, -5.0).is_err());
    }

    #[test]
    fn test_expected_cycle() {
        let clock = WallClock::shared();
        let rate = WallRate::new(clock, 10.0).expect("valid frequency");
        assert_eq!(rate.expected_cycle_time().as_secs_f64(), 0.1);
    }

    #[test]
    fn test_overrun_advances_window_one_cycle() {
        // Manual sim time makes the overrun deterministic.
        let clock = Arc::new(SimClock::manual(Time::new(0, 0)));
        let mut rate = SimRate::new(Arc::clone(&clock), 10.0).expect("valid frequency");

        // Body overran by half a cycle: deadline 0.1 already passed.
        clock.set_time(Time::from_secs_f64(0.15));
        assert!(!rate.sleep());
        assert_eq!(rate.cycle_time(), Duration::from_secs_f64(0.15));

        // Window advanced to 0.1; next deadline is 0.2, reachable again.
        clock.set_time(Time::from_secs_f64(0.2));
        assert!(rate.sleep());
        assert_eq!(rate.cycle_time(), Duration::from_secs_f64(0.1));
    }

    #[test]
    fn test_backward_jump_rebases() {
        let clock = Arc::new(SimClock::manual(Time::new(100, 0)));
        let mut rate = SimRate::new(Arc::clone(&clock), 10.0).expect("valid frequency");

        clock.set_time(Time::new(1, 0));
        // Deadline recomputed from the new time; 1.1 is already current
        // after the step below.
        let c = Arc::clone(&clock);
        let stepper = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            c.set_time(Time::from_secs_f64(1.1));
        });
        assert!(rate.sleep());
        stepper.join().expect("stepper thread");
    }

    #[test]
    fn test_reset_rebases_start() {
        let clock = Arc::new(SimClock::manual(Time::new(0, 0)));
        let mut rate = SimRate::new(Arc::clone(&clock), 10.0).expect("valid frequency");
        clock.set_time(Time::from_secs_f64(5.0));
        rate.reset();
        clock.set_time(Time::from_secs_f64(5.1));
        assert!(rate.sleep());
    }
}
