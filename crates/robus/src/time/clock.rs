// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Clock handles for the two time domains.
//!
//! Clocks are explicit `Arc`-shared objects handed to whatever needs them
//! (timer managers, rate helpers, subscriptions); there is no process-global
//! clock. Sleeping on a clock is preemptible: [`Clock::shutdown`] releases
//! all current and future sleepers immediately, and [`Clock::wake`] forces
//! sleepers to re-check the clock (used when simulated time is stepped).

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use super::{Duration, Time, TimePoint, TimeSpan, WallDuration, WallTime};

/// Upper bound on one blind wait while simulated time stands still, and on
/// the scheduler's quit-check latency.
const MAX_BLIND_WAIT: std::time::Duration = std::time::Duration::from_millis(100);

/// All clock handles in a process measure from the same anchor, so two
/// independently created handles of the same domain agree.
fn process_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

fn wall_now() -> WallTime {
    WallTime::ZERO + WallDuration::from_std(process_epoch().elapsed())
}

/// A source of time in one clock domain.
///
/// Implemented by [`WallClock`] (monotonic) and [`SimClock`] (simulation
/// capable). Generic consumers ([`crate::timer::TimerManager`],
/// [`crate::time::rate::Rate`]) work against this trait.
pub trait Clock: Send + Sync + 'static {
    /// Instant type of this domain.
    type Stamp: TimePoint<Span = Self::Span>;
    /// Span type of this domain.
    type Span: TimeSpan;

    /// Current time on this clock.
    fn now(&self) -> Self::Stamp;

    /// Sleep until `deadline`.
    ///
    /// Returns `true` when the deadline was reached, `false` when the clock
    /// was shut down first.
    fn sleep_until(&self, deadline: Self::Stamp) -> bool;

    /// Wait toward `deadline` for at most `max_wait` of wall time.
    ///
    /// Returns `true` iff the deadline has been reached. Schedulers use this
    /// to interleave their own quit checks with clock waits.
    fn sleep_slice(&self, deadline: Self::Stamp, max_wait: std::time::Duration) -> bool;

    /// Force all sleepers to re-check the clock.
    fn wake(&self);

    /// Release all sleepers permanently; subsequent sleeps return
    /// immediately.
    fn shutdown(&self);

    /// Whether [`Clock::shutdown`] has been called.
    fn is_shutdown(&self) -> bool;
}

// ============================================================================
// WallClock
// ============================================================================

/// Monotonic wall clock.
///
/// `now()` never goes backwards and is unaffected by host clock steps.
pub struct WallClock {
    sleepers: Mutex<()>,
    cond: Condvar,
    stopped: AtomicBool,
}

impl WallClock {
    /// Create a new wall clock handle.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sleepers: Mutex::new(()),
            cond: Condvar::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Create a shared handle wrapped in `Arc`.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Current monotonic wall time.
    #[must_use]
    pub fn now(&self) -> WallTime {
        wall_now()
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for WallClock {
    type Stamp = WallTime;
    type Span = WallDuration;

    fn now(&self) -> WallTime {
        WallClock::now(self)
    }

    fn sleep_until(&self, deadline: WallTime) -> bool {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return false;
            }
            let now = wall_now();
            if now >= deadline {
                return true;
            }
            let remaining = (deadline - now).to_std().unwrap_or_default();
            let mut guard = self.sleepers.lock();
            // Re-check under the lock so a shutdown between the flag load
            // and the wait cannot be missed.
            if self.stopped.load(Ordering::Acquire) {
                return false;
            }
            let _ = self.cond.wait_for(&mut guard, remaining);
        }
    }

    fn sleep_slice(&self, deadline: WallTime, max_wait: std::time::Duration) -> bool {
        let now = wall_now();
        if now >= deadline || self.stopped.load(Ordering::Acquire) {
            return now >= deadline;
        }
        let wait = (deadline - now).to_std().unwrap_or_default().min(max_wait);
        let mut guard = self.sleepers.lock();
        if !self.stopped.load(Ordering::Acquire) {
            let _ = self.cond.wait_for(&mut guard, wait);
        }
        wall_now() >= deadline
    }

    fn wake(&self) {
        let _guard = self.sleepers.lock();
        self.cond.notify_all();
    }

    fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wake();
    }

    fn is_shutdown(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

// ============================================================================
// SimClock
// ============================================================================

enum SimMode {
    /// No simulation source yet: reads follow the wall clock.
    Passthrough,
    /// Time is driven exclusively by `set_time`/`advance`.
    Manual(Time),
}

impl SimMode {
    fn current(&self) -> Time {
        match self {
            SimMode::Passthrough => Time::ZERO + Duration::from_std(process_epoch().elapsed()),
            SimMode::Manual(t) => *t,
        }
    }
}

/// Node-time clock, switchable to a simulation source.
///
/// Starts in passthrough mode (reads follow the wall clock, the behavior of
/// a node before any simulation source appears). The first
/// [`SimClock::set_time`] or [`SimClock::advance`] switches it permanently
/// to manual mode, where time only moves when stepped; both wake sleepers so
/// deadlines are re-evaluated against the new time.
pub struct SimClock {
    mode: Mutex<SimMode>,
    cond: Condvar,
    stopped: AtomicBool,
}

impl SimClock {
    /// Create a clock in passthrough mode.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: Mutex::new(SimMode::Passthrough),
            cond: Condvar::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Create a clock already in manual mode at `start`.
    #[must_use]
    pub fn manual(start: Time) -> Self {
        Self {
            mode: Mutex::new(SimMode::Manual(start)),
            cond: Condvar::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Create a shared passthrough handle wrapped in `Arc`.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Current node time.
    #[must_use]
    pub fn now(&self) -> Time {
        self.mode.lock().current()
    }

    /// Whether a simulation source has taken over.
    #[must_use]
    pub fn is_simulated(&self) -> bool {
        matches!(*self.mode.lock(), SimMode::Manual(_))
    }

    /// Set the current time (simulation step; may jump backwards).
    pub fn set_time(&self, t: Time) {
        let mut mode = self.mode.lock();
        *mode = SimMode::Manual(t);
        self.cond.notify_all();
    }

    /// Advance the current time by `d` (switches to manual mode).
    pub fn advance(&self, d: Duration) {
        let mut mode = self.mode.lock();
        let next = mode.current() + d;
        *mode = SimMode::Manual(next);
        self.cond.notify_all();
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SimClock {
    type Stamp = Time;
    type Span = Duration;

    fn now(&self) -> Time {
        SimClock::now(self)
    }

    fn sleep_until(&self, deadline: Time) -> bool {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return false;
            }
            let mut mode = self.mode.lock();
            let now = mode.current();
            if now >= deadline {
                return true;
            }
            // In manual mode the estimate below is meaningless (time only
            // moves on notify), so the wait is bounded and re-checked.
            let wait = (deadline - now)
                .to_std()
                .unwrap_or_default()
                .min(MAX_BLIND_WAIT);
            let _ = self.cond.wait_for(&mut mode, wait);
        }
    }

    fn sleep_slice(&self, deadline: Time, max_wait: std::time::Duration) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return self.now() >= deadline;
        }
        let mut mode = self.mode.lock();
        let now = mode.current();
        if now >= deadline {
            return true;
        }
        let wait = (deadline - now)
            .to_std()
            .unwrap_or_default()
            .min(max_wait);
        let _ = self.cond.wait_for(&mut mode, wait);
        mode.current() >= deadline
    }

    fn wake(&self) {
        let _guard = self.mode.lock();
        self.cond.notify_all();
    }

    fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wake();
    }

    fn is_shutdown(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}
