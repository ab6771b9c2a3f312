// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Priority-ordered scheduler for periodic callbacks.
//!
//! One [`TimerManager`] serves one clock domain: a sorted timer vector and
//! a single dispatcher thread that sleeps until the earliest deadline, then
//! enqueues a callback object per due tick onto each timer's callback
//! queue. User threads drain those queues; the dispatcher never runs user
//! code.
//!
//! # Catch-up
//!
//! When the dispatcher falls behind (or simulated time jumps forward), the
//! schedule advances in whole periods and one callback object is enqueued
//! per missed tick — no coalescing, the user sees every tick with its exact
//! expected stamp.
//!
//! # Removal
//!
//! [`TimerManager::remove`] is lazy: the timer leaves the schedule at once,
//! but callback objects already on user queues stay there and drain as
//! `Invalid`. The `removed` check runs in the same critical section as the
//! callback itself, so a removal observed once is observed by every later
//! dispatch. A consequence: removing a timer from inside its own callback
//! deadlocks — remove from another thread.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::callback_queue::{CallResult, CallbackQueueInterface, QueuedCallback};
use crate::lockutil::lock_recover;
use crate::time::clock::{Clock, SimClock, WallClock};
use crate::time::{TimePoint, TimeSpan, WallDuration};

/// Sleep horizon while no timers exist; also bounds shutdown latency.
const IDLE_SLEEP_SECS: f64 = 0.1;

/// Upper bound on one dispatcher wait, so quit checks stay responsive.
const DISPATCH_POLL: std::time::Duration = std::time::Duration::from_millis(100);

type TrackedRef = Weak<dyn Any + Send + Sync>;

/// Identifies one timer within its manager for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u32);

/// The record passed to a timer callback on every dispatch.
pub struct TimerEvent<C: Clock> {
    /// Expected stamp of the previous tick.
    pub last_expected: C::Stamp,
    /// Actual dispatch stamp of the previous tick (domain origin before the
    /// first dispatch).
    pub last_real: C::Stamp,
    /// Expected stamp of this tick (`start + k·period`, exact).
    pub current_expected: C::Stamp,
    /// Clock reading when this dispatch ran.
    pub current_real: C::Stamp,
    /// Wall-clock execution time of the previous callback run.
    pub last_duration: WallDuration,
}

impl<C: Clock> Clone for TimerEvent<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: Clock> Copy for TimerEvent<C> {}

impl<C: Clock> std::fmt::Debug for TimerEvent<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerEvent")
            .field("last_expected", &self.last_expected)
            .field("last_real", &self.last_real)
            .field("current_expected", &self.current_expected)
            .field("current_real", &self.current_real)
            .field("last_duration", &self.last_duration)
            .finish()
    }
}

struct TimerState<C: Clock> {
    last_expected: C::Stamp,
    next_expected: C::Stamp,
    last_real: C::Stamp,
    removed: bool,
    waiting_callbacks: u32,
    total_calls: u64,
    last_cb_duration: WallDuration,
}

struct TimerInfo<C: Clock> {
    handle: u32,
    period: C::Span,
    callback: Arc<dyn Fn(&TimerEvent<C>) + Send + Sync>,
    queue: Arc<dyn CallbackQueueInterface>,
    tracked: Option<TrackedRef>,
    /// Serializes dispatch bookkeeping with the callback run itself.
    state: Mutex<TimerState<C>>,
}

struct ManagerCore<C: Clock> {
    clock: Arc<C>,
    timers: Mutex<Vec<Arc<TimerInfo<C>>>>,
    id_counter: Mutex<u32>,
    quit: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Scheduler for periodic callbacks in one clock domain.
///
/// Explicitly constructed around a clock handle and explicitly shut down
/// (also on drop); there is no process-global instance.
pub struct TimerManager<C: Clock> {
    core: Arc<ManagerCore<C>>,
}

/// [`TimerManager`] over monotonic wall time.
pub type WallTimerManager = TimerManager<WallClock>;

/// [`TimerManager`] over node (possibly simulated) time.
pub type SimTimerManager = TimerManager<SimClock>;

impl<C: Clock> TimerManager<C> {
    /// Create an idle manager on `clock`; the dispatcher thread starts with
    /// the first timer.
    #[must_use]
    pub fn new(clock: Arc<C>) -> Self {
        Self {
            core: Arc::new(ManagerCore {
                clock,
                timers: Mutex::new(Vec::new()),
                id_counter: Mutex::new(0),
                quit: AtomicBool::new(false),
                thread: Mutex::new(None),
            }),
        }
    }

    /// The clock this manager schedules against.
    #[must_use]
    pub fn clock(&self) -> &Arc<C> {
        &self.core.clock
    }

    /// Schedule `callback` every `period`, delivering onto `queue`.
    ///
    /// The first tick is due one period from now. `tracked` ties the
    /// timer's validity to an external object: once it is dropped, pending
    /// dispatches drain as `Invalid` and nothing further fires. `period`
    /// must be positive; non-positive periods are clamped to one
    /// nanosecond.
    pub fn add<F>(
        &self,
        period: C::Span,
        callback: F,
        queue: Arc<dyn CallbackQueueInterface>,
        tracked: Option<Arc<dyn Any + Send + Sync>>,
    ) -> TimerHandle
    where
        F: Fn(&TimerEvent<C>) + Send + Sync + 'static,
    {
        let period = if period <= C::Span::zero() {
            log::warn!("[TimerManager] non-positive period, clamping to 1ns");
            C::Span::from_secs_f64(1e-9)
        } else {
            period
        };
        let handle = {
            let mut counter = lock_recover(&self.core.id_counter, "timer ids");
            let handle = *counter;
            *counter = counter.wrapping_add(1);
            handle
        };
        let now = self.core.clock.now();
        let info = Arc::new(TimerInfo {
            handle,
            period,
            callback: Arc::new(callback),
            queue,
            tracked: tracked.map(|t| Arc::downgrade(&t)),
            state: Mutex::new(TimerState {
                last_expected: now,
                next_expected: now + period,
                last_real: C::Stamp::zero(),
                removed: false,
                waiting_callbacks: 0,
                total_calls: 0,
                last_cb_duration: WallDuration::ZERO,
            }),
        });
        {
            let mut timers = lock_recover(&self.core.timers, "timers");
            timers.push(info);
            sort_by_deadline(&mut timers);
        }
        self.ensure_thread();
        // The new deadline may be earlier than whatever the dispatcher is
        // sleeping toward.
        self.core.clock.wake();
        TimerHandle(handle)
    }

    /// Take a timer out of the schedule (lazy removal; see module docs).
    /// No-op on an unknown handle.
    pub fn remove(&self, handle: TimerHandle) {
        let mut timers = lock_recover(&self.core.timers, "timers");
        if let Some(index) = timers.iter().position(|t| t.handle == handle.0) {
            {
                let mut state = lock_recover(&timers[index].state, "timer state");
                state.removed = true;
            }
            timers.remove(index);
        }
    }

    /// Whether a tick is due or a dispatch is still in flight, and the
    /// tracked object (if any) is alive. `false` for unknown handles.
    #[must_use]
    pub fn has_pending(&self, handle: TimerHandle) -> bool {
        let timers = lock_recover(&self.core.timers, "timers");
        let Some(info) = timers.iter().find(|t| t.handle == handle.0) else {
            return false;
        };
        if let Some(tracked) = &info.tracked {
            if tracked.upgrade().is_none() {
                return false;
            }
        }
        let state = lock_recover(&info.state, "timer state");
        state.next_expected <= self.core.clock.now() || state.waiting_callbacks != 0
    }

    /// Number of scheduled timers.
    #[must_use]
    pub fn timer_count(&self) -> usize {
        lock_recover(&self.core.timers, "timers").len()
    }

    /// Stop the dispatcher thread. Idempotent; also runs on drop.
    ///
    /// Already-enqueued callback objects on user queues still drain (and
    /// run, unless their timer was removed) — shutting the manager down
    /// only stops future scheduling.
    pub fn shutdown(&self) {
        self.core.quit.store(true, Ordering::Release);
        self.core.clock.wake();
        let handle = lock_recover(&self.core.thread, "timer thread").take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn ensure_thread(&self) {
        let mut slot = lock_recover(&self.core.thread, "timer thread");
        if slot.is_some() {
            return;
        }
        let core = Arc::clone(&self.core);
        let handle = thread::Builder::new()
            .name("robus-timer".to_string())
            .spawn(move || dispatch_loop(core))
            .expect("spawn timer dispatcher thread");
        *slot = Some(handle);
    }
}

impl<C: Clock> Drop for TimerManager<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sort_by_deadline<C: Clock>(timers: &mut Vec<Arc<TimerInfo<C>>>) {
    timers.sort_by_key(|t| lock_recover(&t.state, "timer state").next_expected);
}

fn dispatch_loop<C: Clock>(core: Arc<ManagerCore<C>>) {
    log::debug!("[TimerManager] dispatcher started");
    while !core.quit.load(Ordering::Acquire) {
        let sleep_end: C::Stamp = {
            let mut timers = lock_recover(&core.timers, "timers");
            let now = core.clock.now();
            if timers.is_empty() {
                now + C::Span::from_secs_f64(IDLE_SLEEP_SECS)
            } else {
                loop {
                    let front = Arc::clone(&timers[0]);
                    let mut state = lock_recover(&front.state, "timer state");
                    if state.next_expected > now {
                        break state.next_expected;
                    }
                    // One callback object per due tick, missed ticks
                    // included.
                    state.waiting_callbacks += 1;
                    let callback = TimerQueueCallback {
                        clock: Arc::clone(&core.clock),
                        info: Arc::downgrade(&front),
                        last_expected: state.last_expected,
                        last_real: state.last_real,
                        current_expected: state.next_expected,
                    };
                    state.last_expected = state.next_expected;
                    state.next_expected = state.next_expected + front.period;
                    // The state lock is released before touching the queue:
                    // draining a queue can drop callback objects, which take
                    // this lock again.
                    drop(state);
                    front.queue.add_callback(Box::new(callback));
                    sort_by_deadline(&mut timers);
                }
            }
        };
        core.clock.sleep_slice(sleep_end, DISPATCH_POLL);
    }
    log::debug!("[TimerManager] dispatcher stopped");
}

// ============================================================================
// Dispatched callback object
// ============================================================================

/// One scheduled tick, parked on a user callback queue until drained.
struct TimerQueueCallback<C: Clock> {
    clock: Arc<C>,
    info: Weak<TimerInfo<C>>,
    last_expected: C::Stamp,
    last_real: C::Stamp,
    current_expected: C::Stamp,
}

impl<C: Clock> QueuedCallback for TimerQueueCallback<C> {
    fn call(&self) -> CallResult {
        let Some(info) = self.info.upgrade() else {
            return CallResult::Invalid;
        };
        let mut state = lock_recover(&info.state, "timer state");
        state.total_calls += 1;
        if state.removed {
            return CallResult::Invalid;
        }
        let _tracked_alive = match &info.tracked {
            Some(tracked) => match tracked.upgrade() {
                Some(guard) => Some(guard),
                None => return CallResult::Invalid,
            },
            None => None,
        };
        let event = TimerEvent {
            last_expected: self.last_expected,
            last_real: self.last_real,
            current_expected: self.current_expected,
            current_real: self.clock.now(),
            last_duration: state.last_cb_duration,
        };
        let cb_start = Instant::now();
        (info.callback)(&event);
        state.last_cb_duration = WallDuration::from_std(cb_start.elapsed());
        state.last_real = event.current_real;
        CallResult::Success
    }
}

impl<C: Clock> Drop for TimerQueueCallback<C> {
    fn drop(&mut self) {
        if let Some(info) = self.info.upgrade() {
            let mut state = lock_recover(&info.state, "timer state");
            state.waiting_callbacks = state.waiting_callbacks.saturating_sub(1);
        }
    }
}
