// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Deferred callbacks and the user-drained queues that run them.
//!
//! The subscription and timer cores never run user code on their own
//! threads when a callback queue is configured; they enqueue an opaque
//! [`QueuedCallback`] object and a user-owned thread drains the queue. That
//! handoff is what decouples network and scheduler threads from user code.
//!
//! # Example
//!
//! ```
//! use robus::callback_queue::{CallbackQueue, CallbackQueueInterface, CallResult, QueuedCallback};
//!
//! struct Hello;
//! impl QueuedCallback for Hello {
//!     fn call(&self) -> CallResult {
//!         println!("hello");
//!         CallResult::Success
//!     }
//! }
//!
//! let queue = CallbackQueue::shared();
//! queue.add_callback(Box::new(Hello));
//! queue.call_available(std::time::Duration::from_millis(0));
//! ```

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

/// Outcome of one [`QueuedCallback::call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallResult {
    /// The callback ran; discard the entry.
    Success,
    /// The callback is not ready; re-queue the entry at the tail.
    TryAgain,
    /// The callback's owner is gone or was removed; discard the entry.
    Invalid,
}

/// A deferred callback object.
///
/// Created by the cores (a pending message dispatch, a timer tick) and
/// consumed by whichever thread drains the queue it was added to.
pub trait QueuedCallback: Send {
    /// Run the callback.
    fn call(&self) -> CallResult;
}

/// The queue seam the cores depend on.
///
/// Only insertion lives here; draining is owned by the user. Anything that
/// accepts callback objects (the bundled [`CallbackQueue`], an executor
/// adapter, a test collector) implements this.
pub trait CallbackQueueInterface: Send + Sync {
    /// Enqueue a callback for later invocation.
    fn add_callback(&self, callback: Box<dyn QueuedCallback>);
}

/// Result of one drain call on [`CallbackQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainResult {
    /// At least one callback was invoked.
    Called,
    /// Nothing arrived within the timeout.
    Empty,
    /// The queue is disabled.
    Disabled,
}

struct QueueState {
    entries: VecDeque<Box<dyn QueuedCallback>>,
    enabled: bool,
    /// Callbacks that panicked while being drained.
    panics: u64,
}

/// FIFO callback queue drained by user threads.
///
/// `TryAgain` results re-queue at the tail, `Invalid` results are dropped.
/// A panicking callback is caught, counted, and does not poison the other
/// entries in the same drain.
pub struct CallbackQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl CallbackQueue {
    /// Create an enabled, empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                enabled: true,
                panics: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Create a shared queue wrapped in `Arc`.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the queue is currently empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Drop all queued entries.
    ///
    /// Entries are dropped outside the queue lock; a callback object's drop
    /// handler may take locks of its own.
    pub fn clear(&self) {
        let drained: Vec<Box<dyn QueuedCallback>> =
            self.state.lock().entries.drain(..).collect();
        drop(drained);
    }

    /// Stop accepting and running callbacks; wakes blocked drainers.
    pub fn disable(&self) {
        let drained: Vec<Box<dyn QueuedCallback>> = {
            let mut state = self.state.lock();
            state.enabled = false;
            self.cond.notify_all();
            state.entries.drain(..).collect()
        };
        drop(drained);
    }

    /// Whether the queue accepts callbacks.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Number of drained callbacks that panicked.
    #[must_use]
    pub fn panic_count(&self) -> u64 {
        self.state.lock().panics
    }

    /// Invoke a single callback, waiting up to `timeout` for one to arrive.
    pub fn call_one(&self, timeout: std::time::Duration) -> DrainResult {
        let entry = {
            let mut state = self.state.lock();
            if !state.enabled {
                return DrainResult::Disabled;
            }
            if state.entries.is_empty() {
                self.cond.wait_for(&mut state, timeout);
            }
            if !state.enabled {
                return DrainResult::Disabled;
            }
            match state.entries.pop_front() {
                Some(entry) => entry,
                None => return DrainResult::Empty,
            }
        };
        self.run_one(entry);
        DrainResult::Called
    }

    /// Invoke everything queued right now, waiting up to `timeout` for the
    /// first entry.
    ///
    /// Only the entries present when draining starts are run, so a callback
    /// returning `TryAgain` (re-queued at the tail) cannot spin this call
    /// forever.
    pub fn call_available(&self, timeout: std::time::Duration) -> DrainResult {
        let batch: Vec<Box<dyn QueuedCallback>> = {
            let mut state = self.state.lock();
            if !state.enabled {
                return DrainResult::Disabled;
            }
            if state.entries.is_empty() {
                self.cond.wait_for(&mut state, timeout);
            }
            if !state.enabled {
                return DrainResult::Disabled;
            }
            if state.entries.is_empty() {
                return DrainResult::Empty;
            }
            state.entries.drain(..).collect()
        };
        for entry in batch {
            self.run_one(entry);
        }
        DrainResult::Called
    }

    fn run_one(&self, entry: Box<dyn QueuedCallback>) {
        let result =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| entry.call()));
        match result {
            Ok(CallResult::Success) | Ok(CallResult::Invalid) => {}
            Ok(CallResult::TryAgain) => {
                let mut state = self.state.lock();
                if state.enabled {
                    state.entries.push_back(entry);
                    self.cond.notify_one();
                }
            }
            Err(_) => {
                log::debug!("[CallbackQueue] callback panicked during drain");
                self.state.lock().panics += 1;
            }
        }
    }
}

impl Default for CallbackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackQueueInterface for CallbackQueue {
    fn add_callback(&self, callback: Box<dyn QueuedCallback>) {
        let mut state = self.state.lock();
        if !state.enabled {
            log::debug!("[CallbackQueue] add_callback on disabled queue, dropping");
            return;
        }
        state.entries.push_back(callback);
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const NO_WAIT: std::time::Duration = std::time::Duration::from_millis(0);

    struct Counting {
        hits: Arc<AtomicU32>,
        result: CallResult,
    }

    impl QueuedCallback for Counting {
        fn call(&self) -> CallResult {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.result
        }
    }

    fn counting(hits: &Arc<AtomicU32>, result: CallResult) -> Box<dyn QueuedCallback> {
        Box::new(Counting {
            hits: Arc::clone(hits),
            result,
        })
    }

    #[test]
    fn test_call_available_drains_fifo() {
        let queue = CallbackQueue::new();
        let hits = Arc::new(AtomicU32::new(0));
        queue.add_callback(counting(&hits, CallResult::Success));
        queue.add_callback(counting(&hits, CallResult::Success));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.call_available(NO_WAIT), DrainResult::Called);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_try_again_requeues_at_tail() {
        let queue = CallbackQueue::new();
        let hits = Arc::new(AtomicU32::new(0));
        queue.add_callback(counting(&hits, CallResult::TryAgain));
        assert_eq!(queue.call_one(NO_WAIT), DrainResult::Called);
        // Invoked once and back in the queue.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_invalid_is_discarded() {
        let queue = CallbackQueue::new();
        let hits = Arc::new(AtomicU32::new(0));
        queue.add_callback(counting(&hits, CallResult::Invalid));
        assert_eq!(queue.call_one(NO_WAIT), DrainResult::Called);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_empty_after_timeout() {
        let queue = CallbackQueue::new();
        assert_eq!(
            queue.call_one(std::time::Duration::from_millis(5)),
            DrainResult::Empty
        );
    }

    #[test]
    fn test_disabled_queue_drops_new_work() {
        let queue = CallbackQueue::new();
        let hits = Arc::new(AtomicU32::new(0));
        queue.disable();
        queue.add_callback(counting(&hits, CallResult::Success));
        assert_eq!(queue.call_one(NO_WAIT), DrainResult::Disabled);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_callback_does_not_poison_batch() {
        struct Bomb;
        impl QueuedCallback for Bomb {
            fn call(&self) -> CallResult {
                panic!("user callback bug");
            }
        }

        let queue = CallbackQueue::new();
        let hits = Arc::new(AtomicU32::new(0));
        queue.add_callback(Box::new(Bomb));
        queue.add_callback(counting(&hits, CallResult::Success));
        assert_eq!(queue.call_available(NO_WAIT), DrainResult::Called);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(queue.panic_count(), 1);
    }

    #[test]
    fn test_drain_wakes_on_add() {
        let queue = CallbackQueue::shared();
        let hits = Arc::new(AtomicU32::new(0));
        let q = Arc::clone(&queue);
        let h = Arc::clone(&hits);
        let drainer = std::thread::spawn(move || {
            q.call_one(std::time::Duration::from_secs(5));
            h.load(Ordering::SeqCst)
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        queue.add_callback(counting(&hits, CallResult::Success));
        assert_eq!(drainer.join().expect("drainer thread"), 1);
    }
}
