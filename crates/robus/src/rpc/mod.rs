// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Out-of-band RPC plumbing for connection negotiation.
//!
//! Subscribing to a topic means asking each publisher's directory endpoint
//! for transport parameters. Those calls are asynchronous: a
//! [`NegotiationClient`] fires the request, and the process-wide
//! [`RpcDispatcher`] polls every in-flight connection until its `check()`
//! reports completion.
//!
//! # Architecture
//!
//! ```text
//! Subscription ── negotiate_connection ──> PendingConnection
//!       ▲                                       │ registered with
//!       │ pending_connection_done               ▼
//!       └──────────────────────────── RpcDispatcher (poll thread)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::Result;
use crate::lockutil::lock_recover;
use crate::transport::{NegotiatedEndpoint, TransportKind};

/// Poll cadence of the dispatcher thread.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Negotiation seam
// ============================================================================

/// The request a subscriber sends to one publisher's directory endpoint.
#[derive(Debug, Clone)]
pub struct NegotiationRequest {
    /// Topic being subscribed.
    pub topic: String,
    /// Subscriber's schema fingerprint (`"*"` = wildcard).
    pub md5sum: String,
    /// Subscriber's datatype name.
    pub datatype: String,
    /// Caller id of the subscribing node.
    pub caller_id: String,
    /// Transport kinds the subscriber accepts, in preference order.
    pub preferences: Vec<TransportKind>,
    /// Pre-reserved local datagram endpoint, when datagram is offered.
    pub datagram_descriptor: Option<String>,
}

/// Terminal result of one negotiation.
#[derive(Debug, Clone)]
pub enum NegotiationOutcome {
    /// Publisher accepted; connect a channel with these parameters.
    Accepted(NegotiatedEndpoint),
    /// Publisher refused (no common transport, schema conflict, ...).
    Rejected(String),
    /// The RPC itself failed (endpoint unreachable, protocol error).
    Failed(String),
}

/// Client side of one asynchronous negotiation call.
///
/// Implemented by the directory RPC layer; the runtime only sends one
/// request per client and polls for the reply.
pub trait NegotiationClient: Send {
    /// Fire the request. Must not block on the network round-trip.
    ///
    /// # Errors
    ///
    /// [`crate::Error::NegotiationFailed`] when the request cannot even be
    /// dispatched.
    fn send_request(&mut self, request: &NegotiationRequest) -> Result<()>;

    /// Poll for the reply; `None` while still in flight.
    fn poll_reply(&mut self) -> Option<NegotiationOutcome>;
}

/// Creates a [`NegotiationClient`] per publisher URI.
pub trait NegotiationClientFactory: Send + Sync {
    /// Open a client toward the publisher's directory endpoint.
    ///
    /// # Errors
    ///
    /// [`crate::Error::NegotiationFailed`] when the URI is malformed or the
    /// client cannot be constructed.
    fn connect(&self, uri: &str) -> Result<Box<dyn NegotiationClient>>;
}

// ============================================================================
// Dispatcher
// ============================================================================

/// An in-flight asynchronous RPC registered with the dispatcher.
pub trait AsyncRpcConnection: Send + Sync {
    /// Poll the call once. Return `true` when finished so the dispatcher
    /// drops the source; delivering the result to the owner happens inside.
    fn check(&self) -> bool;
}

/// Polls registered in-flight RPC connections on a background thread.
///
/// The thread starts lazily with the first source and stops on
/// [`RpcDispatcher::shutdown`] (also run on drop). Sources whose `check()`
/// returns done are removed automatically.
pub struct RpcDispatcher {
    sources: Arc<Mutex<Vec<Arc<dyn AsyncRpcConnection>>>>,
    quit: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RpcDispatcher {
    /// Create an idle dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sources: Arc::new(Mutex::new(Vec::new())),
            quit: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    /// Create a shared dispatcher wrapped in `Arc`.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register an in-flight connection for polling.
    pub fn add_source(&self, conn: Arc<dyn AsyncRpcConnection>) {
        if self.quit.load(Ordering::Acquire) {
            log::debug!("[RpcDispatcher] add_source after shutdown, ignoring");
            return;
        }
        lock_recover(&self.sources, "rpc sources").push(conn);
        self.ensure_thread();
    }

    /// Unregister a connection (no-op when not present).
    pub fn remove_source(&self, conn: &Arc<dyn AsyncRpcConnection>) {
        lock_recover(&self.sources, "rpc sources").retain(|c| !Arc::ptr_eq(c, conn));
    }

    /// Number of registered in-flight connections.
    #[must_use]
    pub fn source_count(&self) -> usize {
        lock_recover(&self.sources, "rpc sources").len()
    }

    /// Stop the polling thread. Idempotent.
    pub fn shutdown(&self) {
        self.quit.store(true, Ordering::Release);
        let handle = lock_recover(&self.thread, "rpc thread").take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn ensure_thread(&self) {
        let mut slot = lock_recover(&self.thread, "rpc thread");
        if slot.is_some() {
            return;
        }
        let sources = Arc::clone(&self.sources);
        let quit = Arc::clone(&self.quit);
        let handle = thread::Builder::new()
            .name("robus-rpc".to_string())
            .spawn(move || {
                log::debug!("[RpcDispatcher] poll thread started");
                while !quit.load(Ordering::Acquire) {
                    let snapshot: Vec<Arc<dyn AsyncRpcConnection>> =
                        lock_recover(&sources, "rpc sources").clone();
                    let mut finished: Vec<Arc<dyn AsyncRpcConnection>> = Vec::new();
                    for conn in snapshot {
                        if conn.check() {
                            finished.push(conn);
                        }
                    }
                    if !finished.is_empty() {
                        lock_recover(&sources, "rpc sources")
                            .retain(|c| !finished.iter().any(|f| Arc::ptr_eq(c, f)));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                log::debug!("[RpcDispatcher] poll thread stopped");
            })
            .expect("spawn rpc dispatcher thread");
        *slot = Some(handle);
    }
}

impl Default for RpcDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RpcDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountedCheck {
        calls: AtomicU32,
        done_after: u32,
    }

    impl AsyncRpcConnection for CountedCheck {
        fn check(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.done_after
        }
    }

    fn wait_until(deadline: Duration, mut pred: impl FnMut() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            if pred() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        pred()
    }

    #[test]
    fn test_source_polled_until_done() {
        let dispatcher = RpcDispatcher::new();
        let conn = Arc::new(CountedCheck {
            calls: AtomicU32::new(0),
            done_after: 3,
        });
        dispatcher.add_source(conn.clone());

        assert!(wait_until(Duration::from_secs(2), || dispatcher.source_count() == 0));
        assert_eq!(conn.calls.load(Ordering::SeqCst), 3);

        // Once removed, no further polls happen.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(conn.calls.load(Ordering::SeqCst), 3);
        dispatcher.shutdown();
    }

    #[test]
    fn test_remove_source_stops_polling() {
        let dispatcher = RpcDispatcher::new();
        let conn = Arc::new(CountedCheck {
            calls: AtomicU32::new(0),
            done_after: u32::MAX,
        });
        let erased: Arc<dyn AsyncRpcConnection> = conn.clone();
        dispatcher.add_source(Arc::clone(&erased));
        assert!(wait_until(Duration::from_secs(2), || {
            conn.calls.load(Ordering::SeqCst) > 0
        }));
        dispatcher.remove_source(&erased);
        assert_eq!(dispatcher.source_count(), 0);
        dispatcher.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let dispatcher = RpcDispatcher::new();
        dispatcher.add_source(Arc::new(CountedCheck {
            calls: AtomicU32::new(0),
            done_after: 1,
        }));
        dispatcher.shutdown();
        dispatcher.shutdown();
    }
}
