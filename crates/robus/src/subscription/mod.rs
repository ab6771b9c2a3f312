// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-topic subscription engine.
//!
//! A [`Subscription`] reconciles the publisher set pushed by the directory
//! service, drives connection negotiation, owns the resulting links, and
//! fans incoming serialized messages out to user callbacks.
//!
//! # Architecture
//!
//! ```text
//! directory ── pub_update ──> Subscription ──┬── PendingConnection (RPC poll)
//!                                            └── PublisherLink (transport)
//!                                                      │ frames
//!                                                      ▼
//!                         handle_message ──> inbox ──> worker thread
//!                              │ (unthreaded: inline)      │
//!                              ▼                           ▼
//!                         invoke_callback: inline call or CallbackQueue handoff
//! ```
//!
//! Delivery modes per registered callback:
//! - no callback queue: deserialize and invoke on the delivering thread,
//! - with a callback queue: park the bytes and enqueue a deserializing
//!   callback object; a user thread drains it.
//!
//! In threaded mode the inbox is bounded by `max_queue` with oldest-drop
//! displacement: fresher sensor data beats stale backlog.

pub mod pending;
pub mod publisher_link;

pub use pending::PendingConnection;
pub use publisher_link::PublisherLink;

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::callback_queue::{CallResult, CallbackQueueInterface, QueuedCallback};
use crate::error::{Error, Result};
use crate::lockutil::lock_recover;
use crate::message::{md5_matches, ConnectionHeader, SubscriptionCallbackHelper};
use crate::rpc::{
    AsyncRpcConnection, NegotiationClientFactory, NegotiationOutcome, NegotiationRequest,
    RpcDispatcher,
};
use crate::stats::{LatencyHistogram, SubscriptionInfo, SubscriptionStats};
use crate::transport::{TransportFactory, TransportHints};

/// Upper bound on a blocking `negotiate_connection` call.
const BLOCKING_NEGOTIATION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Poll cadence while blocking on a negotiation.
const BLOCKING_POLL: std::time::Duration = std::time::Duration::from_millis(1);

type RawCallback = Box<dyn Fn(&[u8], &Arc<ConnectionHeader>) + Send + Sync>;
type TrackedRef = Weak<dyn Any + Send + Sync>;

struct InboxEntry {
    bytes: Arc<[u8]>,
    header: Arc<ConnectionHeader>,
}

// ============================================================================
// Per-callback work queue (callback-queue delivery path)
// ============================================================================

struct WorkItem {
    bytes: Arc<[u8]>,
    header: Arc<ConnectionHeader>,
}

/// Bytes parked for one registered callback until a user thread drains its
/// queue. Bounded per callback; the oldest entry is displaced when full.
///
/// Displacement leaves the displaced entry's callback object on the user
/// queue; it finds the work queue short and drains as `Invalid`.
struct CallbackWork {
    items: Mutex<VecDeque<WorkItem>>,
    capacity: usize,
}

impl CallbackWork {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
        })
    }

    fn push(&self, item: WorkItem, topic: &str) {
        let mut items = lock_recover(&self.items, "callback work");
        if self.capacity > 0 && items.len() == self.capacity {
            items.pop_front();
            log::debug!(
                "[Subscription] per-callback queue full on '{}', dropping oldest",
                topic
            );
        }
        items.push_back(item);
    }

    fn pop(&self) -> Option<WorkItem> {
        lock_recover(&self.items, "callback work").pop_front()
    }

    fn clear(&self) {
        lock_recover(&self.items, "callback work").clear();
    }
}

/// The deferred deserialize-and-dispatch object pushed onto user queues.
struct QueuedMessageCallback {
    helper: Arc<dyn SubscriptionCallbackHelper>,
    work: Arc<CallbackWork>,
    tracked: Option<TrackedRef>,
    latency: Arc<LatencyHistogram>,
    topic: String,
}

impl QueuedCallback for QueuedMessageCallback {
    fn call(&self) -> CallResult {
        // The matching item may have been displaced or cleared; nothing to do.
        let Some(item) = self.work.pop() else {
            return CallResult::Invalid;
        };
        let _tracked_alive = match &self.tracked {
            Some(tracked) => match tracked.upgrade() {
                Some(guard) => Some(guard),
                None => return CallResult::Invalid,
            },
            None => None,
        };
        let start = Instant::now();
        if let Err(e) = self.helper.deserialize_and_call(&item.bytes, &item.header) {
            log::warn!("[Subscription] decode failed on '{}': {}", self.topic, e);
        }
        self.latency.record(start.elapsed());
        CallResult::Success
    }
}

// ============================================================================
// Registered callbacks
// ============================================================================

enum CallbackKind {
    /// Legacy raw-bytes callback, always invoked inline.
    Raw(RawCallback),
    /// Typed callback with an optional target queue.
    Typed {
        helper: Arc<dyn SubscriptionCallbackHelper>,
        queue: Option<Arc<dyn CallbackQueueInterface>>,
        work: Arc<CallbackWork>,
        tracked: Option<TrackedRef>,
    },
}

struct CallbackInfo {
    id: u64,
    kind: CallbackKind,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Subscription`].
pub struct SubscriptionBuilder {
    name: String,
    md5sum: String,
    datatype: String,
    threaded: bool,
    max_queue: usize,
    hints: TransportHints,
    caller_id: String,
    own_uri: Option<String>,
    factory: Option<Arc<dyn TransportFactory>>,
    connector: Option<Arc<dyn NegotiationClientFactory>>,
    rpc: Option<Arc<RpcDispatcher>>,
}

impl SubscriptionBuilder {
    /// Subscriber-side schema fingerprint (default `"*"`).
    #[must_use]
    pub fn md5sum(mut self, md5sum: &str) -> Self {
        self.md5sum = md5sum.to_string();
        self
    }

    /// Subscriber-side datatype name (default `"*"`).
    #[must_use]
    pub fn datatype(mut self, datatype: &str) -> Self {
        self.datatype = datatype.to_string();
        self
    }

    /// Run a dedicated worker thread that drains the inbox (default off).
    #[must_use]
    pub fn threaded(mut self, threaded: bool) -> Self {
        self.threaded = threaded;
        self
    }

    /// Bound the inbox to `max_queue` entries; 0 means unbounded (default).
    #[must_use]
    pub fn max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue;
        self
    }

    /// Transport preferences offered during negotiation.
    #[must_use]
    pub fn transport_hints(mut self, hints: TransportHints) -> Self {
        self.hints = hints;
        self
    }

    /// Caller id of the subscribing node (default `"/node"`).
    #[must_use]
    pub fn caller_id(mut self, caller_id: &str) -> Self {
        self.caller_id = caller_id.to_string();
        self
    }

    /// This node's own directory URI; filtered out of publisher updates so
    /// the node never subscribes to itself.
    #[must_use]
    pub fn own_uri(mut self, uri: &str) -> Self {
        self.own_uri = Some(uri.to_string());
        self
    }

    /// The transport factory channels are opened with (required).
    #[must_use]
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// The negotiation client factory (required).
    #[must_use]
    pub fn negotiation(mut self, connector: Arc<dyn NegotiationClientFactory>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// The RPC dispatcher polling in-flight negotiations (defaults to a
    /// private dispatcher).
    #[must_use]
    pub fn rpc_dispatcher(mut self, rpc: Arc<RpcDispatcher>) -> Self {
        self.rpc = Some(rpc);
        self
    }

    /// Construct the subscription in the non-dropped state.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTopicName`] for an empty topic,
    /// [`Error::MissingCollaborator`] when the transport factory or
    /// negotiation factory was not supplied.
    pub fn build(self) -> Result<Arc<Subscription>> {
        if self.name.is_empty() {
            return Err(Error::InvalidTopicName(self.name));
        }
        let factory = self
            .factory
            .ok_or(Error::MissingCollaborator("transport factory"))?;
        let connector = self
            .connector
            .ok_or(Error::MissingCollaborator("negotiation client factory"))?;
        let rpc = self.rpc.unwrap_or_else(RpcDispatcher::shared);

        Ok(Arc::new_cyclic(|weak| Subscription {
            name: self.name,
            md5sum: self.md5sum,
            datatype: self.datatype,
            threaded: self.threaded,
            max_queue: self.max_queue,
            hints: self.hints,
            caller_id: self.caller_id,
            own_uri: self.own_uri,
            factory,
            connector,
            rpc,
            self_weak: weak.clone(),
            dropped: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            shutdown_mutex: Mutex::new(()),
            callbacks: Mutex::new(Vec::new()),
            publisher_links: Mutex::new(Vec::new()),
            pending_connections: Mutex::new(Vec::new()),
            inbox: parking_lot::Mutex::new(VecDeque::new()),
            inbox_cond: parking_lot::Condvar::new(),
            drops: AtomicU64::new(0),
            latency: Arc::new(LatencyHistogram::new()),
            worker: Mutex::new(None),
            next_callback_id: AtomicU64::new(0),
        }))
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Manages one subscribed topic: publisher reconciliation, connection
/// lifecycle, and message fan-out.
///
/// Identity is `(topic, md5sum, datatype)`. All operations are callable
/// from any thread; after [`Subscription::close`] every operation becomes a
/// no-op returning `false` where applicable.
pub struct Subscription {
    name: String,
    md5sum: String,
    datatype: String,
    threaded: bool,
    max_queue: usize,
    hints: TransportHints,
    caller_id: String,
    own_uri: Option<String>,

    factory: Arc<dyn TransportFactory>,
    connector: Arc<dyn NegotiationClientFactory>,
    rpc: Arc<RpcDispatcher>,
    self_weak: Weak<Subscription>,

    dropped: AtomicBool,
    shutting_down: AtomicBool,
    shutdown_mutex: Mutex<()>,

    callbacks: Mutex<Vec<Arc<CallbackInfo>>>,
    publisher_links: Mutex<Vec<Arc<PublisherLink>>>,
    pending_connections: Mutex<Vec<Arc<PendingConnection>>>,

    inbox: parking_lot::Mutex<VecDeque<InboxEntry>>,
    inbox_cond: parking_lot::Condvar,
    drops: AtomicU64,
    latency: Arc<LatencyHistogram>,
    worker: Mutex<Option<JoinHandle<()>>>,

    next_callback_id: AtomicU64,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("md5sum", &self.md5sum)
            .field("datatype", &self.datatype)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Start building a subscription on `topic`.
    #[must_use]
    pub fn builder(topic: &str) -> SubscriptionBuilder {
        SubscriptionBuilder {
            name: topic.to_string(),
            md5sum: "*".to_string(),
            datatype: "*".to_string(),
            threaded: false,
            max_queue: 0,
            hints: TransportHints::default(),
            caller_id: "/node".to_string(),
            own_uri: None,
            factory: None,
            connector: None,
            rpc: None,
        }
    }

    /// Topic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscriber-side schema fingerprint.
    #[must_use]
    pub fn md5sum(&self) -> &str {
        &self.md5sum
    }

    /// Subscriber-side datatype name.
    #[must_use]
    pub fn datatype(&self) -> &str {
        &self.datatype
    }

    /// Configured inbox bound; 0 means unbounded.
    #[must_use]
    pub fn max_queue(&self) -> usize {
        self.max_queue
    }

    /// Whether the subscription reached its terminal state.
    #[must_use]
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    // ========================================================================
    // Callback registration
    // ========================================================================

    /// Register a typed callback.
    ///
    /// With `queue = None` the callback runs inline on the delivering
    /// thread; otherwise a deserializing callback object is pushed onto
    /// `queue` for every message and a user thread drains it. `queue_size`
    /// bounds the per-callback backlog on that path (0 = unbounded).
    /// `tracked` ties the callback's validity to an external object: once
    /// it is dropped, deliveries are skipped.
    ///
    /// Returns `false` when the subscription is dropped or the helper's
    /// schema fingerprint is incompatible.
    pub fn add_callback(
        &self,
        helper: Arc<dyn SubscriptionCallbackHelper>,
        queue: Option<Arc<dyn CallbackQueueInterface>>,
        queue_size: usize,
        tracked: Option<Arc<dyn Any + Send + Sync>>,
    ) -> bool {
        if self.dropped.load(Ordering::Acquire) {
            return false;
        }
        if !md5_matches(&self.md5sum, helper.md5sum()) {
            log::warn!(
                "[Subscription] callback md5 {} incompatible with '{}' ({})",
                helper.md5sum(),
                self.name,
                self.md5sum
            );
            return false;
        }
        let info = Arc::new(CallbackInfo {
            id: self.next_callback_id.fetch_add(1, Ordering::Relaxed),
            kind: CallbackKind::Typed {
                helper,
                queue,
                work: CallbackWork::new(queue_size),
                tracked: tracked.map(|t| Arc::downgrade(&t)),
            },
        });
        lock_recover(&self.callbacks, "callbacks").push(info);
        if self.threaded {
            self.ensure_worker();
        }
        true
    }

    /// Remove a typed callback by helper identity. In-flight invocations
    /// complete; queued-but-undrained deliveries turn invalid.
    pub fn remove_callback(&self, helper: &Arc<dyn SubscriptionCallbackHelper>) {
        let removed = {
            let mut callbacks = lock_recover(&self.callbacks, "callbacks");
            let position = callbacks.iter().position(|info| match &info.kind {
                CallbackKind::Typed { helper: h, .. } => Arc::ptr_eq(h, helper),
                CallbackKind::Raw(_) => false,
            });
            position.map(|i| callbacks.remove(i))
        };
        if let Some(info) = removed {
            if let CallbackKind::Typed { work, .. } = &info.kind {
                work.clear();
            }
        }
    }

    /// Register a raw-bytes callback (legacy API), always invoked inline.
    ///
    /// Returns a token for [`Subscription::remove_raw_callback`], or `None`
    /// when the subscription is dropped.
    pub fn add_raw_callback<F>(&self, callback: F) -> Option<u64>
    where
        F: Fn(&[u8], &Arc<ConnectionHeader>) + Send + Sync + 'static,
    {
        if self.dropped.load(Ordering::Acquire) {
            return None;
        }
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        lock_recover(&self.callbacks, "callbacks").push(Arc::new(CallbackInfo {
            id,
            kind: CallbackKind::Raw(Box::new(callback)),
        }));
        if self.threaded {
            self.ensure_worker();
        }
        Some(id)
    }

    /// Remove a raw-bytes callback. No-op on an unknown token.
    pub fn remove_raw_callback(&self, id: u64) -> bool {
        let mut callbacks = lock_recover(&self.callbacks, "callbacks");
        let before = callbacks.len();
        callbacks.retain(|info| info.id != id || !matches!(info.kind, CallbackKind::Raw(_)));
        callbacks.len() != before
    }

    // ========================================================================
    // Publisher reconciliation
    // ========================================================================

    /// Apply the authoritative publisher list from the directory.
    ///
    /// Unknown URIs start a negotiation, vanished URIs drop their link or
    /// cancel their pending negotiation, and this node's own URI is always
    /// filtered out. Returns `false` when the subscription is dropped.
    pub fn pub_update(&self, publishers: &[String]) -> bool {
        if self.dropped.load(Ordering::Acquire) {
            return false;
        }
        let wanted: Vec<&str> = publishers
            .iter()
            .map(String::as_str)
            .filter(|uri| self.own_uri.as_deref() != Some(*uri))
            .collect();

        let mut to_negotiate: Vec<String> = Vec::new();
        let mut stale_links: Vec<Arc<PublisherLink>> = Vec::new();
        let mut stale_pending: Vec<Arc<PendingConnection>> = Vec::new();
        {
            let mut links = lock_recover(&self.publisher_links, "publisher links");
            let mut pending = lock_recover(&self.pending_connections, "pending connections");

            for uri in &wanted {
                let known = links.iter().any(|l| l.uri() == *uri)
                    || pending.iter().any(|p| p.uri() == *uri);
                if !known && !to_negotiate.iter().any(|u| u == uri) {
                    to_negotiate.push((*uri).to_string());
                }
            }
            links.retain(|link| {
                if wanted.iter().any(|uri| *uri == link.uri()) {
                    true
                } else {
                    stale_links.push(Arc::clone(link));
                    false
                }
            });
            pending.retain(|pc| {
                if wanted.iter().any(|uri| *uri == pc.uri()) {
                    true
                } else {
                    stale_pending.push(Arc::clone(pc));
                    false
                }
            });
        }

        for link in stale_links {
            log::info!(
                "[Subscription] publisher {} vanished from '{}'",
                link.uri(),
                self.name
            );
            link.drop_link();
        }
        for pc in stale_pending {
            pc.cancel();
            let erased: Arc<dyn AsyncRpcConnection> = pc;
            self.rpc.remove_source(&erased);
        }
        for uri in to_negotiate {
            self.negotiate_connection(&uri, false);
        }
        true
    }

    /// Start (or, with `block`, complete) a connection negotiation with the
    /// publisher at `uri`.
    ///
    /// Returns `true` when the request was dispatched — not when the
    /// negotiation itself succeeded; that outcome arrives asynchronously.
    pub fn negotiate_connection(&self, uri: &str, block: bool) -> bool {
        if self.dropped.load(Ordering::Acquire) {
            return false;
        }
        let client = match self.connector.connect(uri) {
            Ok(client) => client,
            Err(e) => {
                log::warn!(
                    "[Subscription] cannot reach negotiation endpoint {}: {}",
                    uri,
                    e
                );
                return false;
            }
        };
        let datagram_descriptor = if self.hints.wants_datagram() {
            self.factory.reserve_datagram(&self.name)
        } else {
            None
        };
        let pc = PendingConnection::new(
            uri,
            self.self_weak.clone(),
            client,
            datagram_descriptor.clone(),
        );

        {
            let links = lock_recover(&self.publisher_links, "publisher links");
            let mut pending = lock_recover(&self.pending_connections, "pending connections");
            let known = links.iter().any(|l| l.uri() == uri)
                || pending.iter().any(|p| p.uri() == uri);
            if known {
                log::debug!(
                    "[Subscription] already connected or negotiating with {}",
                    uri
                );
                return false;
            }
            pending.push(Arc::clone(&pc));
        }

        let request = NegotiationRequest {
            topic: self.name.clone(),
            md5sum: self.md5sum.clone(),
            datatype: self.datatype.clone(),
            caller_id: self.caller_id.clone(),
            preferences: self.hints.preferences(),
            datagram_descriptor,
        };
        if let Err(e) = pc.send(&request) {
            log::warn!("[Subscription] negotiation request to {} failed: {}", uri, e);
            self.forget_pending(&pc);
            return false;
        }
        log::debug!("[Subscription] negotiating '{}' with {}", self.name, uri);

        if block {
            let deadline = Instant::now() + BLOCKING_NEGOTIATION_TIMEOUT;
            while !pc.check() {
                if Instant::now() > deadline {
                    log::warn!("[Subscription] negotiation with {} timed out", uri);
                    pc.cancel();
                    self.forget_pending(&pc);
                    return false;
                }
                thread::sleep(BLOCKING_POLL);
            }
        } else {
            let erased: Arc<dyn AsyncRpcConnection> = pc;
            self.rpc.add_source(erased);
        }
        true
    }

    /// Deliver the outcome of one negotiation (called by the pending
    /// connection when its RPC completes).
    pub(crate) fn pending_connection_done(&self, pc: &PendingConnection, outcome: NegotiationOutcome) {
        let removed = {
            let mut pending = lock_recover(&self.pending_connections, "pending connections");
            pending
                .iter()
                .position(|p| std::ptr::eq(Arc::as_ptr(p), pc))
                .map(|i| pending.remove(i))
        };
        if let Some(removed) = removed {
            let erased: Arc<dyn AsyncRpcConnection> = removed;
            self.rpc.remove_source(&erased);
        }
        if self.dropped.load(Ordering::Acquire) || self.shutting_down.load(Ordering::Acquire) {
            return;
        }

        match outcome {
            NegotiationOutcome::Accepted(endpoint) => {
                if !md5_matches(&self.md5sum, &endpoint.md5sum) {
                    log::error!(
                        "[Subscription] schema mismatch on '{}' from {}: ours {}, theirs {}",
                        self.name,
                        pc.uri(),
                        self.md5sum,
                        endpoint.md5sum
                    );
                    return;
                }
                match PublisherLink::connect(
                    self.self_weak.clone(),
                    &self.name,
                    pc.uri(),
                    &endpoint,
                    &self.factory,
                    pc.datagram_descriptor(),
                ) {
                    Ok(link) => {
                        log::info!(
                            "[Subscription] connected to {} for '{}' via {}",
                            pc.uri(),
                            self.name,
                            endpoint.kind
                        );
                        lock_recover(&self.publisher_links, "publisher links").push(link);
                    }
                    Err(e) => {
                        log::warn!(
                            "[Subscription] channel to {} for '{}' failed: {}",
                            pc.uri(),
                            self.name,
                            e
                        );
                    }
                }
            }
            NegotiationOutcome::Rejected(reason) => {
                log::debug!(
                    "[Subscription] {} rejected subscription to '{}': {}",
                    pc.uri(),
                    self.name,
                    reason
                );
            }
            NegotiationOutcome::Failed(reason) => {
                log::warn!(
                    "[Subscription] negotiation with {} for '{}' failed: {}",
                    pc.uri(),
                    self.name,
                    reason
                );
            }
        }
    }

    /// Detach a link after a transport error or publisher shutdown.
    pub(crate) fn remove_publisher_link(&self, link: &PublisherLink) {
        let removed = {
            let mut links = lock_recover(&self.publisher_links, "publisher links");
            links
                .iter()
                .position(|l| std::ptr::eq(Arc::as_ptr(l), link))
                .map(|i| links.remove(i))
        };
        if let Some(removed) = removed {
            removed.drop_link();
        }
    }

    fn forget_pending(&self, pc: &Arc<PendingConnection>) {
        lock_recover(&self.pending_connections, "pending connections")
            .retain(|p| !Arc::ptr_eq(p, pc));
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    /// Accept one serialized message from a link (the hot path).
    ///
    /// Unthreaded subscriptions invoke callbacks inline; threaded ones park
    /// the message in the bounded inbox for the worker, displacing the
    /// oldest entry when full. Returns `false` when dropped.
    pub fn handle_message(&self, bytes: Arc<[u8]>, header: Arc<ConnectionHeader>) -> bool {
        if self.dropped.load(Ordering::Acquire) {
            return false;
        }
        if !self.threaded {
            self.invoke_callback(&bytes, &header);
            return true;
        }
        {
            let mut inbox = self.inbox.lock();
            if self.max_queue > 0 && inbox.len() == self.max_queue {
                inbox.pop_front();
                self.drops.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "[Subscription] inbox full on '{}', dropping oldest",
                    self.name
                );
            }
            inbox.push_back(InboxEntry { bytes, header });
        }
        self.inbox_cond.notify_one();
        true
    }

    /// Fan one message out to every registered callback.
    ///
    /// Callbacks registered without a queue run here, panic-isolated from
    /// each other; queue-bound callbacks get a deserializing callback
    /// object pushed onto their queue instead.
    pub fn invoke_callback(&self, bytes: &Arc<[u8]>, header: &Arc<ConnectionHeader>) {
        let snapshot: Vec<Arc<CallbackInfo>> =
            lock_recover(&self.callbacks, "callbacks").clone();

        for info in &snapshot {
            match &info.kind {
                CallbackKind::Raw(callback) => {
                    let start = Instant::now();
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        callback(bytes, header);
                    }));
                    if result.is_err() {
                        log::debug!(
                            "[Subscription] raw callback panicked on '{}'",
                            self.name
                        );
                    }
                    self.latency.record(start.elapsed());
                }
                CallbackKind::Typed {
                    helper,
                    queue: None,
                    tracked,
                    ..
                } => {
                    let _tracked_alive = match tracked {
                        Some(t) => match t.upgrade() {
                            Some(guard) => Some(guard),
                            // Owner gone: skip silently.
                            None => continue,
                        },
                        None => None,
                    };
                    let start = Instant::now();
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        helper.deserialize_and_call(bytes, header)
                    }));
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            log::warn!(
                                "[Subscription] decode failed on '{}': {}",
                                self.name,
                                e
                            );
                        }
                        Err(_) => {
                            log::debug!(
                                "[Subscription] callback panicked on '{}'",
                                self.name
                            );
                        }
                    }
                    self.latency.record(start.elapsed());
                }
                CallbackKind::Typed {
                    helper,
                    queue: Some(queue),
                    work,
                    tracked,
                } => {
                    work.push(
                        WorkItem {
                            bytes: Arc::clone(bytes),
                            header: Arc::clone(header),
                        },
                        &self.name,
                    );
                    queue.add_callback(Box::new(QueuedMessageCallback {
                        helper: Arc::clone(helper),
                        work: Arc::clone(work),
                        tracked: tracked.clone(),
                        latency: Arc::clone(&self.latency),
                        topic: self.name.clone(),
                    }));
                }
            }
        }
    }

    fn ensure_worker(&self) {
        let mut slot = lock_recover(&self.worker, "worker");
        if slot.is_some() {
            return;
        }
        let weak = self.self_weak.clone();
        let topic = self.name.clone();
        let handle = thread::Builder::new()
            .name(format!("robus-sub{}", topic))
            .spawn(move || {
                log::debug!("[Subscription] worker for '{}' started", topic);
                loop {
                    let Some(sub) = weak.upgrade() else {
                        break;
                    };
                    let entry = {
                        let mut inbox = sub.inbox.lock();
                        loop {
                            if sub.dropped.load(Ordering::Acquire) {
                                // Terminal: whatever is still queued is
                                // discarded, nothing fires after shutdown.
                                log::debug!(
                                    "[Subscription] worker for '{}' exiting",
                                    topic
                                );
                                return;
                            }
                            if let Some(entry) = inbox.pop_front() {
                                break entry;
                            }
                            sub.inbox_cond.wait(&mut inbox);
                        }
                    };
                    sub.invoke_callback(&entry.bytes, &entry.header);
                }
            })
            .expect("spawn subscription worker thread");
        *slot = Some(handle);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Enter the terminal state: drop every link, cancel every pending
    /// negotiation, discard queued work and wake the worker. Idempotent.
    pub fn close(&self) {
        {
            let _guard = lock_recover(&self.shutdown_mutex, "shutdown");
            if self.dropped.swap(true, Ordering::AcqRel) {
                self.wake_worker();
                return;
            }
        }
        log::debug!("[Subscription] dropping '{}'", self.name);
        self.drop_all_connections();

        // Queued-but-undrained deliveries on user queues turn invalid.
        let snapshot: Vec<Arc<CallbackInfo>> =
            lock_recover(&self.callbacks, "callbacks").clone();
        for info in snapshot {
            if let CallbackKind::Typed { work, .. } = &info.kind {
                work.clear();
            }
        }
        self.wake_worker();
    }

    /// Wake the worker so it observes `dropped`. The flag is written
    /// outside the inbox lock, so the notify must bridge the lock to reach
    /// a worker that is between its check and its wait.
    fn wake_worker(&self) {
        drop(self.inbox.lock());
        self.inbox_cond.notify_all();
    }

    /// [`Subscription::close`] plus joining the worker thread.
    pub fn shutdown(&self) {
        {
            let _guard = lock_recover(&self.shutdown_mutex, "shutdown");
            self.shutting_down.store(true, Ordering::Release);
        }
        self.close();
        let handle = lock_recover(&self.worker, "worker").take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn drop_all_connections(&self) {
        let links: Vec<Arc<PublisherLink>> = {
            let mut guard = lock_recover(&self.publisher_links, "publisher links");
            std::mem::take(&mut *guard)
        };
        for link in links {
            link.drop_link();
        }
        let pending: Vec<Arc<PendingConnection>> = {
            let mut guard = lock_recover(&self.pending_connections, "pending connections");
            std::mem::take(&mut *guard)
        };
        for pc in pending {
            pc.cancel();
            let erased: Arc<dyn AsyncRpcConnection> = pc;
            self.rpc.remove_source(&erased);
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Counter snapshot (stable schema for the process lifetime).
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            topic: self.name.clone(),
            drops: self.drops.load(Ordering::Relaxed),
            queue_depth: self.inbox.lock().len(),
            max_queue: self.max_queue,
            links: lock_recover(&self.publisher_links, "publisher links")
                .iter()
                .map(|l| l.stats())
                .collect(),
            callback_latency: self.latency.summary(),
        }
    }

    /// Identity and topology snapshot.
    #[must_use]
    pub fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            topic: self.name.clone(),
            md5sum: self.md5sum.clone(),
            datatype: self.datatype.clone(),
            threaded: self.threaded,
            publisher_uris: lock_recover(&self.publisher_links, "publisher links")
                .iter()
                .map(|l| l.uri().to_string())
                .collect(),
            pending_uris: lock_recover(&self.pending_connections, "pending connections")
                .iter()
                .map(|p| p.uri().to_string())
                .collect(),
            callback_count: lock_recover(&self.callbacks, "callbacks").len(),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
