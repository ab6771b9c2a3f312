// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # robus — robotics pub/sub client runtime
//!
//! The client side of a directory-based publish/subscribe middleware for
//! robotics: nodes discover publishers through a central directory service,
//! negotiate per-topic transport connections over an out-of-band RPC
//! channel, and exchange typed messages.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                         Application Layer                           |
//! |        typed callbacks | CallbackQueue drains | Rate loops          |
//! +---------------------------------------------------------------------+
//! |                         Runtime Core                                |
//! |   Subscription (reconcile, negotiate, fan out) | TimerManager       |
//! +---------------------------------------------------------------------+
//! |                      External Collaborators                         |
//! |   directory client | RPC dispatch | transport channels | codegen    |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Subscription`] | Per-topic engine: publisher set, links, delivery |
//! | [`TimerManager`] | Periodic callback scheduler per clock domain |
//! | [`CallbackQueue`] | User-drained queue decoupling I/O from user code |
//! | [`Time`]/[`WallTime`] | The two incompatible clock domains |
//! | [`Rate`] | Fixed-frequency loop helper |
//!
//! ## Quick Start
//!
//! ```
//! use robus::transport::mem::MemBus;
//! use robus::{Subscription, TransportHints};
//!
//! // In production the factories come from the network transport and
//! // directory RPC layers; MemBus is the in-process stand-in.
//! let bus = MemBus::new();
//! bus.add_publisher("mem://cam", "/images", "*", "sensors/Image");
//!
//! let sub = Subscription::builder("/images")
//!     .datatype("sensors/Image")
//!     .transport_hints(TransportHints::new().stream())
//!     .transport_factory(bus.clone())
//!     .negotiation(bus.clone())
//!     .build()?;
//!
//! sub.add_raw_callback(|bytes, _header| println!("{} bytes", bytes.len()));
//! sub.pub_update(&["mem://cam".to_string()]);
//! # Ok::<(), robus::Error>(())
//! ```
//!
//! ## Delivery Model
//!
//! Best effort: a bounded subscription inbox displaces the **oldest** entry
//! under overload (fresh sensor data beats stale backlog), ordering holds
//! per publisher link but not across links, and transport or negotiation
//! failures are absorbed and healed by the next directory update.

/// Deferred callbacks and user-drained queues.
pub mod callback_queue;
/// Crate error type.
pub mod error;
mod lockutil;
/// Typed-message seam (decode trait, connection headers, helpers).
pub mod message;
/// Negotiation RPC seam and the in-flight connection dispatcher.
pub mod rpc;
/// Introspection snapshots.
pub mod stats;
/// The per-topic subscription engine.
pub mod subscription;
/// Time values, clocks and rate helpers.
pub mod time;
/// Periodic callback scheduling.
pub mod timer;
/// Transport seams and the in-process bus.
pub mod transport;

pub use callback_queue::{CallResult, CallbackQueue, CallbackQueueInterface, QueuedCallback};
pub use error::{Error, Result};
pub use message::{ConnectionHeader, Message, SubscriptionCallbackHelper, TypedCallbackHelper};
pub use rpc::{NegotiationClient, NegotiationClientFactory, NegotiationOutcome, RpcDispatcher};
pub use stats::{LinkStats, SubscriptionInfo, SubscriptionStats};
pub use subscription::{PendingConnection, PublisherLink, Subscription, SubscriptionBuilder};
pub use time::clock::{Clock, SimClock, WallClock};
pub use time::rate::{Rate, SimRate, WallRate};
pub use time::{Duration, Time, WallDuration, WallTime};
pub use timer::{SimTimerManager, TimerEvent, TimerHandle, TimerManager, WallTimerManager};
pub use transport::{TransportFactory, TransportHints, TransportKind};

/// robus version string.
pub const VERSION: &str = "0.2.0";
