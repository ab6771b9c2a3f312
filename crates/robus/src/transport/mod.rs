// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport seams the byte-level channel implementations plug into.
//!
//! The runtime never touches sockets itself. A [`TransportFactory`] turns a
//! negotiated endpoint into a [`TransportChannel`]; the channel's I/O side
//! pushes complete frames into the [`FrameHandler`] it was opened with (the
//! owning publisher link). The in-process [`mem::MemBus`] implementation is
//! what the test suite and demos run against.

pub mod mem;

use std::sync::Weak;

use crate::error::Result;
use crate::message::ConnectionHeader;

/// The two channel families a publisher can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Reliable, ordered byte stream.
    Stream,
    /// Lossy datagrams, bounded message size.
    Datagram,
}

impl TransportKind {
    /// Stable lowercase name used in logs and stats.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stream => "stream",
            TransportKind::Datagram => "datagram",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection parameters agreed during negotiation with one publisher.
#[derive(Debug, Clone)]
pub struct NegotiatedEndpoint {
    /// Channel family the publisher selected from our preferences.
    pub kind: TransportKind,
    /// Factory-interpreted address of the publisher's data endpoint.
    pub address: String,
    /// Schema fingerprint the publisher advertised.
    pub md5sum: String,
    /// Connection metadata from the publisher (caller id etc.).
    pub header: ConnectionHeader,
}

/// Receiver side of a channel: implemented by the owning publisher link.
///
/// Transport I/O threads call these; neither may block beyond handing the
/// frame to the subscription.
pub trait FrameHandler: Send + Sync {
    /// A complete message frame arrived.
    fn on_frame(&self, bytes: Vec<u8>);

    /// The channel failed; the handler owns tearing the link down.
    fn on_transport_error(&self, reason: &str);
}

/// One live byte channel to one publisher.
pub trait TransportChannel: Send + Sync {
    /// Channel family.
    fn kind(&self) -> TransportKind;

    /// Human-readable endpoint description for logs and stats.
    fn description(&self) -> String;

    /// Stop delivering frames and release the underlying resources.
    /// Idempotent.
    fn close(&self);
}

/// Creates channels from negotiated endpoints.
pub trait TransportFactory: Send + Sync {
    /// Open a channel to `endpoint` delivering frames into `handler`.
    ///
    /// The handler is held weakly: once the owning link is gone the channel
    /// stops delivering on its own. `reserved` is the local datagram
    /// descriptor handed out by [`TransportFactory::reserve_datagram`]
    /// before negotiation, when there was one; datagram channels bind to it
    /// instead of allocating a fresh endpoint.
    ///
    /// # Errors
    ///
    /// [`crate::Error::TransportError`] when the endpoint cannot be reached
    /// or the kind is unsupported.
    fn open_channel(
        &self,
        endpoint: &NegotiatedEndpoint,
        topic: &str,
        handler: Weak<dyn FrameHandler>,
        reserved: Option<&str>,
    ) -> Result<Box<dyn TransportChannel>>;

    /// Reserve a local datagram endpoint before negotiation so its
    /// descriptor can be advertised to the publisher. `None` when the
    /// factory has no datagram support.
    fn reserve_datagram(&self, topic: &str) -> Option<String>;
}

/// Ordered transport preferences for a subscription.
///
/// Preferences are offered to the publisher in insertion order during
/// negotiation; the publisher picks the first kind it supports.
#[derive(Debug, Clone)]
pub struct TransportHints {
    preferences: Vec<TransportKind>,
    datagram_max_size: Option<usize>,
}

impl TransportHints {
    /// Start an empty preference list.
    ///
    /// An empty list is treated as `stream` only.
    #[must_use]
    pub fn new() -> Self {
        Self {
            preferences: Vec::new(),
            datagram_max_size: None,
        }
    }

    /// Append a preference for reliable stream transport.
    #[must_use]
    pub fn stream(mut self) -> Self {
        self.push(TransportKind::Stream);
        self
    }

    /// Append a preference for datagram transport.
    #[must_use]
    pub fn datagram(mut self) -> Self {
        self.push(TransportKind::Datagram);
        self
    }

    /// Cap the datagram payload size offered to publishers.
    #[must_use]
    pub fn max_datagram_size(mut self, bytes: usize) -> Self {
        self.datagram_max_size = Some(bytes);
        self
    }

    fn push(&mut self, kind: TransportKind) {
        if !self.preferences.contains(&kind) {
            self.preferences.push(kind);
        }
    }

    /// The effective preference order.
    #[must_use]
    pub fn preferences(&self) -> Vec<TransportKind> {
        if self.preferences.is_empty() {
            vec![TransportKind::Stream]
        } else {
            self.preferences.clone()
        }
    }

    /// Whether datagram transport appears anywhere in the preferences.
    #[must_use]
    pub fn wants_datagram(&self) -> bool {
        self.preferences.contains(&TransportKind::Datagram)
    }

    /// The configured datagram payload cap, if any.
    #[must_use]
    pub fn datagram_max_size(&self) -> Option<usize> {
        self.datagram_max_size
    }
}

impl Default for TransportHints {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_hints_are_stream_only() {
        let hints = TransportHints::default();
        assert_eq!(hints.preferences(), vec![TransportKind::Stream]);
        assert!(!hints.wants_datagram());
    }

    #[test]
    fn test_preference_order_preserved() {
        let hints = TransportHints::new().datagram().stream();
        assert_eq!(
            hints.preferences(),
            vec![TransportKind::Datagram, TransportKind::Stream]
        );
        assert!(hints.wants_datagram());
    }

    #[test]
    fn test_duplicate_preferences_collapse() {
        let hints = TransportHints::new().stream().stream().datagram();
        assert_eq!(
            hints.preferences(),
            vec![TransportKind::Stream, TransportKind::Datagram]
        );
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(TransportKind::Stream.to_string(), "stream");
        assert_eq!(TransportKind::Datagram.to_string(), "datagram");
    }
}
