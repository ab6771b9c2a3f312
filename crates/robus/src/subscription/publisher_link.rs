// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One live connection to one upstream publisher.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::Subscription;
use crate::error::Result;
use crate::lockutil::lock_recover;
use crate::message::ConnectionHeader;
use crate::stats::LinkStats;
use crate::transport::{
    FrameHandler, NegotiatedEndpoint, TransportChannel, TransportFactory, TransportKind,
};

/// A live channel from one publisher to the owning [`Subscription`].
///
/// The link owns its transport channel and holds the parent subscription
/// only weakly; when the parent is gone, incoming frames are dropped
/// silently. Created on negotiation success, destroyed when the publisher
/// disappears from a directory update, the transport errors out, or the
/// subscription shuts down.
pub struct PublisherLink {
    parent: Weak<Subscription>,
    uri: String,
    kind: TransportKind,
    header: Arc<ConnectionHeader>,
    channel: Mutex<Option<Box<dyn TransportChannel>>>,
    bytes_received: AtomicU64,
    frames_received: AtomicU64,
    dropped: AtomicBool,
}

impl PublisherLink {
    /// Open the negotiated channel and wire it to `parent`. `reserved` is
    /// the datagram endpoint set aside before negotiation, if any.
    pub(crate) fn connect(
        parent: Weak<Subscription>,
        topic: &str,
        uri: &str,
        endpoint: &NegotiatedEndpoint,
        factory: &Arc<dyn TransportFactory>,
        reserved: Option<&str>,
    ) -> Result<Arc<Self>> {
        let link = Arc::new(Self {
            parent,
            uri: uri.to_string(),
            kind: endpoint.kind,
            header: Arc::new(endpoint.header.clone()),
            channel: Mutex::new(None),
            bytes_received: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            dropped: AtomicBool::new(false),
        });
        let link_dyn: Arc<dyn FrameHandler> = link.clone();
        let handler: Weak<dyn FrameHandler> = Arc::downgrade(&link_dyn);
        let channel = factory.open_channel(endpoint, topic, handler, reserved)?;
        *lock_recover(&link.channel, "link channel") = Some(channel);
        Ok(link)
    }

    /// The publisher's directory URI (the link's identity).
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Channel family carrying this link.
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Connection metadata captured at negotiation time.
    #[must_use]
    pub fn connection_header(&self) -> &Arc<ConnectionHeader> {
        &self.header
    }

    /// Whether the link has been torn down.
    #[must_use]
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    /// Current per-link counters.
    #[must_use]
    pub fn stats(&self) -> LinkStats {
        LinkStats {
            uri: self.uri.clone(),
            transport: self.kind.as_str().to_string(),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
        }
    }

    /// Stop delivery and release the transport. Idempotent.
    pub(crate) fn drop_link(&self) {
        if self.dropped.swap(true, Ordering::AcqRel) {
            return;
        }
        let channel = lock_recover(&self.channel, "link channel").take();
        if let Some(channel) = channel {
            log::debug!(
                "[PublisherLink] closing {} to {}",
                channel.description(),
                self.uri
            );
            channel.close();
        }
    }
}

impl FrameHandler for PublisherLink {
    fn on_frame(&self, bytes: Vec<u8>) {
        if self.dropped.load(Ordering::Acquire) {
            return;
        }
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        if let Some(parent) = self.parent.upgrade() {
            parent.handle_message(Arc::from(bytes), Arc::clone(&self.header));
        }
    }

    fn on_transport_error(&self, reason: &str) {
        if self.dropped.load(Ordering::Acquire) {
            return;
        }
        log::warn!(
            "[PublisherLink] transport error on link to {}: {}",
            self.uri,
            reason
        );
        match self.parent.upgrade() {
            Some(parent) => parent.remove_publisher_link(self),
            None => self.drop_link(),
        }
    }
}
