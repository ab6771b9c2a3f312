// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! An in-flight connection negotiation with one publisher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::Subscription;
use crate::error::Result;
use crate::lockutil::lock_recover;
use crate::rpc::{AsyncRpcConnection, NegotiationClient, NegotiationRequest};

/// One asynchronous negotiation handshake, from request to outcome.
///
/// Owns the RPC client and references the parent subscription weakly. The
/// dispatcher polls [`AsyncRpcConnection::check`]; when the reply arrives
/// it is delivered to the parent exactly once, and a vanished parent
/// cancels the handshake silently.
pub struct PendingConnection {
    uri: String,
    parent: Weak<Subscription>,
    client: Mutex<Box<dyn NegotiationClient>>,
    /// Local datagram endpoint reserved before negotiation, when datagram
    /// transport was offered.
    datagram_descriptor: Option<String>,
    finished: AtomicBool,
}

impl PendingConnection {
    pub(crate) fn new(
        uri: &str,
        parent: Weak<Subscription>,
        client: Box<dyn NegotiationClient>,
        datagram_descriptor: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            uri: uri.to_string(),
            parent,
            client: Mutex::new(client),
            datagram_descriptor,
            finished: AtomicBool::new(false),
        })
    }

    /// The publisher URI being negotiated with.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The reserved local datagram endpoint, if any.
    #[must_use]
    pub fn datagram_descriptor(&self) -> Option<&str> {
        self.datagram_descriptor.as_deref()
    }

    /// Fire the negotiation request.
    pub(crate) fn send(&self, request: &NegotiationRequest) -> Result<()> {
        lock_recover(&self.client, "pending client").send_request(request)
    }

    /// Abandon the handshake; a late reply is discarded.
    pub(crate) fn cancel(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

impl AsyncRpcConnection for PendingConnection {
    fn check(&self) -> bool {
        if self.finished.load(Ordering::Acquire) {
            return true;
        }
        let Some(parent) = self.parent.upgrade() else {
            // Parent gone: nobody to deliver to.
            self.finished.store(true, Ordering::Release);
            return true;
        };
        let outcome = lock_recover(&self.client, "pending client").poll_reply();
        let Some(outcome) = outcome else {
            return false;
        };
        if self.finished.swap(true, Ordering::AcqRel) {
            // Cancelled while the reply raced in.
            return true;
        }
        parent.pending_connection_done(self, outcome);
        true
    }
}
