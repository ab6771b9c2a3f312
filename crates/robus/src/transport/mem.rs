// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process transport and directory bus.
//!
//! `MemBus` plays both external roles a subscription needs — the transport
//! factory and the negotiation endpoint of every publisher — entirely in
//! process. Publishers are registered under a URI with their topic, schema
//! fingerprint and supported channel kinds; frames pushed with
//! [`MemBus::publish`] fan out to every channel opened against that URI.
//!
//! Negotiation replies can be held back (`hold_replies`) to keep
//! connections in the pending state deliberately, and transport failures
//! can be injected (`fail_links`); both exist for tests and demos.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{Error, Result};
use crate::lockutil::lock_recover;
use crate::message::ConnectionHeader;
use crate::rpc::{
    NegotiationClient, NegotiationClientFactory, NegotiationOutcome, NegotiationRequest,
};
use crate::transport::{
    FrameHandler, NegotiatedEndpoint, TransportChannel, TransportFactory, TransportKind,
};

struct MemSink {
    id: u64,
    handler: Weak<dyn FrameHandler>,
}

struct MemPublisher {
    topic: String,
    md5sum: String,
    datatype: String,
    kinds: Vec<TransportKind>,
    header: ConnectionHeader,
    sinks: Vec<MemSink>,
}

struct BusState {
    publishers: HashMap<String, MemPublisher>,
    hold_replies: bool,
    released: HashSet<String>,
    next_sink_id: u64,
}

/// In-process publisher registry, transport factory and negotiation
/// endpoint in one object.
pub struct MemBus {
    self_weak: Weak<MemBus>,
    state: Mutex<BusState>,
}

impl MemBus {
    /// Create a shared bus.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            state: Mutex::new(BusState {
                publishers: HashMap::new(),
                hold_replies: false,
                released: HashSet::new(),
                next_sink_id: 0,
            }),
        })
    }

    /// Register a stream-only publisher under `uri`.
    pub fn add_publisher(&self, uri: &str, topic: &str, md5sum: &str, datatype: &str) {
        self.add_publisher_with(uri, topic, md5sum, datatype, &[TransportKind::Stream]);
    }

    /// Register a publisher with an explicit set of supported channel kinds.
    pub fn add_publisher_with(
        &self,
        uri: &str,
        topic: &str,
        md5sum: &str,
        datatype: &str,
        kinds: &[TransportKind],
    ) {
        let mut header = ConnectionHeader::new();
        header.insert("callerid", uri);
        header.insert("topic", topic);
        header.insert("md5sum", md5sum);
        header.insert("type", datatype);

        let mut state = lock_recover(&self.state, "mem bus");
        state.publishers.insert(
            uri.to_string(),
            MemPublisher {
                topic: topic.to_string(),
                md5sum: md5sum.to_string(),
                datatype: datatype.to_string(),
                kinds: kinds.to_vec(),
                header,
                sinks: Vec::new(),
            },
        );
    }

    /// Deregister a publisher; open channels against it go quiet.
    pub fn remove_publisher(&self, uri: &str) {
        lock_recover(&self.state, "mem bus").publishers.remove(uri);
    }

    /// Hold negotiation replies until [`MemBus::release_reply`].
    pub fn hold_replies(&self, hold: bool) {
        let mut state = lock_recover(&self.state, "mem bus");
        state.hold_replies = hold;
        if !hold {
            state.released.clear();
        }
    }

    /// Let the held reply for `uri` through.
    pub fn release_reply(&self, uri: &str) {
        lock_recover(&self.state, "mem bus")
            .released
            .insert(uri.to_string());
    }

    /// Fan a frame out to every channel opened against `uri`.
    ///
    /// Returns the number of live channels reached.
    pub fn publish(&self, uri: &str, bytes: &[u8]) -> usize {
        let handlers = self.collect_handlers(uri);
        for handler in &handlers {
            handler.on_frame(bytes.to_vec());
        }
        handlers.len()
    }

    /// Signal a transport failure to every channel opened against `uri`.
    pub fn fail_links(&self, uri: &str) {
        let handlers = self.collect_handlers(uri);
        for handler in &handlers {
            handler.on_transport_error("injected transport failure");
        }
    }

    /// Number of live channels currently opened against `uri`.
    #[must_use]
    pub fn active_link_count(&self, uri: &str) -> usize {
        let mut state = lock_recover(&self.state, "mem bus");
        match state.publishers.get_mut(uri) {
            Some(publisher) => {
                publisher.sinks.retain(|s| s.handler.strong_count() > 0);
                publisher.sinks.len()
            }
            None => 0,
        }
    }

    /// Upgrade all live handlers for `uri`, pruning dead ones. Handlers are
    /// invoked outside the bus lock.
    fn collect_handlers(&self, uri: &str) -> Vec<Arc<dyn FrameHandler>> {
        let mut state = lock_recover(&self.state, "mem bus");
        match state.publishers.get_mut(uri) {
            Some(publisher) => {
                let mut live = Vec::with_capacity(publisher.sinks.len());
                publisher.sinks.retain(|sink| match sink.handler.upgrade() {
                    Some(handler) => {
                        live.push(handler);
                        true
                    }
                    None => false,
                });
                live
            }
            None => Vec::new(),
        }
    }

    fn unregister_sink(&self, uri: &str, id: u64) {
        let mut state = lock_recover(&self.state, "mem bus");
        if let Some(publisher) = state.publishers.get_mut(uri) {
            publisher.sinks.retain(|s| s.id != id);
        }
    }

    fn resolve(&self, uri: &str, request: &NegotiationRequest) -> Option<NegotiationOutcome> {
        let state = lock_recover(&self.state, "mem bus");
        if state.hold_replies && !state.released.contains(uri) {
            return None;
        }
        let Some(publisher) = state.publishers.get(uri) else {
            return Some(NegotiationOutcome::Failed(format!(
                "unknown publisher {}",
                uri
            )));
        };
        if publisher.topic != request.topic {
            return Some(NegotiationOutcome::Rejected(format!(
                "publisher serves '{}', not '{}'",
                publisher.topic, request.topic
            )));
        }
        let Some(kind) = request
            .preferences
            .iter()
            .copied()
            .find(|k| publisher.kinds.contains(k))
        else {
            return Some(NegotiationOutcome::Rejected(
                "no common transport kind".to_string(),
            ));
        };
        // Schema compatibility is the subscriber's check, made against the
        // fingerprint advertised here.
        Some(NegotiationOutcome::Accepted(NegotiatedEndpoint {
            kind,
            address: uri.to_string(),
            md5sum: publisher.md5sum.clone(),
            header: publisher.header.clone(),
        }))
    }

    /// Datatype a registered publisher advertises (test helper).
    #[must_use]
    pub fn publisher_datatype(&self, uri: &str) -> Option<String> {
        lock_recover(&self.state, "mem bus")
            .publishers
            .get(uri)
            .map(|p| p.datatype.clone())
    }
}

// ============================================================================
// Channel
// ============================================================================

struct MemChannel {
    bus: Weak<MemBus>,
    uri: String,
    id: u64,
    kind: TransportKind,
    closed: AtomicBool,
}

impl TransportChannel for MemChannel {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn description(&self) -> String {
        format!("mem:{}:{}", self.kind, self.uri)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.unregister_sink(&self.uri, self.id);
        }
    }
}

impl Drop for MemChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl TransportFactory for MemBus {
    fn open_channel(
        &self,
        endpoint: &NegotiatedEndpoint,
        topic: &str,
        handler: Weak<dyn FrameHandler>,
        reserved: Option<&str>,
    ) -> Result<Box<dyn TransportChannel>> {
        if let Some(reserved) = reserved {
            // In-process channels have no endpoint to bind; the descriptor
            // only shows up in logs.
            log::debug!("[MemBus] using reserved endpoint {}", reserved);
        }
        let mut state = lock_recover(&self.state, "mem bus");
        let id = state.next_sink_id;
        state.next_sink_id += 1;
        let Some(publisher) = state.publishers.get_mut(&endpoint.address) else {
            return Err(Error::TransportError(format!(
                "no publisher at {}",
                endpoint.address
            )));
        };
        if publisher.topic != topic {
            return Err(Error::TransportError(format!(
                "publisher at {} serves '{}', not '{}'",
                endpoint.address, publisher.topic, topic
            )));
        }
        if !publisher.kinds.contains(&endpoint.kind) {
            return Err(Error::TransportError(format!(
                "publisher at {} does not support {}",
                endpoint.address, endpoint.kind
            )));
        }
        publisher.sinks.push(MemSink { id, handler });
        log::debug!(
            "[MemBus] opened {} channel to {} for '{}'",
            endpoint.kind,
            endpoint.address,
            topic
        );
        Ok(Box::new(MemChannel {
            bus: self.self_weak.clone(),
            uri: endpoint.address.clone(),
            id,
            kind: endpoint.kind,
            closed: AtomicBool::new(false),
        }))
    }

    fn reserve_datagram(&self, topic: &str) -> Option<String> {
        Some(format!("mem:{}#dgram", topic))
    }
}

// ============================================================================
// Negotiation client
// ============================================================================

struct MemNegotiationClient {
    bus: Weak<MemBus>,
    uri: String,
    request: Option<NegotiationRequest>,
}

impl NegotiationClient for MemNegotiationClient {
    fn send_request(&mut self, request: &NegotiationRequest) -> Result<()> {
        self.request = Some(request.clone());
        Ok(())
    }

    fn poll_reply(&mut self) -> Option<NegotiationOutcome> {
        let request = self.request.as_ref()?;
        match self.bus.upgrade() {
            Some(bus) => bus.resolve(&self.uri, request),
            None => Some(NegotiationOutcome::Failed("bus is gone".to_string())),
        }
    }
}

impl NegotiationClientFactory for MemBus {
    fn connect(&self, uri: &str) -> Result<Box<dyn NegotiationClient>> {
        Ok(Box::new(MemNegotiationClient {
            bus: self.self_weak.clone(),
            uri: uri.to_string(),
            request: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Collector {
        frames: StdMutex<Vec<Vec<u8>>>,
        errors: StdMutex<Vec<String>>,
    }

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: StdMutex::new(Vec::new()),
                errors: StdMutex::new(Vec::new()),
            })
        }
    }

    impl FrameHandler for Collector {
        fn on_frame(&self, bytes: Vec<u8>) {
            self.frames.lock().unwrap().push(bytes);
        }

        fn on_transport_error(&self, reason: &str) {
            self.errors.lock().unwrap().push(reason.to_string());
        }
    }

    fn erase_handler(handler: Arc<dyn FrameHandler>) -> Weak<dyn FrameHandler> {
        Arc::downgrade(&handler)
    }

    fn request(topic: &str) -> NegotiationRequest {
        NegotiationRequest {
            topic: topic.to_string(),
            md5sum: "*".to_string(),
            datatype: "*".to_string(),
            caller_id: "/test".to_string(),
            preferences: vec![TransportKind::Stream],
            datagram_descriptor: None,
        }
    }

    #[test]
    fn test_negotiation_accepts_known_publisher() {
        let bus = MemBus::new();
        bus.add_publisher("mem://a", "/t", "abc", "test/T");
        let mut client = bus.connect("mem://a").expect("client");
        client.send_request(&request("/t")).expect("send");
        match client.poll_reply() {
            Some(NegotiationOutcome::Accepted(ep)) => {
                assert_eq!(ep.kind, TransportKind::Stream);
                assert_eq!(ep.md5sum, "abc");
                assert_eq!(ep.header.caller_id(), Some("mem://a"));
            }
            other => panic!("expected Accepted, got {:?}", other),
        }
    }

    #[test]
    fn test_negotiation_fails_for_unknown_uri() {
        let bus = MemBus::new();
        let mut client = bus.connect("mem://nope").expect("client");
        client.send_request(&request("/t")).expect("send");
        assert!(matches!(
            client.poll_reply(),
            Some(NegotiationOutcome::Failed(_))
        ));
    }

    #[test]
    fn test_negotiation_rejects_topic_mismatch() {
        let bus = MemBus::new();
        bus.add_publisher("mem://a", "/other", "abc", "test/T");
        let mut client = bus.connect("mem://a").expect("client");
        client.send_request(&request("/t")).expect("send");
        assert!(matches!(
            client.poll_reply(),
            Some(NegotiationOutcome::Rejected(_))
        ));
    }

    #[test]
    fn test_held_reply_stays_in_flight() {
        let bus = MemBus::new();
        bus.add_publisher("mem://a", "/t", "abc", "test/T");
        bus.hold_replies(true);
        let mut client = bus.connect("mem://a").expect("client");
        client.send_request(&request("/t")).expect("send");
        assert!(client.poll_reply().is_none());
        bus.release_reply("mem://a");
        assert!(matches!(
            client.poll_reply(),
            Some(NegotiationOutcome::Accepted(_))
        ));
    }

    #[test]
    fn test_publish_reaches_open_channels_only() {
        let bus = MemBus::new();
        bus.add_publisher("mem://a", "/t", "abc", "test/T");
        let collector = Collector::new();
        let endpoint = NegotiatedEndpoint {
            kind: TransportKind::Stream,
            address: "mem://a".to_string(),
            md5sum: "abc".to_string(),
            header: ConnectionHeader::new(),
        };
        let weak: Weak<dyn FrameHandler> = erase_handler(collector.clone());
        let channel = bus.open_channel(&endpoint, "/t", weak, None).expect("channel");

        assert_eq!(bus.publish("mem://a", b"frame1"), 1);
        channel.close();
        assert_eq!(bus.publish("mem://a", b"frame2"), 0);
        assert_eq!(collector.frames.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_fail_links_signals_handlers() {
        let bus = MemBus::new();
        bus.add_publisher("mem://a", "/t", "abc", "test/T");
        let collector = Collector::new();
        let endpoint = NegotiatedEndpoint {
            kind: TransportKind::Stream,
            address: "mem://a".to_string(),
            md5sum: "abc".to_string(),
            header: ConnectionHeader::new(),
        };
        let weak: Weak<dyn FrameHandler> = erase_handler(collector.clone());
        let _channel = bus.open_channel(&endpoint, "/t", weak, None).expect("channel");
        bus.fail_links("mem://a");
        assert_eq!(collector.errors.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_dead_handler_is_pruned() {
        let bus = MemBus::new();
        bus.add_publisher("mem://a", "/t", "abc", "test/T");
        let endpoint = NegotiatedEndpoint {
            kind: TransportKind::Stream,
            address: "mem://a".to_string(),
            md5sum: "abc".to_string(),
            header: ConnectionHeader::new(),
        };
        let collector = Collector::new();
        let weak: Weak<dyn FrameHandler> = erase_handler(collector.clone());
        let _channel = bus.open_channel(&endpoint, "/t", weak, None).expect("channel");
        assert_eq!(bus.active_link_count("mem://a"), 1);
        drop(collector);
        assert_eq!(bus.active_link_count("mem://a"), 0);
    }
}
