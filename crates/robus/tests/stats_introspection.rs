// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! getStats/getInfo snapshots: schema stability and counter semantics.

mod common;

use std::sync::{Arc, Mutex};

use common::{collecting_helper, frame, header, Chatter};
use robus::message::Message;
use robus::transport::mem::MemBus;
use robus::Subscription;

#[test]
fn test_stats_reflect_links_and_traffic() {
    let bus = MemBus::new();
    bus.add_publisher("mem://a", "/t", Chatter::md5sum(), Chatter::datatype());
    let sub = Subscription::builder("/t")
        .md5sum(Chatter::md5sum())
        .datatype(Chatter::datatype())
        .transport_factory(bus.clone())
        .negotiation(bus.clone())
        .build()
        .expect("build subscription");

    let received = Arc::new(Mutex::new(Vec::new()));
    assert!(sub.add_callback(collecting_helper(&received), None, 0, None));
    assert!(sub.negotiate_connection("mem://a", true));

    bus.publish("mem://a", b"hi");
    bus.publish("mem://a", b"there");

    let stats = sub.stats();
    assert_eq!(stats.topic, "/t");
    assert_eq!(stats.drops, 0);
    assert_eq!(stats.queue_depth, 0);
    assert_eq!(stats.links.len(), 1);
    assert_eq!(stats.links[0].uri, "mem://a");
    assert_eq!(stats.links[0].transport, "stream");
    assert_eq!(stats.links[0].frames_received, 2);
    assert_eq!(stats.links[0].bytes_received, 7);
    assert_eq!(stats.callback_latency.samples, 2);

    let info = sub.info();
    assert_eq!(info.md5sum, Chatter::md5sum());
    assert_eq!(info.datatype, Chatter::datatype());
    assert!(!info.threaded);
    assert_eq!(info.publisher_uris, ["mem://a"]);
    assert_eq!(info.callback_count, 1);

    sub.shutdown();
}

#[test]
fn test_stats_serialize_with_stable_keys() {
    let bus = MemBus::new();
    let sub = Subscription::builder("/t")
        .transport_factory(bus.clone())
        .negotiation(bus)
        .build()
        .expect("build subscription");

    let json = serde_json::to_value(sub.stats()).expect("serialize stats");
    for key in [
        "topic",
        "drops",
        "queue_depth",
        "max_queue",
        "links",
        "callback_latency",
    ] {
        assert!(json.get(key).is_some(), "stats lost key '{}'", key);
    }

    let json = serde_json::to_value(sub.info()).expect("serialize info");
    for key in [
        "topic",
        "md5sum",
        "datatype",
        "threaded",
        "publisher_uris",
        "pending_uris",
        "callback_count",
    ] {
        assert!(json.get(key).is_some(), "info lost key '{}'", key);
    }
    sub.shutdown();
}

#[test]
fn test_drop_counter_is_monotonic() {
    let bus = MemBus::new();
    // Threaded with no callbacks: the worker never starts, so the inbox
    // bound is exercised deterministically.
    let sub = Subscription::builder("/t")
        .md5sum(Chatter::md5sum())
        .datatype(Chatter::datatype())
        .threaded(true)
        .max_queue(1)
        .transport_factory(bus.clone())
        .negotiation(bus)
        .build()
        .expect("build subscription");

    for text in ["m1", "m2", "m3"] {
        assert!(sub.handle_message(frame(text), header()));
    }
    let stats = sub.stats();
    assert_eq!(stats.drops, 2);
    assert_eq!(stats.queue_depth, 1);
    assert_eq!(stats.max_queue, 1);

    // The counter never resets.
    assert!(sub.handle_message(frame("m4"), header()));
    assert_eq!(sub.stats().drops, 3);

    sub.shutdown();
}
