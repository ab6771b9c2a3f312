// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shutdown semantics: bounded worker exit, no late callbacks, pending
//! negotiations cancelled.

mod common;

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use common::{collecting_helper, frame, header, wait_for, Chatter};
use robus::callback_queue::{CallbackQueue, CallbackQueueInterface};
use robus::message::{Message, TypedCallbackHelper};
use robus::rpc::RpcDispatcher;
use robus::transport::mem::MemBus;
use robus::Subscription;

const WAIT: Duration = Duration::from_secs(5);

fn subscription(bus: &Arc<MemBus>, threaded: bool) -> Arc<Subscription> {
    Subscription::builder("/t")
        .md5sum(Chatter::md5sum())
        .datatype(Chatter::datatype())
        .threaded(threaded)
        .transport_factory(bus.clone())
        .negotiation(bus.clone())
        .build()
        .expect("build subscription")
}

#[test]
fn test_shutdown_discards_undelivered_inbox() {
    let bus = MemBus::new();
    let sub = subscription(&bus, true);

    let received = Arc::new(Mutex::new(Vec::<String>::new()));
    let entered = Arc::new((Mutex::new(false), Condvar::new()));
    let release = Arc::new((Mutex::new(false), Condvar::new()));

    let sink = Arc::clone(&received);
    let entered_cb = Arc::clone(&entered);
    let release_cb = Arc::clone(&release);
    let helper = TypedCallbackHelper::new(move |m: Chatter| {
        if m.0 == "gate" {
            let (lock, cond) = &*entered_cb;
            *lock.lock().unwrap() = true;
            cond.notify_all();
            let (lock, cond) = &*release_cb;
            let mut go = lock.lock().unwrap();
            while !*go {
                go = cond.wait(go).unwrap();
            }
        }
        sink.lock().unwrap().push(m.0);
    });
    assert!(sub.add_callback(helper, None, 0, None));

    // Worker parked inside the gate callback, backlog queued behind it.
    assert!(sub.handle_message(frame("gate"), header()));
    {
        let (lock, cond) = &*entered;
        let mut flag = lock.lock().unwrap();
        while !*flag {
            flag = cond.wait(flag).unwrap();
        }
    }
    for text in ["m1", "m2", "m3", "m4", "m5"] {
        assert!(sub.handle_message(frame(text), header()));
    }

    // Terminal state reached while the backlog is still queued.
    sub.close();
    {
        let (lock, cond) = &*release;
        *lock.lock().unwrap() = true;
        cond.notify_all();
    }
    sub.shutdown();

    // Only the in-flight callback completed; the backlog never fires.
    assert_eq!(*received.lock().unwrap(), ["gate"]);
    assert!(!sub.handle_message(frame("late"), header()));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(received.lock().unwrap().len(), 1);
}

#[test]
fn test_close_invalidates_parked_queue_work() {
    let bus = MemBus::new();
    let sub = subscription(&bus, false);
    let queue = CallbackQueue::shared();
    let received = Arc::new(Mutex::new(Vec::new()));
    assert!(sub.add_callback(
        collecting_helper(&received),
        Some(queue.clone() as Arc<dyn CallbackQueueInterface>),
        0,
        None,
    ));

    sub.handle_message(frame("m1"), header());
    sub.handle_message(frame("m2"), header());
    assert_eq!(queue.len(), 2);

    sub.close();
    queue.call_available(Duration::from_millis(0));
    assert!(received.lock().unwrap().is_empty());
}

#[test]
fn test_shutdown_cancels_pending_negotiations() {
    let bus = MemBus::new();
    let rpc = RpcDispatcher::shared();
    bus.add_publisher("mem://a", "/t", Chatter::md5sum(), Chatter::datatype());
    bus.hold_replies(true);

    let sub = Subscription::builder("/t")
        .md5sum(Chatter::md5sum())
        .datatype(Chatter::datatype())
        .transport_factory(bus.clone())
        .negotiation(bus.clone())
        .rpc_dispatcher(Arc::clone(&rpc))
        .build()
        .expect("build subscription");

    assert!(sub.pub_update(&["mem://a".to_string()]));
    assert!(wait_for(WAIT, || sub.info().pending_uris == ["mem://a"]));

    sub.shutdown();
    assert!(sub.is_dropped());
    assert!(sub.info().pending_uris.is_empty());

    // A late acceptance must not create a link on a dropped subscription.
    bus.release_reply("mem://a");
    std::thread::sleep(Duration::from_millis(100));
    assert!(sub.info().publisher_uris.is_empty());
    assert_eq!(bus.active_link_count("mem://a"), 0);

    rpc.shutdown();
}

#[test]
fn test_shutdown_drops_links() {
    let bus = MemBus::new();
    bus.add_publisher("mem://a", "/t", Chatter::md5sum(), Chatter::datatype());
    let sub = subscription(&bus, false);
    assert!(sub.negotiate_connection("mem://a", true));
    assert_eq!(bus.active_link_count("mem://a"), 1);

    sub.shutdown();
    assert_eq!(bus.active_link_count("mem://a"), 0);
    assert!(sub.info().publisher_uris.is_empty());
}

#[test]
fn test_shutdown_twice_and_from_two_threads() {
    let bus = MemBus::new();
    let sub = subscription(&bus, true);
    let helper = TypedCallbackHelper::new(|_: Chatter| {});
    assert!(sub.add_callback(helper, None, 0, None));

    let s = Arc::clone(&sub);
    let racer = std::thread::spawn(move || s.shutdown());
    sub.shutdown();
    racer.join().expect("racing shutdown");
    assert!(sub.is_dropped());
}
