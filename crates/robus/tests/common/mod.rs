// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use robus::message::{ConnectionHeader, Message, TypedCallbackHelper};
use robus::Error;

/// UTF-8 string payload used across the tests.
pub struct Chatter(pub String);

impl Message for Chatter {
    fn datatype() -> &'static str {
        "test_msgs/Chatter"
    }

    fn md5sum() -> &'static str {
        "992ce8a1687cec8c8bd883ec73ca41d1"
    }

    fn decode(bytes: &[u8]) -> robus::Result<Self> {
        String::from_utf8(bytes.to_vec())
            .map(Chatter)
            .map_err(|e| Error::DecodeFailed(e.to_string()))
    }
}

/// Encode a chatter payload the way a link delivers it.
pub fn frame(text: &str) -> Arc<[u8]> {
    Arc::from(text.as_bytes().to_vec())
}

/// An empty connection header.
pub fn header() -> Arc<ConnectionHeader> {
    Arc::new(ConnectionHeader::new())
}

/// A helper that appends every decoded payload to `sink`.
pub fn collecting_helper(sink: &Arc<Mutex<Vec<String>>>) -> Arc<TypedCallbackHelper<Chatter>> {
    let sink = Arc::clone(sink);
    TypedCallbackHelper::new(move |m: Chatter| sink.lock().unwrap().push(m.0))
}

/// Poll `pred` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    pred()
}
