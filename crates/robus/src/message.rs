// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The typed-message seam between wire bytes and user callbacks.
//!
//! The wire format itself lives in generated message crates; the runtime
//! only needs a decode entry point plus the schema identity used for
//! compatibility checks. [`SubscriptionCallbackHelper`] erases the concrete
//! message type so a subscription can fan one byte buffer out to callbacks
//! of different registration styles.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;

/// A wire-decodable message type.
///
/// Implemented by generated message types. `md5sum` is the structural
/// fingerprint of the wire schema; publisher and subscriber fingerprints
/// must match (or be the `"*"` wildcard) for a connection to be accepted.
pub trait Message: Sized + Send + 'static {
    /// Fully qualified datatype name, e.g. `"sensors/Imu"`.
    fn datatype() -> &'static str;

    /// Structural fingerprint of the wire schema.
    fn md5sum() -> &'static str;

    /// Decode one message from wire bytes.
    ///
    /// # Errors
    ///
    /// [`crate::Error::DecodeFailed`] when the bytes do not parse.
    fn decode(bytes: &[u8]) -> Result<Self>;
}

/// Whether two schema fingerprints are compatible.
///
/// `"*"` is the legacy wildcard and matches anything.
#[inline]
#[must_use]
pub fn md5_matches(a: &str, b: &str) -> bool {
    a == "*" || b == "*" || a == b
}

/// Key/value metadata exchanged during connection setup.
///
/// Carries the publisher's caller id, topic, declared md5 and any
/// transport-specific fields. One header is attached to a connection at
/// negotiation time and shared (behind `Arc`) with every message delivered
/// over it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionHeader {
    fields: BTreeMap<String, String>,
}

impl ConnectionHeader {
    /// Create an empty header.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Look up a field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// The publisher's caller id, if present.
    #[must_use]
    pub fn caller_id(&self) -> Option<&str> {
        self.get("callerid")
    }

    /// Iterate all fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the header has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Type-erased deserialize-and-dispatch helper for one registered callback.
///
/// A subscription stores one of these per typed callback; the helper knows
/// how to turn wire bytes into a fresh typed message and hand it to the
/// user function.
pub trait SubscriptionCallbackHelper: Send + Sync {
    /// Datatype name of the callback's message type.
    fn datatype(&self) -> &str;

    /// Schema fingerprint of the callback's message type.
    fn md5sum(&self) -> &str;

    /// Decode `bytes` and invoke the user callback.
    ///
    /// # Errors
    ///
    /// Propagates the decode failure; the user callback is not invoked in
    /// that case.
    fn deserialize_and_call(&self, bytes: &[u8], header: &Arc<ConnectionHeader>) -> Result<()>;
}

/// [`SubscriptionCallbackHelper`] for a concrete message type and closure.
pub struct TypedCallbackHelper<M: Message> {
    callback: Box<dyn Fn(M) + Send + Sync>,
}

impl<M: Message> TypedCallbackHelper<M> {
    /// Wrap a typed user callback.
    pub fn new<F>(callback: F) -> Arc<Self>
    where
        F: Fn(M) + Send + Sync + 'static,
    {
        Arc::new(Self {
            callback: Box::new(callback),
        })
    }
}

impl<M: Message> SubscriptionCallbackHelper for TypedCallbackHelper<M> {
    fn datatype(&self) -> &str {
        M::datatype()
    }

    fn md5sum(&self) -> &str {
        M::md5sum()
    }

    fn deserialize_and_call(&self, bytes: &[u8], _header: &Arc<ConnectionHeader>) -> Result<()> {
        let message = M::decode(bytes)?;
        (self.callback)(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Ping(u32);

    impl Message for Ping {
        fn datatype() -> &'static str {
            "test/Ping"
        }

        fn md5sum() -> &'static str {
            "d41d8cd98f00b204e9800998ecf8427e"
        }

        fn decode(bytes: &[u8]) -> Result<Self> {
            let array: [u8; 4] = bytes
                .try_into()
                .map_err(|_| Error::DecodeFailed("expected 4 bytes".to_string()))?;
            Ok(Ping(u32::from_le_bytes(array)))
        }
    }

    #[test]
    fn test_md5_wildcard() {
        assert!(md5_matches("*", "anything"));
        assert!(md5_matches("abc", "*"));
        assert!(md5_matches("abc", "abc"));
        assert!(!md5_matches("abc", "def"));
    }

    #[test]
    fn test_helper_decodes_and_calls() {
        let seen = Arc::new(AtomicU32::new(0));
        let s = Arc::clone(&seen);
        let helper = TypedCallbackHelper::new(move |ping: Ping| {
            s.store(ping.0, Ordering::SeqCst);
        });
        assert_eq!(helper.datatype(), "test/Ping");

        let header = Arc::new(ConnectionHeader::new());
        helper
            .deserialize_and_call(&42u32.to_le_bytes(), &header)
            .expect("decode succeeds");
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_helper_propagates_decode_error() {
        let helper = TypedCallbackHelper::new(|_: Ping| {
            panic!("callback must not run on decode failure");
        });
        let header = Arc::new(ConnectionHeader::new());
        assert!(helper.deserialize_and_call(b"xyz", &header).is_err());
    }

    #[test]
    fn test_connection_header_fields() {
        let mut header = ConnectionHeader::new();
        header.insert("callerid", "/talker");
        header.insert("topic", "/chatter");
        assert_eq!(header.caller_id(), Some("/talker"));
        assert_eq!(header.get("topic"), Some("/chatter"));
        assert_eq!(header.len(), 2);
    }
}
