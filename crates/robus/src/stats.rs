// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Introspection snapshots.
//!
//! All counters are relaxed atomics updated on the hot path; snapshots are
//! taken without synchronization penalties and serialize with a schema that
//! stays stable for the lifetime of the process.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of log₂ latency buckets; bucket `i` covers `[2^(i-1), 2^i)` ns.
const LATENCY_BUCKETS: usize = 32;

/// Callback latency histogram with power-of-two nanosecond buckets.
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS],
    samples: AtomicU64,
    max_ns: AtomicU64,
}

impl LatencyHistogram {
    /// Create an empty histogram.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            samples: AtomicU64::new(0),
            max_ns: AtomicU64::new(0),
        }
    }

    /// Record one observation.
    pub fn record(&self, elapsed: std::time::Duration) {
        let ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        let index = (u64::BITS - ns.leading_zeros()).min(LATENCY_BUCKETS as u32 - 1);
        self.buckets[index as usize].fetch_add(1, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
    }

    /// Current counters as a serializable summary.
    #[must_use]
    pub fn summary(&self) -> LatencySummary {
        LatencySummary {
            samples: self.samples.load(Ordering::Relaxed),
            max_ns: self.max_ns.load(Ordering::Relaxed),
            buckets: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable view of a [`LatencyHistogram`].
#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    /// Total observations.
    pub samples: u64,
    /// Largest observed latency in nanoseconds.
    pub max_ns: u64,
    /// Per-bucket counts; bucket `i` covers `[2^(i-1), 2^i)` ns.
    pub buckets: Vec<u64>,
}

/// Per-link counters of a subscription.
#[derive(Debug, Clone, Serialize)]
pub struct LinkStats {
    /// Publisher's directory URI.
    pub uri: String,
    /// Channel family carrying this link.
    pub transport: String,
    /// Payload bytes received on this link.
    pub bytes_received: u64,
    /// Complete frames received on this link.
    pub frames_received: u64,
}

/// Counter snapshot of one subscription.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStats {
    /// Topic name.
    pub topic: String,
    /// Messages displaced from the inbox since creation (monotonic).
    pub drops: u64,
    /// Entries currently queued in the inbox.
    pub queue_depth: usize,
    /// Configured inbox bound; 0 means unbounded.
    pub max_queue: usize,
    /// One entry per live publisher link.
    pub links: Vec<LinkStats>,
    /// User-callback invocation latency.
    pub callback_latency: LatencySummary,
}

/// Identity-and-topology snapshot of one subscription.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    /// Topic name.
    pub topic: String,
    /// Subscriber's schema fingerprint.
    pub md5sum: String,
    /// Subscriber's datatype name.
    pub datatype: String,
    /// Whether a worker thread drains the inbox.
    pub threaded: bool,
    /// URIs with an established link.
    pub publisher_uris: Vec<String>,
    /// URIs still in connection negotiation.
    pub pending_uris: Vec<String>,
    /// Registered callback count.
    pub callback_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets_by_magnitude() {
        let h = LatencyHistogram::new();
        h.record(std::time::Duration::from_nanos(1)); // bucket 1
        h.record(std::time::Duration::from_nanos(1000)); // bucket 10
        h.record(std::time::Duration::from_nanos(1024)); // bucket 11
        let s = h.summary();
        assert_eq!(s.samples, 3);
        assert_eq!(s.max_ns, 1024);
        assert_eq!(s.buckets[1], 1);
        assert_eq!(s.buckets[10], 1);
        assert_eq!(s.buckets[11], 1);
    }

    #[test]
    fn test_histogram_zero_duration() {
        let h = LatencyHistogram::new();
        h.record(std::time::Duration::from_nanos(0));
        assert_eq!(h.summary().buckets[0], 1);
    }

    #[test]
    fn test_summary_serializes() {
        let h = LatencyHistogram::new();
        h.record(std::time::Duration::from_micros(5));
        let json = serde_json::to_value(h.summary()).expect("serialize");
        assert_eq!(json["samples"], 1);
        assert_eq!(json["buckets"].as_array().expect("array").len(), 32);
    }
}
