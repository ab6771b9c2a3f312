// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Errors returned by robus operations.
//!
//! The runtime absorbs transport- and negotiation-level failures internally
//! (a dropped link is re-offered by the next directory update), so `Error`
//! surfaces only at the API seams: construction, decoding, and the
//! collaborator traits implemented outside this crate.

/// Errors returned by robus operations.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Topic name is empty or malformed.
    InvalidTopicName(String),
    /// Rate frequency must be strictly positive.
    InvalidFrequency(f64),
    /// A required collaborator (transport factory, negotiation client
    /// factory, ...) was not supplied to the builder.
    MissingCollaborator(&'static str),

    // ========================================================================
    // Negotiation Errors
    // ========================================================================
    /// The publisher endpoint could not be reached or the RPC failed.
    NegotiationFailed(String),
    /// Publisher advertises a different schema fingerprint than ours.
    SchemaMismatch {
        /// Fingerprint this subscription was created with.
        expected: String,
        /// Fingerprint the publisher advertised.
        advertised: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Channel setup or delivery failed.
    TransportError(String),
    /// I/O error with underlying cause.
    IoError(std::io::Error),

    // ========================================================================
    // Data Errors
    // ========================================================================
    /// Wire bytes could not be decoded into the expected message type.
    DecodeFailed(String),

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// Operation attempted after the owning object was dropped.
    ShuttingDown,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidTopicName(name) => write!(f, "Invalid topic name: '{}'", name),
            Error::InvalidFrequency(hz) => {
                write!(f, "Invalid frequency: {} (must be > 0)", hz)
            }
            Error::MissingCollaborator(what) => {
                write!(f, "Missing collaborator: {}", what)
            }
            Error::NegotiationFailed(msg) => write!(f, "Negotiation failed: {}", msg),
            Error::SchemaMismatch {
                expected,
                advertised,
            } => write!(
                f,
                "Schema mismatch: expected md5 {}, publisher advertised {}",
                expected, advertised
            ),
            Error::TransportError(msg) => write!(f, "Transport error: {}", msg),
            Error::IoError(e) => write!(f, "I/O error: {}", e),
            Error::DecodeFailed(msg) => write!(f, "Decode failed: {}", msg),
            Error::ShuttingDown => write!(f, "Shutting down"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoError(e)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
