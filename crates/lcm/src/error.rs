// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types shared across the crate.

use std::io;
use thiserror::Error;

/// LCM error.
#[derive(Debug, Error)]
pub enum Error {
    // ===== Configuration =====
    /// Connection string is not `scheme://location[?query]`.
    #[error("invalid URL '{0}': expected scheme://location[?key=value&...]")]
    InvalidUrl(String),

    /// No provider is registered for this scheme.
    #[error("unknown provider scheme '{0}'")]
    UnknownScheme(String),

    /// A URL parameter has a value of the wrong type or range.
    #[error("invalid value '{value}' for URL parameter '{key}'")]
    InvalidParam { key: String, value: String },

    // ===== Caller errors =====
    /// Channel name is empty or contains a NUL byte.
    #[error("invalid channel name '{0}'")]
    InvalidChannel(String),

    /// Subscription pattern did not compile.
    #[error("invalid subscription pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Message needs more fragments than the wire format can number.
    #[error("message too large: needs {fragments} fragments (max 65535)")]
    MessageTooLarge { fragments: usize },

    /// Operation on a closed [`crate::Lcm`].
    #[error("LCM instance is closed")]
    Closed,

    /// Event log record outside the limits readers accept.
    #[error("log record too large: channel {channel_len} bytes (max 999), data {data_len} bytes")]
    RecordTooLarge { channel_len: usize, data_len: usize },

    // ===== Payload helpers =====
    /// Encoded message carries another type's fingerprint.
    #[error("fingerprint mismatch: expected {expected:#018x}, got {actual:#018x}")]
    FingerprintMismatch { expected: i64, actual: i64 },

    /// Payload could not be decoded into the requested type.
    #[error("decode error: {0}")]
    Decode(String),

    // ===== Transport =====
    /// Peer violated a framing or handshake rule.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias for LCM operations.
pub type Result<T> = std::result::Result<T, Error>;
