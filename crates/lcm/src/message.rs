// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message envelope and typed payload helpers.
//!
//! The transport moves opaque bytes. Typed messages are framed by the
//! application as an 8-byte big-endian fingerprint followed by the encoded
//! body; [`LcmMessage`] only checks that the fingerprint matches.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt};
use std::io::Cursor;
use std::time::{SystemTime, UNIX_EPOCH};

/// A received message as handed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub channel: String,
    pub data: Vec<u8>,
    /// Microseconds since the Unix epoch.
    pub recv_utime: i64,
}

impl ReceivedMessage {
    /// Envelope stamped with the current time.
    pub fn new(channel: impl Into<String>, data: Vec<u8>) -> Self {
        Self::with_utime(channel, data, timestamp_now())
    }

    pub fn with_utime(channel: impl Into<String>, data: Vec<u8>, recv_utime: i64) -> Self {
        Self {
            channel: channel.into(),
            data,
            recv_utime,
        }
    }

    /// Payload with one trailing NUL removed, as published by `publish_str`.
    pub fn data_as_str(&self) -> Option<&str> {
        let bytes = self.data.strip_suffix(b"\0").unwrap_or(&self.data);
        std::str::from_utf8(bytes).ok()
    }

    /// Decode the payload as `M`, checking its fingerprint.
    pub fn decode_message<M: LcmMessage>(&self) -> Result<M> {
        M::decode(&self.data)
    }
}

/// Current time in microseconds since the Unix epoch.
pub fn timestamp_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// An application message with a schema fingerprint.
///
/// Implementors write the body; the fingerprint prefix is handled here.
pub trait LcmMessage: Sized {
    /// Schema identifier, compared for equality only.
    const FINGERPRINT: i64;

    fn encode_body(&self, buf: &mut Vec<u8>) -> Result<()>;

    fn decode_body(cursor: &mut Cursor<&[u8]>) -> Result<Self>;

    /// Fingerprint followed by body.
    fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&Self::FINGERPRINT.to_be_bytes());
        self.encode_body(&mut buf)?;
        Ok(buf)
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let actual = cursor
            .read_i64::<BigEndian>()
            .map_err(|_| Error::Decode("payload shorter than fingerprint".to_string()))?;
        if actual != Self::FINGERPRINT {
            return Err(Error::FingerprintMismatch {
                expected: Self::FINGERPRINT,
                actual,
            });
        }
        Self::decode_body(&mut cursor)
    }
}
