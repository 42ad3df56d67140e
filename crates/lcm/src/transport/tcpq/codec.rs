// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stream codec for the TCP relay protocol.
//!
//! # Handshake
//!
//! ```text
//! client -> hub : magic_client (4) | version (4)
//! hub -> client : magic_server (4) | version (4)
//! ```
//!
//! # Messages
//!
//! ```text
//! publish     : type=1 (4) | channel_len (4) | channel | data_len (4) | data
//! subscribe   : type=2 (4) | pattern_len (4) | pattern
//! unsubscribe : type=3 (4) | pattern_len (4) | pattern
//! ```
//!
//! All integers are big-endian `i32`. The hub only ever sends publish
//! messages to clients.

use crate::config::{MAX_MESSAGE_SIZE, TCPQ_VERSION};
use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

pub const MSG_PUBLISH: i32 = 1;
pub const MSG_SUBSCRIBE: i32 = 2;
pub const MSG_UNSUBSCRIBE: i32 = 3;

/// Longest channel name or pattern accepted from a peer.
pub const MAX_NAME_LEN: usize = 64 * 1024;

const READ_CHUNK: usize = 64 * 1024;

/// One relay protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Publish { channel: String, data: Vec<u8> },
    Subscribe(String),
    Unsubscribe(String),
}

impl RelayFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Publish { channel, data } => {
                buf.reserve(12 + channel.len() + data.len());
                push_i32(buf, MSG_PUBLISH);
                push_bytes(buf, channel.as_bytes());
                push_bytes(buf, data);
            }
            Self::Subscribe(pattern) => {
                push_i32(buf, MSG_SUBSCRIBE);
                push_bytes(buf, pattern.as_bytes());
            }
            Self::Unsubscribe(pattern) => {
                push_i32(buf, MSG_UNSUBSCRIBE);
                push_bytes(buf, pattern.as_bytes());
            }
        }
    }
}

/// Encode a publish frame without copying into a [`RelayFrame`] first.
pub fn encode_publish(channel: &str, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + channel.len() + data.len());
    push_i32(&mut buf, MSG_PUBLISH);
    push_bytes(&mut buf, channel.as_bytes());
    push_bytes(&mut buf, data);
    buf
}

fn push_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn push_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    push_i32(buf, bytes.len() as i32);
    buf.extend_from_slice(bytes);
}

// ===== Handshake =====

pub fn write_handshake<W: Write + ?Sized>(w: &mut W, magic: u32) -> io::Result<()> {
    let mut buf = [0u8; 8];
    BigEndian::write_u32(&mut buf[0..4], magic);
    BigEndian::write_u32(&mut buf[4..8], TCPQ_VERSION);
    w.write_all(&buf)?;
    w.flush()
}

/// Read the peer's handshake and check its magic; returns its version.
pub fn read_handshake<R: Read + ?Sized>(r: &mut R, expected_magic: u32) -> Result<u32> {
    let magic = r.read_u32::<BigEndian>()?;
    if magic != expected_magic {
        return Err(Error::Protocol(format!(
            "bad handshake magic {:#010x}, expected {:#010x}",
            magic, expected_magic
        )));
    }
    Ok(r.read_u32::<BigEndian>()?)
}

// ===== Decoder =====

/// Incremental decoder for a relay byte stream.
///
/// Tolerates read timeouts: partial frames stay buffered across calls.
#[derive(Debug, Default)]
pub struct RelayDecoder {
    buffer: Vec<u8>,
    frames_decoded: u64,
}

impl RelayDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop partial state, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop one complete frame from the buffer.
    pub fn next_frame(&mut self) -> Result<Option<RelayFrame>> {
        let Some((frame, used)) = parse_frame(&self.buffer)? else {
            return Ok(None);
        };
        self.buffer.drain(..used);
        self.frames_decoded += 1;
        Ok(Some(frame))
    }

    /// Read until one frame is complete.
    ///
    /// Returns `Ok(None)` when the reader times out first. End of stream is
    /// an `UnexpectedEof` I/O error.
    pub fn decode<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<Option<RelayFrame>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.next_frame()? {
                return Ok(Some(frame));
            }
            match reader.read(&mut chunk) {
                Ok(0) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed",
                    )))
                }
                Ok(n) => self.feed(&chunk[..n]),
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    return Ok(None)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Parse one frame from the front of `buf`; `None` if incomplete.
fn parse_frame(buf: &[u8]) -> Result<Option<(RelayFrame, usize)>> {
    let mut cursor = buf;
    let Some(kind) = take_i32(&mut cursor) else {
        return Ok(None);
    };
    let Some(name) = take_bytes(&mut cursor, MAX_NAME_LEN, "channel")? else {
        return Ok(None);
    };
    let name = String::from_utf8(name.to_vec())
        .map_err(|_| Error::Protocol("channel is not valid UTF-8".to_string()))?;

    let frame = match kind {
        MSG_PUBLISH => {
            let Some(data) = take_bytes(&mut cursor, MAX_MESSAGE_SIZE, "data")? else {
                return Ok(None);
            };
            RelayFrame::Publish {
                channel: name,
                data: data.to_vec(),
            }
        }
        MSG_SUBSCRIBE => RelayFrame::Subscribe(name),
        MSG_UNSUBSCRIBE => RelayFrame::Unsubscribe(name),
        other => return Err(Error::Protocol(format!("unknown message type {}", other))),
    };
    Ok(Some((frame, buf.len() - cursor.len())))
}

fn take_i32(cursor: &mut &[u8]) -> Option<i32> {
    cursor.read_i32::<BigEndian>().ok()
}

fn take_bytes<'a>(cursor: &mut &'a [u8], max: usize, what: &str) -> Result<Option<&'a [u8]>> {
    let Some(len) = take_i32(cursor) else {
        return Ok(None);
    };
    if len < 0 || len as usize > max {
        return Err(Error::Protocol(format!("invalid {} length {}", what, len)));
    }
    let len = len as usize;
    if cursor.len() < len {
        return Ok(None);
    }
    let current: &'a [u8] = *cursor;
    let (bytes, rest) = current.split_at(len);
    *cursor = rest;
    Ok(Some(bytes))
}
