// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Datagram framing for LCM messages.
//!
//! # Short form
//!
//! ```text
//! +-----------+---------+------------------+------+---------+
//! | magic (4) | seq (4) | channel (var)    | 0x00 | payload |
//! +-----------+---------+------------------+------+---------+
//! ```
//!
//! # Long (fragmented) form
//!
//! ```text
//! +-----------+---------+-----------+-------------+-------------+-------------+
//! | magic (4) | seq (4) | total (4) | offset (4)  | frag_no (2) | count (2)   |
//! +-----------+---------+-----------+-------------+-------------+-------------+
//! | fragment 0 only: channel (var) | 0x00 |                                   |
//! +--------------------------------+------+-----------------------------------+
//! | payload chunk                                                             |
//! +---------------------------------------------------------------------------+
//! ```
//!
//! All integers are big-endian. A message uses the short form while
//! `channel + NUL + payload` fits in [`FRAGMENTATION_THRESHOLD`] bytes.
//!
//! Reassembly is keyed by sender address and assumes fragments from one
//! sender arrive in order. A fragment for another `(seq, total)` abandons the
//! open buffer; only fragment 0 may open a new one.

use crate::config::{
    FRAGMENTATION_THRESHOLD, MAGIC_LONG, MAGIC_SHORT, MAX_FRAGMENTS, MAX_MESSAGE_SIZE,
};
use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use std::collections::HashMap;
use std::net::SocketAddr;
use thiserror::Error;

/// Short-form header: magic + sequence number.
pub const SHORT_HEADER_SIZE: usize = 8;

/// Long-form header: magic, seq, total, offset, frag_no, count.
pub const LONG_HEADER_SIZE: usize = 20;

/// Why a datagram was rejected by the decoder.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("datagram truncated ({0} bytes)")]
    Truncated(usize),

    #[error("unknown magic {0:#010x}")]
    BadMagic(u32),

    #[error("channel name is not NUL-terminated")]
    MissingTerminator,

    #[error("channel name is not valid UTF-8")]
    InvalidChannel,

    #[error("invalid fragment header: {0}")]
    InvalidFragment(&'static str),
}

/// Fixed fields of a long-form datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub seq: u32,
    pub total_size: u32,
    pub offset: u32,
    pub frag_no: u16,
    pub frag_count: u16,
}

impl FragmentHeader {
    fn write(&self, out: &mut Vec<u8>) {
        let mut buf = [0u8; LONG_HEADER_SIZE];
        BigEndian::write_u32(&mut buf[0..4], MAGIC_LONG);
        BigEndian::write_u32(&mut buf[4..8], self.seq);
        BigEndian::write_u32(&mut buf[8..12], self.total_size);
        BigEndian::write_u32(&mut buf[12..16], self.offset);
        BigEndian::write_u16(&mut buf[16..18], self.frag_no);
        BigEndian::write_u16(&mut buf[18..20], self.frag_count);
        out.extend_from_slice(&buf);
    }

    fn read(buf: &[u8]) -> std::result::Result<Self, FrameError> {
        if buf.len() < LONG_HEADER_SIZE {
            return Err(FrameError::Truncated(buf.len()));
        }
        Ok(Self {
            seq: BigEndian::read_u32(&buf[4..8]),
            total_size: BigEndian::read_u32(&buf[8..12]),
            offset: BigEndian::read_u32(&buf[12..16]),
            frag_no: BigEndian::read_u16(&buf[16..18]),
            frag_count: BigEndian::read_u16(&buf[18..20]),
        })
    }
}

/// One decoded datagram, borrowing from the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    Short {
        seq: u32,
        channel: &'a str,
        payload: &'a [u8],
    },
    Fragment {
        header: FragmentHeader,
        /// Present on fragment 0 only.
        channel: Option<&'a str>,
        data: &'a [u8],
    },
}

// ===== Encoding =====

/// Number of datagrams needed for a message.
pub fn fragment_count(channel_len: usize, payload_len: usize) -> usize {
    let size = channel_len + 1 + payload_len;
    if size <= FRAGMENTATION_THRESHOLD {
        1
    } else {
        size.div_ceil(FRAGMENTATION_THRESHOLD)
    }
}

/// Encode a message into one short datagram or a run of fragments.
///
/// Fails when the channel cannot be framed or the message would need more
/// than [`MAX_FRAGMENTS`] fragments.
pub fn encode_message(channel: &str, payload: &[u8], seq: u32) -> Result<Vec<Vec<u8>>> {
    validate_channel(channel)?;
    let channel = channel.as_bytes();

    let count = fragment_count(channel.len(), payload.len());
    if count == 1 {
        let mut buf = Vec::with_capacity(SHORT_HEADER_SIZE + channel.len() + 1 + payload.len());
        buf.extend_from_slice(&MAGIC_SHORT.to_be_bytes());
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(channel);
        buf.push(0);
        buf.extend_from_slice(payload);
        return Ok(vec![buf]);
    }
    if count > MAX_FRAGMENTS || payload.len() > u32::MAX as usize {
        return Err(Error::MessageTooLarge { fragments: count });
    }

    let mut datagrams = Vec::with_capacity(count);
    let first_len = FRAGMENTATION_THRESHOLD - (channel.len() + 1);
    let mut offset = 0usize;
    for frag_no in 0..count {
        let chunk_len = if frag_no == 0 {
            first_len
        } else {
            (payload.len() - offset).min(FRAGMENTATION_THRESHOLD)
        };
        let header = FragmentHeader {
            seq,
            total_size: payload.len() as u32,
            offset: offset as u32,
            frag_no: frag_no as u16,
            frag_count: count as u16,
        };
        let mut buf = Vec::with_capacity(LONG_HEADER_SIZE + FRAGMENTATION_THRESHOLD);
        header.write(&mut buf);
        if frag_no == 0 {
            buf.extend_from_slice(channel);
            buf.push(0);
        }
        buf.extend_from_slice(&payload[offset..offset + chunk_len]);
        datagrams.push(buf);
        offset += chunk_len;
    }
    debug_assert_eq!(offset, payload.len());
    Ok(datagrams)
}

/// Reject channels that cannot be framed.
pub fn validate_channel(channel: &str) -> Result<()> {
    if channel.is_empty()
        || channel.as_bytes().contains(&0)
        || channel.len() + 1 >= FRAGMENTATION_THRESHOLD
    {
        return Err(Error::InvalidChannel(channel.to_string()));
    }
    Ok(())
}

// ===== Decoding =====

/// Decode a single datagram without reassembly.
pub fn decode_datagram(buf: &[u8]) -> std::result::Result<Frame<'_>, FrameError> {
    if buf.len() < SHORT_HEADER_SIZE {
        return Err(FrameError::Truncated(buf.len()));
    }
    match BigEndian::read_u32(&buf[0..4]) {
        MAGIC_SHORT => {
            let seq = BigEndian::read_u32(&buf[4..8]);
            let (channel, payload) = split_channel(&buf[SHORT_HEADER_SIZE..])?;
            Ok(Frame::Short {
                seq,
                channel,
                payload,
            })
        }
        MAGIC_LONG => {
            let header = FragmentHeader::read(buf)?;
            if header.frag_count == 0 || header.frag_no >= header.frag_count {
                return Err(FrameError::InvalidFragment("fragment index out of range"));
            }
            let body = &buf[LONG_HEADER_SIZE..];
            if header.frag_no == 0 {
                if header.offset != 0 {
                    return Err(FrameError::InvalidFragment("first fragment has nonzero offset"));
                }
                let (channel, data) = split_channel(body)?;
                Ok(Frame::Fragment {
                    header,
                    channel: Some(channel),
                    data,
                })
            } else {
                Ok(Frame::Fragment {
                    header,
                    channel: None,
                    data: body,
                })
            }
        }
        other => Err(FrameError::BadMagic(other)),
    }
}

fn split_channel(buf: &[u8]) -> std::result::Result<(&str, &[u8]), FrameError> {
    let nul = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(FrameError::MissingTerminator)?;
    let channel = std::str::from_utf8(&buf[..nul]).map_err(|_| FrameError::InvalidChannel)?;
    Ok((channel, &buf[nul + 1..]))
}

// ===== Reassembly =====

/// A fully received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Reassembler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblerStats {
    /// Datagrams handed to the reassembler.
    pub datagrams: u64,
    /// Messages delivered (short or reassembled).
    pub completed: u64,
    /// Datagrams rejected by the decoder.
    pub malformed: u64,
    /// Open buffers dropped by a fragment from another message.
    pub abandoned: u64,
    /// Fragments with no open buffer to land in.
    pub orphaned: u64,
    /// Fragments already received for the open buffer.
    pub duplicates: u64,
}

struct PendingMessage {
    seq: u32,
    total_size: u32,
    frag_count: u16,
    channel: String,
    data: Vec<u8>,
    received: Vec<bool>,
    remaining: u16,
}

/// Per-sender fragment reassembly.
///
/// Owned by a single receive thread; not synchronized.
pub struct Reassembler {
    pending: HashMap<SocketAddr, PendingMessage>,
    max_message_size: usize,
    stats: ReassemblerStats,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_max_message_size(MAX_MESSAGE_SIZE)
    }

    /// Reject fragmented messages announcing more than `max` bytes.
    pub fn with_max_message_size(max: usize) -> Self {
        Self {
            pending: HashMap::new(),
            max_message_size: max,
            stats: ReassemblerStats::default(),
        }
    }

    pub fn stats(&self) -> ReassemblerStats {
        self.stats
    }

    /// Number of senders with a partially received message.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Feed one datagram; returns a message when one completes.
    pub fn on_datagram(&mut self, from: SocketAddr, buf: &[u8]) -> Option<CompleteMessage> {
        self.stats.datagrams += 1;
        let frame = match decode_datagram(buf) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.malformed += 1;
                tracing::debug!("dropping datagram from {}: {}", from, e);
                return None;
            }
        };

        match frame {
            Frame::Short {
                channel, payload, ..
            } => {
                self.stats.completed += 1;
                Some(CompleteMessage {
                    channel: channel.to_string(),
                    payload: payload.to_vec(),
                })
            }
            Frame::Fragment {
                header,
                channel,
                data,
            } => self.on_fragment(from, header, channel, data),
        }
    }

    fn on_fragment(
        &mut self,
        from: SocketAddr,
        header: FragmentHeader,
        channel: Option<&str>,
        data: &[u8],
    ) -> Option<CompleteMessage> {
        let stale = self.pending.get(&from).is_some_and(|p| {
            p.seq != header.seq
                || p.total_size != header.total_size
                || p.frag_count != header.frag_count
        });
        if stale {
            self.pending.remove(&from);
            self.stats.abandoned += 1;
            tracing::debug!(
                "abandoning partial message from {} (new seq={})",
                from,
                header.seq
            );
        }

        if !self.pending.contains_key(&from) {
            let Some(channel) = channel else {
                self.stats.orphaned += 1;
                return None;
            };
            if header.total_size as usize > self.max_message_size {
                self.stats.malformed += 1;
                tracing::debug!(
                    "dropping {}-byte fragmented message from {}: exceeds limit",
                    header.total_size,
                    from
                );
                return None;
            }
            self.pending.insert(
                from,
                PendingMessage {
                    seq: header.seq,
                    total_size: header.total_size,
                    frag_count: header.frag_count,
                    channel: channel.to_string(),
                    data: vec![0u8; header.total_size as usize],
                    received: vec![false; header.frag_count as usize],
                    remaining: header.frag_count,
                },
            );
        }

        let pending = self.pending.get_mut(&from)?;
        let start = header.offset as usize;
        let end = start + data.len();
        if end > pending.data.len() {
            self.pending.remove(&from);
            self.stats.malformed += 1;
            tracing::debug!("dropping fragment from {}: out of bounds", from);
            return None;
        }

        let idx = header.frag_no as usize;
        if pending.received[idx] {
            self.stats.duplicates += 1;
            return None;
        }
        pending.received[idx] = true;
        pending.data[start..end].copy_from_slice(data);
        pending.remaining -= 1;

        if pending.remaining > 0 {
            return None;
        }
        let done = self.pending.remove(&from)?;
        self.stats.completed += 1;
        Some(CompleteMessage {
            channel: done.channel,
            payload: done.data,
        })
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}
