// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One relay client connection.

use super::{ClientStats, HubShared};
use crate::bus::registry::compile_pattern;
use crate::config::{RECV_POLL_TIMEOUT, TCPQ_MAGIC_CLIENT, TCPQ_MAGIC_SERVER};
use crate::error::Result;
use crate::transport::tcpq::codec::{
    encode_publish, read_handshake, write_handshake, RelayDecoder, RelayFrame,
};
use parking_lot::Mutex;
use regex::Regex;
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connected client as seen by the relay path.
pub(super) struct HubClient {
    pub(super) id: u64,
    pub(super) peer: SocketAddr,
    writer: Mutex<TcpStream>,
    /// In subscription order; duplicates allowed.
    patterns: Mutex<Vec<(String, Regex)>>,
    published: AtomicU64,
    delivered: AtomicU64,
}

impl HubClient {
    pub(super) fn stats(&self) -> ClientStats {
        ClientStats {
            id: self.id,
            peer: self.peer,
            subscriptions: self.patterns.lock().iter().map(|(p, _)| p.clone()).collect(),
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
        }
    }

    fn matches(&self, channel: &str) -> bool {
        self.patterns
            .lock()
            .iter()
            .any(|(_, regex)| regex.is_match(channel))
    }

    /// Write a pre-encoded publish frame; a failed write ends the client.
    fn send(&self, frame: &[u8]) -> bool {
        let mut writer = self.writer.lock();
        match writer.write_all(frame) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                tracing::debug!("[HUB] write to client {} ({}) failed: {}", self.id, self.peer, e);
                let _ = writer.shutdown(Shutdown::Both);
                false
            }
        }
    }

    pub(super) fn shutdown(&self) {
        let _ = self.writer.lock().shutdown(Shutdown::Both);
    }
}

/// Serve one connection until it closes or the hub stops.
pub(super) fn serve(shared: &HubShared, mut stream: TcpStream, peer: SocketAddr) {
    let client = match handshake(shared, &mut stream, peer) {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!("[HUB] rejecting {}: {}", peer, e);
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    };
    shared.register(Arc::clone(&client));
    tracing::info!("[HUB] client {} connected from {}", client.id, peer);

    let mut decoder = RelayDecoder::new();
    while !shared.stop.load(Ordering::Acquire) {
        match decoder.decode(&mut stream) {
            Ok(Some(RelayFrame::Subscribe(pattern))) => match compile_pattern(&pattern) {
                Ok(regex) => client.patterns.lock().push((pattern, regex)),
                Err(e) => tracing::warn!("[HUB] client {}: {}", client.id, e),
            },
            Ok(Some(RelayFrame::Unsubscribe(pattern))) => {
                let mut patterns = client.patterns.lock();
                if let Some(idx) = patterns.iter().position(|(p, _)| *p == pattern) {
                    patterns.remove(idx);
                }
            }
            Ok(Some(RelayFrame::Publish { channel, data })) => {
                relay(shared, &client, &channel, &data);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!("[HUB] client {} read ended: {}", client.id, e);
                break;
            }
        }
    }

    shared.unregister(client.id);
    client.shutdown();
    tracing::info!("[HUB] client {} ({}) disconnected", client.id, peer);
}

fn handshake(shared: &HubShared, stream: &mut TcpStream, peer: SocketAddr) -> Result<Arc<HubClient>> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    read_handshake(stream, TCPQ_MAGIC_CLIENT)?;
    write_handshake(stream, TCPQ_MAGIC_SERVER)?;
    stream.set_read_timeout(Some(RECV_POLL_TIMEOUT))?;

    Ok(Arc::new(HubClient {
        id: shared.next_client_id.fetch_add(1, Ordering::Relaxed),
        peer,
        writer: Mutex::new(stream.try_clone()?),
        patterns: Mutex::new(Vec::new()),
        published: AtomicU64::new(0),
        delivered: AtomicU64::new(0),
    }))
}

/// Forward a publish to every interested client, once each.
fn relay(shared: &HubShared, sender: &HubClient, channel: &str, data: &[u8]) {
    sender.published.fetch_add(1, Ordering::Relaxed);
    let frame = encode_publish(channel, data);
    let mut delivered = 0u64;
    for client in shared.snapshot() {
        if client.id == sender.id && !shared.config.echo_to_sender {
            continue;
        }
        if client.matches(channel) && client.send(&frame) {
            delivered += 1;
        }
    }
    shared.stats.record_publish(delivered, frame.len() as u64);
}
