// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay client with automatic reconnect.
//!
//! One thread owns the connection: connect, handshake, replay every
//! subscription, then read until the connection drops, wait
//! [`TCPQ_RECONNECT_BACKOFF`] and start over. Publishes while disconnected
//! are dropped.
//!
//! Lock order is `subscriptions` then `writer`, so a subscription added
//! during a reconnect is either replayed or sent, never both or neither.

use super::codec::{encode_publish, read_handshake, write_handshake, RelayDecoder, RelayFrame};
use crate::bus::dispatch::MessageSink;
use crate::config::{
    RECV_POLL_TIMEOUT, TCPQ_DEFAULT_NETWORK, TCPQ_DEFAULT_PORT, TCPQ_MAGIC_CLIENT,
    TCPQ_MAGIC_SERVER, TCPQ_RECONNECT_BACKOFF, TCPQ_VERSION,
};
use crate::error::{Error, Result};
use crate::message::ReceivedMessage;
use crate::transport::{join_worker, spawn_worker, Provider, StopSignal};
use crate::url::LcmUrl;
use parking_lot::Mutex;
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Options read from a `tcpq://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpqOptions {
    /// `host:port` of the hub.
    pub server: String,
}

impl TcpqOptions {
    pub fn from_url(url: &LcmUrl) -> Result<Self> {
        let network = url.get_str("network", TCPQ_DEFAULT_NETWORK);
        let server = match network.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                port.parse::<u16>().map_err(|_| Error::InvalidParam {
                    key: "network".to_string(),
                    value: network.clone(),
                })?;
                network
            }
            Some(_) => {
                return Err(Error::InvalidParam {
                    key: "network".to_string(),
                    value: network,
                })
            }
            None => format!("{}:{}", network, TCPQ_DEFAULT_PORT),
        };
        Ok(Self { server })
    }
}

struct Shared {
    server: String,
    sink: Arc<dyn MessageSink>,
    /// Multiset of patterns, replayed on every connect.
    subscriptions: Mutex<Vec<String>>,
    /// Write half of the live connection.
    writer: Mutex<Option<TcpStream>>,
    stop: StopSignal,
}

impl Shared {
    fn send(&self, bytes: &[u8]) {
        let mut writer = self.writer.lock();
        let Some(stream) = writer.as_mut() else {
            tracing::trace!("[TCPQ] not connected, dropping {} bytes", bytes.len());
            return;
        };
        if let Err(e) = stream.write_all(bytes) {
            tracing::warn!("[TCPQ] write to {} failed: {}", self.server, e);
            let _ = stream.shutdown(Shutdown::Both);
            *writer = None;
        }
    }

    fn disconnect(&self) {
        if let Some(stream) = self.writer.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// TCP relay client.
pub struct TcpqProvider {
    url: LcmUrl,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TcpqProvider {
    pub fn new(url: &LcmUrl, sink: Arc<dyn MessageSink>) -> Result<Self> {
        let options = TcpqOptions::from_url(url)?;
        let shared = Arc::new(Shared {
            server: options.server,
            sink,
            subscriptions: Mutex::new(Vec::new()),
            writer: Mutex::new(None),
            stop: StopSignal::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = spawn_worker("lcm-tcpq", move || connection_loop(&worker_shared))?;
        Ok(Self {
            url: url.clone(),
            shared,
            worker: Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
        })
    }

    /// Whether a hub connection is currently established.
    pub fn is_connected(&self) -> bool {
        self.shared.writer.lock().is_some()
    }
}

impl Provider for TcpqProvider {
    fn publish(&self, channel: &str, data: &[u8]) -> Result<()> {
        self.shared.send(&encode_publish(channel, data));
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> Result<()> {
        let mut subs = self.shared.subscriptions.lock();
        subs.push(pattern.to_string());
        self.shared
            .send(&RelayFrame::Subscribe(pattern.to_string()).encode());
        Ok(())
    }

    fn unsubscribe(&self, pattern: &str) -> Result<()> {
        let mut subs = self.shared.subscriptions.lock();
        if let Some(idx) = subs.iter().position(|p| p == pattern) {
            subs.remove(idx);
            self.shared
                .send(&RelayFrame::Unsubscribe(pattern.to_string()).encode());
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.stop.stop();
        self.shared.disconnect();
        join_worker(self.worker.lock().take(), "tcpq connection");
    }

    fn url(&self) -> &LcmUrl {
        &self.url
    }
}

impl Drop for TcpqProvider {
    fn drop(&mut self) {
        self.close();
    }
}

// ===== Connection thread =====

fn connection_loop(shared: &Shared) {
    let mut failures = 0u64;
    while !shared.stop.is_stopped() {
        match connect(shared) {
            Ok(stream) => {
                failures = 0;
                tracing::info!("[TCPQ] connected to hub {}", shared.server);
                read_loop(shared, stream);
                shared.disconnect();
                if !shared.stop.is_stopped() {
                    tracing::warn!("[TCPQ] lost connection to hub {}", shared.server);
                }
            }
            Err(_) if shared.stop.is_stopped() => break,
            Err(e) => {
                failures += 1;
                if failures == 1 {
                    tracing::warn!("[TCPQ] cannot connect to hub {}: {}", shared.server, e);
                } else {
                    tracing::debug!("[TCPQ] reconnect attempt {} failed: {}", failures, e);
                }
            }
        }
        if shared.stop.sleep(TCPQ_RECONNECT_BACKOFF) {
            break;
        }
    }
    tracing::debug!("[TCPQ] connection thread stopped");
}

fn resolve(server: &str) -> Result<SocketAddr> {
    server
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Protocol(format!("{} did not resolve", server)))
}

/// Connect, handshake and replay subscriptions; returns the read half.
fn connect(shared: &Shared) -> Result<TcpStream> {
    let addr = resolve(&shared.server)?;
    let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;

    write_handshake(&mut stream, TCPQ_MAGIC_CLIENT)?;
    let version = read_handshake(&mut stream, TCPQ_MAGIC_SERVER)?;
    if version != TCPQ_VERSION {
        tracing::debug!(
            "[TCPQ] hub speaks version {:#06x}, ours is {:#06x}",
            version,
            TCPQ_VERSION
        );
    }
    stream.set_read_timeout(Some(RECV_POLL_TIMEOUT))?;

    let subs = shared.subscriptions.lock();
    let mut write_half = stream.try_clone()?;
    let mut replay = Vec::new();
    for pattern in subs.iter() {
        RelayFrame::Subscribe(pattern.clone()).encode_into(&mut replay);
    }
    write_half.write_all(&replay)?;
    *shared.writer.lock() = Some(write_half);
    drop(subs);

    if shared.stop.is_stopped() {
        shared.disconnect();
        return Err(Error::Closed);
    }
    Ok(stream)
}

fn read_loop(shared: &Shared, mut stream: TcpStream) {
    let mut decoder = RelayDecoder::new();
    while !shared.stop.is_stopped() {
        match decoder.decode(&mut stream) {
            Ok(Some(RelayFrame::Publish { channel, data })) => {
                shared.sink.deliver(ReceivedMessage::new(channel, data));
            }
            Ok(Some(other)) => {
                tracing::debug!("[TCPQ] ignoring unexpected frame from hub: {:?}", other);
            }
            Ok(None) => {}
            Err(e) => {
                if !shared.stop.is_stopped() {
                    tracing::debug!("[TCPQ] read from {} ended: {}", shared.server, e);
                }
                return;
            }
        }
    }
}
