// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP multicast provider (`udpm://group:port?ttl=N&recv_buf_size=B`).
//!
//! Every process on the group receives all traffic; channel filtering
//! happens in the registry. The receive socket and thread are created on
//! the first subscription, so publish-only processes never join the group.

use crate::bus::dispatch::MessageSink;
use crate::config::{MAX_DATAGRAM_SIZE, RECV_POLL_TIMEOUT, UDPM_DEFAULT_NETWORK};
use crate::error::{Error, Result};
use crate::message::ReceivedMessage;
use crate::transport::frame::{encode_message, Reassembler};
use crate::transport::multicast::{open_recv_socket, open_send_socket};
use crate::transport::{join_worker, spawn_worker, Provider};
use crate::url::LcmUrl;
use parking_lot::Mutex;
use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Options read from a `udpm://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpmOptions {
    pub group: SocketAddrV4,
    pub ttl: u32,
    pub recv_buf_size: Option<usize>,
}

impl UdpmOptions {
    pub fn from_url(url: &LcmUrl) -> Result<Self> {
        let network = url.get_str("network", UDPM_DEFAULT_NETWORK);
        let group: SocketAddrV4 = network.parse().map_err(|_| Error::InvalidParam {
            key: "network".to_string(),
            value: network.clone(),
        })?;
        if !group.ip().is_multicast() {
            return Err(Error::InvalidParam {
                key: "network".to_string(),
                value: network,
            });
        }

        let ttl = url.get_int("ttl", 0)?;
        if !(0..=255).contains(&ttl) {
            return Err(Error::InvalidParam {
                key: "ttl".to_string(),
                value: ttl.to_string(),
            });
        }

        let recv_buf_size = match url.get_int("recv_buf_size", 0)? {
            n if n > 0 => Some(n as usize),
            0 => None,
            n => {
                return Err(Error::InvalidParam {
                    key: "recv_buf_size".to_string(),
                    value: n.to_string(),
                })
            }
        };

        Ok(Self {
            group,
            ttl: ttl as u32,
            recv_buf_size,
        })
    }
}

/// UDP multicast transport.
pub struct UdpmProvider {
    url: LcmUrl,
    options: UdpmOptions,
    sink: Arc<dyn MessageSink>,
    send_socket: UdpSocket,
    /// Keeps the fragments of one message contiguous on the wire.
    tx_lock: Mutex<()>,
    seq: AtomicU32,
    reader: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl UdpmProvider {
    pub fn new(url: &LcmUrl, sink: Arc<dyn MessageSink>) -> Result<Self> {
        let options = UdpmOptions::from_url(url)?;
        let send_socket = open_send_socket(options.ttl)?;
        tracing::debug!(
            "[UDPM] provider for {} ttl={} recv_buf_size={:?}",
            options.group,
            options.ttl,
            options.recv_buf_size
        );
        Ok(Self {
            url: url.clone(),
            options,
            sink,
            send_socket,
            tx_lock: Mutex::new(()),
            seq: AtomicU32::new(0),
            reader: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &UdpmOptions {
        &self.options
    }

    fn ensure_reader(&self) -> Result<()> {
        let mut reader = self.reader.lock();
        if reader.is_some() || self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let socket = open_recv_socket(
            self.options.group,
            self.options.recv_buf_size,
            RECV_POLL_TIMEOUT,
        )?;
        let sink = Arc::clone(&self.sink);
        let stop = Arc::clone(&self.stop);
        *reader = Some(spawn_worker("lcm-udpm-recv", move || {
            receive_loop(&socket, sink.as_ref(), &stop)
        })?);
        Ok(())
    }
}

impl Provider for UdpmProvider {
    fn publish(&self, channel: &str, data: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let datagrams = encode_message(channel, data, seq)?;
        let dest = SocketAddr::V4(self.options.group);

        let _guard = self.tx_lock.lock();
        for (i, datagram) in datagrams.iter().enumerate() {
            if let Err(e) = self.send_socket.send_to(datagram, dest) {
                tracing::warn!(
                    "[UDPM] send to {} failed (channel={} fragment {}/{}): {}",
                    dest,
                    channel,
                    i + 1,
                    datagrams.len(),
                    e
                );
                break;
            }
        }
        Ok(())
    }

    fn subscribe(&self, _pattern: &str) -> Result<()> {
        self.ensure_reader()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop.store(true, Ordering::Release);
        join_worker(self.reader.lock().take(), "udpm receive");
    }

    fn url(&self) -> &LcmUrl {
        &self.url
    }
}

impl Drop for UdpmProvider {
    fn drop(&mut self) {
        self.close();
    }
}

fn receive_loop(socket: &UdpSocket, sink: &dyn MessageSink, stop: &AtomicBool) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut reassembler = Reassembler::new();
    tracing::debug!("[UDPM] receive thread started");

    while !stop.load(Ordering::Acquire) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!("[UDPM] recv failed: {}", e);
                std::thread::sleep(RECV_POLL_TIMEOUT);
                continue;
            }
        };
        if let Some(msg) = reassembler.on_datagram(from, &buf[..len]) {
            sink.deliver(ReceivedMessage::new(msg.channel, msg.payload));
        }
    }

    let stats = reassembler.stats();
    tracing::debug!(
        "[UDPM] receive thread stopped: datagrams={} completed={} malformed={} abandoned={} orphaned={} duplicates={}",
        stats.datagrams,
        stats.completed,
        stats.malformed,
        stats.abandoned,
        stats.orphaned,
        stats.duplicates
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let url = LcmUrl::parse("udpm://").expect("url");
        let opts = UdpmOptions::from_url(&url).expect("options");
        assert_eq!(opts.group.to_string(), "239.255.76.67:7667");
        assert_eq!(opts.ttl, 0);
        assert_eq!(opts.recv_buf_size, None);
    }

    #[test]
    fn test_options_from_query() {
        let url = LcmUrl::parse("udpm://239.1.2.3:9000?ttl=2&recv_buf_size=1048576")
            .expect("url");
        let opts = UdpmOptions::from_url(&url).expect("options");
        assert_eq!(opts.group.port(), 9000);
        assert_eq!(opts.ttl, 2);
        assert_eq!(opts.recv_buf_size, Some(1_048_576));
    }

    #[test]
    fn test_options_reject_unicast_group() {
        let url = LcmUrl::parse("udpm://10.0.0.1:7667").expect("url");
        assert!(matches!(
            UdpmOptions::from_url(&url),
            Err(Error::InvalidParam { .. })
        ));
    }

    #[test]
    fn test_options_reject_bad_ttl() {
        let url = LcmUrl::parse("udpm://239.255.76.67:7667?ttl=300").expect("url");
        assert!(matches!(
            UdpmOptions::from_url(&url),
            Err(Error::InvalidParam { key, .. }) if key == "ttl"
        ));
    }
}
