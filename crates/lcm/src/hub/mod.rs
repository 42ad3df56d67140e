// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP relay hub for `tcpq://` clients.
//!
//! Each client connection gets its own thread and its own pattern list.
//! A publish from one client is written synchronously to every other
//! client with at least one matching pattern (O(clients x patterns) per
//! message). With [`HubConfig::echo_to_sender`] the publisher also gets
//! its own messages back.
//!
//! # Example
//!
//! ```no_run
//! use lcm::hub::{HubConfig, TcpHub};
//!
//! let hub = TcpHub::bind(HubConfig::default())?.spawn()?;
//! println!("relay on {}", hub.local_addr());
//! hub.shutdown();
//! # Ok::<(), lcm::Error>(())
//! ```

mod client;

use crate::config::TCPQ_DEFAULT_PORT;
use crate::error::Result;
use client::HubClient;
use parking_lot::RwLock;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Accept loop poll interval.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Hub configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Address to bind to (default: 0.0.0.0)
    pub bind_address: IpAddr,
    /// TCP port to listen on (default: 7700, 0 = ephemeral)
    pub port: u16,
    /// Relay publishes back to the client that sent them.
    pub echo_to_sender: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: TCPQ_DEFAULT_PORT,
            echo_to_sender: false,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    /// Clients currently connected.
    pub clients: u64,
    /// Publishes received from clients.
    pub messages_received: u64,
    /// Publish frames written to clients.
    pub messages_relayed: u64,
    /// Bytes written to clients.
    pub bytes_relayed: u64,
}

/// Snapshot of one connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStats {
    pub id: u64,
    pub peer: SocketAddr,
    /// Patterns in subscription order.
    pub subscriptions: Vec<String>,
    /// Publishes received from this client.
    pub published: u64,
    /// Publish frames written to this client.
    pub delivered: u64,
}

#[derive(Default)]
struct StatCounters {
    messages_received: AtomicU64,
    messages_relayed: AtomicU64,
    bytes_relayed: AtomicU64,
}

impl StatCounters {
    fn record_publish(&self, deliveries: u64, frame_len: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.messages_relayed.fetch_add(deliveries, Ordering::Relaxed);
        self.bytes_relayed
            .fetch_add(deliveries * frame_len, Ordering::Relaxed);
    }
}

/// State shared by the accept loop and client threads.
struct HubShared {
    config: HubConfig,
    clients: RwLock<Vec<Arc<HubClient>>>,
    next_client_id: AtomicU64,
    stop: AtomicBool,
    stats: StatCounters,
}

impl HubShared {
    fn register(&self, client: Arc<HubClient>) {
        self.clients.write().push(client);
    }

    fn unregister(&self, id: u64) {
        self.clients.write().retain(|c| c.id != id);
    }

    fn snapshot(&self) -> Vec<Arc<HubClient>> {
        self.clients.read().clone()
    }

    fn client_stats(&self) -> Vec<ClientStats> {
        self.clients.read().iter().map(|c| c.stats()).collect()
    }

    fn stats(&self) -> HubStats {
        HubStats {
            clients: self.clients.read().len() as u64,
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
            messages_relayed: self.stats.messages_relayed.load(Ordering::Relaxed),
            bytes_relayed: self.stats.bytes_relayed.load(Ordering::Relaxed),
        }
    }
}

/// A bound, not yet running, relay hub.
pub struct TcpHub {
    listener: TcpListener,
    shared: Arc<HubShared>,
}

impl TcpHub {
    pub fn bind(config: HubConfig) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(config.bind_address, config.port))?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            shared: Arc::new(HubShared {
                config,
                clients: RwLock::new(Vec::new()),
                next_client_id: AtomicU64::new(1),
                stop: AtomicBool::new(false),
                stats: StatCounters::default(),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> HubStats {
        self.shared.stats()
    }

    /// Serve on the calling thread forever.
    pub fn run(self) -> Result<()> {
        self.run_until(&AtomicBool::new(false))
    }

    /// Serve on the calling thread until `stop` is set.
    pub fn run_until(self, stop: &AtomicBool) -> Result<()> {
        tracing::info!("[HUB] listening on {}", self.local_addr()?);
        let hub_stop = &self.shared.stop;
        accept_loop(&self.listener, &self.shared, || {
            stop.load(Ordering::Acquire) || hub_stop.load(Ordering::Acquire)
        });
        Ok(())
    }

    /// Serve on a background thread.
    pub fn spawn(self) -> Result<HubHandle> {
        let addr = self.local_addr()?;
        let shared = Arc::clone(&self.shared);
        tracing::info!("[HUB] listening on {}", addr);
        let thread = thread::Builder::new()
            .name("lcm-hub-accept".to_string())
            .spawn(move || {
                let stop = &self.shared.stop;
                accept_loop(&self.listener, &self.shared, || stop.load(Ordering::Acquire));
            })?;
        Ok(HubHandle {
            addr,
            shared,
            thread: Some(thread),
        })
    }
}

/// Running hub; stops on [`HubHandle::shutdown`] or drop.
pub struct HubHandle {
    addr: SocketAddr,
    shared: Arc<HubShared>,
    thread: Option<JoinHandle<()>>,
}

impl HubHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stats(&self) -> HubStats {
        self.shared.stats()
    }

    /// Per-client snapshot, in connection order.
    pub fn clients(&self) -> Vec<ClientStats> {
        self.shared.client_stats()
    }

    /// Disconnect every client and stop accepting.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("[HUB] accept thread panicked");
            }
        }
    }
}

impl Drop for HubHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop<F>(listener: &TcpListener, shared: &Arc<HubShared>, should_stop: F)
where
    F: Fn() -> bool,
{
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    while !should_stop() {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    tracing::warn!("[HUB] cannot configure connection from {}: {}", peer, e);
                    continue;
                }
                let client_shared = Arc::clone(shared);
                let spawned = thread::Builder::new()
                    .name(format!("lcm-hub-{}", peer))
                    .spawn(move || client::serve(&client_shared, stream, peer));
                match spawned {
                    Ok(handle) => workers.push(handle),
                    Err(e) => tracing::error!("[HUB] cannot spawn client thread: {}", e),
                }
                workers.retain(|w| !w.is_finished());
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::warn!("[HUB] accept failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }

    shared.stop.store(true, Ordering::Release);
    for client in shared.snapshot() {
        client.shutdown();
    }
    for worker in workers {
        let _ = worker.join();
    }
    tracing::info!("[HUB] stopped");
}
