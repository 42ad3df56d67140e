// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport providers.
//!
//! Each provider owns one socket or file and a background thread that
//! delivers complete messages to a [`MessageSink`].
//!
//! # Modules
//!
//! - `frame` - datagram framing and fragment reassembly
//! - `multicast` - multicast socket setup
//! - `udpm` - UDP multicast provider (`udpm://`)
//! - `tcpq` - TCP relay client provider (`tcpq://`) and its stream codec
//! - `file` - event log replay and recording provider (`file://`)
//! - `memq` - in-process loopback provider (`memq://`)

/// Event log replay and recording.
pub mod file;
/// Datagram framing and reassembly.
pub mod frame;
/// In-process loopback queue.
pub mod memq;
/// Multicast socket setup.
pub mod multicast;
/// TCP relay protocol and client provider.
pub mod tcpq;
/// UDP multicast provider.
pub mod udpm;

use crate::bus::dispatch::MessageSink;
use crate::error::{Error, Result};
use crate::url::LcmUrl;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A transport backend behind an [`crate::Lcm`].
///
/// `publish` logs transient I/O failures and returns `Ok`; only errors that
/// concern the message itself are returned. `subscribe` and `unsubscribe`
/// are hints for providers that can filter remotely.
pub trait Provider: Send + Sync {
    fn publish(&self, channel: &str, data: &[u8]) -> Result<()>;

    fn subscribe(&self, _pattern: &str) -> Result<()> {
        Ok(())
    }

    fn unsubscribe(&self, _pattern: &str) -> Result<()> {
        Ok(())
    }

    /// Whether a finite input (a replayed log) has been fully delivered.
    fn is_finished(&self) -> bool {
        false
    }

    /// Stop the background thread and release resources. Idempotent.
    fn close(&self);

    fn url(&self) -> &LcmUrl;
}

/// Instantiate the provider registered for `url`'s scheme.
pub fn create_provider(url: &LcmUrl, sink: Arc<dyn MessageSink>) -> Result<Box<dyn Provider>> {
    match url.scheme() {
        "udpm" => Ok(Box::new(udpm::UdpmProvider::new(url, sink)?)),
        "tcpq" => Ok(Box::new(tcpq::TcpqProvider::new(url, sink)?)),
        "file" => Ok(Box::new(file::FileProvider::new(url, sink)?)),
        "memq" => Ok(Box::new(memq::MemqProvider::new(url, sink)?)),
        other => Err(Error::UnknownScheme(other.to_string())),
    }
}

// ===== Background thread helpers =====

/// Stop flag that also interrupts sleeps.
#[derive(Default)]
pub(crate) struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn stop(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep for `dur` unless stopped first; returns `true` if stopped.
    ///
    /// A `dur` too large to represent as a deadline waits until stopped.
    pub(crate) fn sleep(&self, dur: Duration) -> bool {
        let deadline = Instant::now().checked_add(dur);
        let mut stopped = self.stopped.lock();
        while !*stopped {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut stopped, deadline).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut stopped),
            }
        }
        *stopped
    }
}

/// Spawn a named provider thread.
pub(crate) fn spawn_worker<F>(name: &str, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    Ok(thread::Builder::new().name(name.to_string()).spawn(body)?)
}

/// Join a provider thread unless called from that thread.
pub(crate) fn join_worker(handle: Option<JoinHandle<()>>, name: &str) {
    let Some(handle) = handle else {
        return;
    };
    if handle.thread().id() == thread::current().id() {
        tracing::debug!("{} closed from its own thread, not joining", name);
        return;
    }
    if handle.join().is_err() {
        tracing::error!("{} thread panicked", name);
    }
}
