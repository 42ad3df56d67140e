// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process loopback provider (`memq://`).
//!
//! Published messages are queued and delivered back into the same bus by
//! the provider's thread, so publishers never run subscriber callbacks.

use crate::bus::dispatch::MessageSink;
use crate::config::RECV_POLL_TIMEOUT;
use crate::error::Result;
use crate::message::ReceivedMessage;
use crate::transport::frame::validate_channel;
use crate::transport::{join_worker, spawn_worker, Provider};
use crate::url::LcmUrl;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

pub struct MemqProvider {
    url: LcmUrl,
    tx: Sender<ReceivedMessage>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MemqProvider {
    pub fn new(url: &LcmUrl, sink: Arc<dyn MessageSink>) -> Result<Self> {
        let (tx, rx) = channel::unbounded::<ReceivedMessage>();
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let worker = spawn_worker("lcm-memq", move || {
            while !worker_stop.load(Ordering::Acquire) {
                match rx.recv_timeout(RECV_POLL_TIMEOUT) {
                    Ok(msg) => sink.deliver(msg),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;
        Ok(Self {
            url: url.clone(),
            tx,
            stop,
            worker: Mutex::new(Some(worker)),
        })
    }
}

impl Provider for MemqProvider {
    fn publish(&self, channel: &str, data: &[u8]) -> Result<()> {
        validate_channel(channel)?;
        if self.stop.load(Ordering::Acquire) {
            return Ok(());
        }
        let msg = ReceivedMessage::new(channel, data.to_vec());
        if self.tx.send(msg).is_err() {
            tracing::debug!("[MEMQ] queue closed, dropping message on {}", channel);
        }
        Ok(())
    }

    fn close(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        join_worker(self.worker.lock().take(), "memq");
    }

    fn url(&self) -> &LcmUrl {
        &self.url
    }
}

impl Drop for MemqProvider {
    fn drop(&mut self) {
        self.close();
    }
}
