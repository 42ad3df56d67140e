// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dispatch strategies between providers and the registry.
//!
//! Providers only see a [`MessageSink`]. The default sink is the
//! [`SubscriptionRegistry`] itself, which runs callbacks on the provider
//! thread. [`QueuedDispatcher`] hands messages to one worker thread instead,
//! so a slow subscriber delays delivery but not the receive loop.

use crate::bus::registry::SubscriptionRegistry;
use crate::message::ReceivedMessage;
use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Where providers deliver fully received messages.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, msg: ReceivedMessage);

    /// Live subscription count on the owning bus.
    fn num_subscriptions(&self) -> usize;
}

/// How an [`crate::Lcm`] runs subscriber callbacks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// On the provider's receive thread.
    #[default]
    Direct,
    /// On a dedicated thread fed by a bounded queue of this capacity.
    Queued(usize),
}

enum Command {
    Deliver(ReceivedMessage),
    Stop,
}

/// Single worker thread draining a bounded queue into the registry.
///
/// Providers block when the queue is full. Order across providers is the
/// order of enqueueing.
pub struct QueuedDispatcher {
    registry: Arc<SubscriptionRegistry>,
    tx: Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueuedDispatcher {
    pub fn spawn(registry: Arc<SubscriptionRegistry>, capacity: usize) -> std::io::Result<Self> {
        let (tx, rx) = channel::bounded::<Command>(capacity.max(1));
        let worker_registry = Arc::clone(&registry);
        let worker = thread::Builder::new()
            .name("lcm-dispatch".to_string())
            .spawn(move || {
                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        Command::Deliver(msg) => worker_registry.dispatch(&msg),
                        Command::Stop => break,
                    }
                }
                tracing::debug!("dispatch worker stopped");
            })?;
        Ok(Self {
            registry,
            tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Deliver what is already queued, then stop the worker.
    pub fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let _ = self.tx.send(Command::Stop);
        if worker.thread().id() != thread::current().id() && worker.join().is_err() {
            tracing::error!("dispatch worker panicked");
        }
    }
}

impl MessageSink for QueuedDispatcher {
    fn deliver(&self, msg: ReceivedMessage) {
        if self.tx.send(Command::Deliver(msg)).is_err() {
            tracing::debug!("dispatch queue closed, dropping message");
        }
    }

    fn num_subscriptions(&self) -> usize {
        self.registry.num_subscriptions()
    }
}

impl Drop for QueuedDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::registry::Subscriber;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_queued_delivery_runs_on_worker_thread() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let sub: Arc<dyn Subscriber> = Arc::new(move |msg: &ReceivedMessage| {
            let name = thread::current().name().map(str::to_string);
            let _ = tx.lock().send((msg.channel.clone(), name));
        });
        registry.subscribe(".*", sub).expect("subscribe");

        let dispatcher = QueuedDispatcher::spawn(Arc::clone(&registry), 8).expect("spawn");
        assert_eq!(MessageSink::num_subscriptions(&dispatcher), 1);
        dispatcher.deliver(ReceivedMessage::with_utime("A", vec![], 0));
        dispatcher.deliver(ReceivedMessage::with_utime("B", vec![], 0));

        let first = rx.recv_timeout(Duration::from_secs(2)).expect("first");
        let second = rx.recv_timeout(Duration::from_secs(2)).expect("second");
        assert_eq!(first.0, "A");
        assert_eq!(second.0, "B");
        assert_eq!(first.1.as_deref(), Some("lcm-dispatch"));
        dispatcher.shutdown();
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let sub: Arc<dyn Subscriber> = Arc::new(move |_: &ReceivedMessage| {
            c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        registry.subscribe(".*", sub).expect("subscribe");

        let dispatcher = QueuedDispatcher::spawn(Arc::clone(&registry), 64).expect("spawn");
        for _ in 0..10 {
            dispatcher.deliver(ReceivedMessage::with_utime("X", vec![], 0));
        }
        dispatcher.shutdown();
        dispatcher.shutdown();
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 10);
    }
}
