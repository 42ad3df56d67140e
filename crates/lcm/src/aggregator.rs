// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pull-style consumption of subscribed messages.
//!
//! [`MessageAggregator`] is a [`Subscriber`] that queues what it receives.
//! Consumers call [`MessageAggregator::next_message`] from their own thread,
//! which keeps slow processing off the provider receive loops.
//!
//! # Example
//!
//! ```no_run
//! use lcm::{Lcm, MessageAggregator};
//! use std::sync::Arc;
//!
//! let lcm = Lcm::new("udpm://239.255.76.67:7667?ttl=0")?;
//! let aggregator = Arc::new(MessageAggregator::new());
//! lcm.subscribe("POSE.*", aggregator.clone())?;
//! while let Some(msg) = aggregator.next_message(1000) {
//!     println!("{}: {} bytes", msg.channel, msg.data.len());
//! }
//! # Ok::<(), lcm::Error>(())
//! ```

use crate::bus::registry::Subscriber;
use crate::config::AGGREGATOR_DEFAULT_MAX_BYTES;
use crate::message::ReceivedMessage;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

struct Queue {
    messages: VecDeque<ReceivedMessage>,
    bytes: usize,
    max_bytes: usize,
    max_messages: usize,
    evicted: u64,
}

impl Queue {
    /// Drop oldest entries until both limits hold.
    fn enforce_limits(&mut self) {
        while self.bytes > self.max_bytes || self.messages.len() > self.max_messages {
            let Some(oldest) = self.messages.pop_front() else {
                break;
            };
            self.bytes -= oldest.data.len();
            self.evicted += 1;
        }
    }

    fn pop(&mut self) -> Option<ReceivedMessage> {
        let msg = self.messages.pop_front()?;
        self.bytes -= msg.data.len();
        Some(msg)
    }
}

/// Bounded FIFO of received messages with oldest-first eviction.
pub struct MessageAggregator {
    queue: Mutex<Queue>,
    available: Condvar,
}

impl MessageAggregator {
    /// 100 MiB byte ceiling, no message-count ceiling.
    pub fn new() -> Self {
        Self::with_limits(AGGREGATOR_DEFAULT_MAX_BYTES, usize::MAX)
    }

    pub fn with_limits(max_bytes: usize, max_messages: usize) -> Self {
        Self {
            queue: Mutex::new(Queue {
                messages: VecDeque::new(),
                bytes: 0,
                max_bytes,
                max_messages,
                evicted: 0,
            }),
            available: Condvar::new(),
        }
    }

    pub fn set_max_buffered_bytes(&self, max_bytes: usize) {
        let mut q = self.queue.lock();
        q.max_bytes = max_bytes;
        q.enforce_limits();
    }

    pub fn max_buffered_bytes(&self) -> usize {
        self.queue.lock().max_bytes
    }

    pub fn set_max_messages(&self, max_messages: usize) {
        let mut q = self.queue.lock();
        q.max_messages = max_messages;
        q.enforce_limits();
    }

    pub fn max_messages(&self) -> usize {
        self.queue.lock().max_messages
    }

    pub fn messages_available(&self) -> usize {
        self.queue.lock().messages.len()
    }

    /// Payload bytes currently queued.
    pub fn buffered_bytes(&self) -> usize {
        self.queue.lock().bytes
    }

    /// Messages dropped to stay within the limits.
    pub fn evicted(&self) -> u64 {
        self.queue.lock().evicted
    }

    /// Oldest queued message.
    ///
    /// `timeout_ms == 0` returns immediately, a negative value waits
    /// indefinitely, otherwise waits up to `timeout_ms` milliseconds.
    pub fn next_message(&self, timeout_ms: i64) -> Option<ReceivedMessage> {
        let timeout = match timeout_ms {
            t if t < 0 => None,
            t => Some(Duration::from_millis(t as u64)),
        };
        self.next_message_timeout(timeout)
    }

    /// Oldest queued message, waiting up to `timeout` (`None` = forever).
    pub fn next_message_timeout(&self, timeout: Option<Duration>) -> Option<ReceivedMessage> {
        let mut q = self.queue.lock();
        match timeout {
            None => {
                while q.messages.is_empty() {
                    self.available.wait(&mut q);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while q.messages.is_empty() {
                    if self.available.wait_until(&mut q, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        q.pop()
    }

    /// Take everything queued without waiting.
    pub fn drain(&self) -> Vec<ReceivedMessage> {
        let mut q = self.queue.lock();
        q.bytes = 0;
        q.messages.drain(..).collect()
    }

    fn push(&self, msg: ReceivedMessage) {
        let mut q = self.queue.lock();
        q.bytes += msg.data.len();
        q.messages.push_back(msg);
        q.enforce_limits();
        drop(q);
        self.available.notify_one();
    }
}

impl Default for MessageAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Subscriber for MessageAggregator {
    fn message_received(&self, msg: &ReceivedMessage) {
        self.push(msg.clone());
    }
}
