// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscription registry and direct dispatch.
//!
//! Subscriptions are kept in registration order. Each channel name seen on
//! the wire is resolved once against every pattern (O(subscriptions)) and
//! the result is cached. Subscribing appends to the cached lists it
//! matches; unsubscribing drops the whole cache.
//!
//! The lock only guards the list and the cache. Callbacks run after it is
//! released, on the thread that delivered the message.

use crate::bus::dispatch::MessageSink;
use crate::error::{Error, Result};
use crate::message::ReceivedMessage;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Channels remembered by the resolve cache.
pub const DEFAULT_CHANNEL_CACHE_CAPACITY: usize = 4096;

/// Receives messages for a subscription.
///
/// Runs on a provider thread; a slow implementation stalls that provider.
pub trait Subscriber: Send + Sync {
    fn message_received(&self, msg: &ReceivedMessage);
}

impl<F> Subscriber for F
where
    F: Fn(&ReceivedMessage) + Send + Sync,
{
    fn message_received(&self, msg: &ReceivedMessage) {
        self(msg)
    }
}

/// Compile a pattern that must match the whole channel name.
pub fn compile_pattern(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", pattern)).map_err(|source| Error::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

struct Subscription {
    pattern: String,
    regex: Regex,
    subscriber: Arc<dyn Subscriber>,
}

type Targets = Arc<Vec<Arc<Subscription>>>;

struct RegistryState {
    subscriptions: Vec<Arc<Subscription>>,
    cache: LruCache<String, Targets>,
}

impl RegistryState {
    fn resolve(&mut self, channel: &str) -> Targets {
        if let Some(targets) = self.cache.get(channel) {
            return Arc::clone(targets);
        }
        let targets: Targets = Arc::new(
            self.subscriptions
                .iter()
                .filter(|s| s.regex.is_match(channel))
                .cloned()
                .collect(),
        );
        self.cache.put(channel.to_string(), Arc::clone(&targets));
        targets
    }
}

/// Registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub messages_dispatched: u64,
    pub callbacks_invoked: u64,
    pub callback_panics: u64,
}

/// Regex subscriptions with a per-channel resolve cache.
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
    messages_dispatched: AtomicU64,
    callbacks_invoked: AtomicU64,
    callback_panics: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::with_cache_capacity(DEFAULT_CHANNEL_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(RegistryState {
                subscriptions: Vec::new(),
                cache: LruCache::new(capacity),
            }),
            messages_dispatched: AtomicU64::new(0),
            callbacks_invoked: AtomicU64::new(0),
            callback_panics: AtomicU64::new(0),
        }
    }

    /// Register `subscriber` for channels fully matching `pattern`.
    pub fn subscribe(&self, pattern: &str, subscriber: Arc<dyn Subscriber>) -> Result<()> {
        let regex = compile_pattern(pattern)?;
        let sub = Arc::new(Subscription {
            pattern: pattern.to_string(),
            regex,
            subscriber,
        });

        let mut state = self.state.lock();
        state.subscriptions.push(Arc::clone(&sub));
        for (channel, targets) in state.cache.iter_mut() {
            if sub.regex.is_match(channel) {
                let mut updated = Vec::with_capacity(targets.len() + 1);
                updated.extend(targets.iter().cloned());
                updated.push(Arc::clone(&sub));
                *targets = Arc::new(updated);
            }
        }
        Ok(())
    }

    /// Remove subscriptions matching both filters; `None` matches anything.
    ///
    /// Subscribers are compared by identity. Returns the patterns of the
    /// removed subscriptions, one entry per subscription.
    pub fn unsubscribe(
        &self,
        pattern: Option<&str>,
        subscriber: Option<&Arc<dyn Subscriber>>,
    ) -> Vec<String> {
        let mut state = self.state.lock();
        let mut removed = Vec::new();
        state.subscriptions.retain(|s| {
            let pattern_hit = pattern.map_or(true, |p| s.pattern == p);
            let subscriber_hit = subscriber.map_or(true, |cb| same_subscriber(&s.subscriber, cb));
            if pattern_hit && subscriber_hit {
                removed.push(s.pattern.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            state.cache.clear();
        }
        removed
    }

    pub fn num_subscriptions(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Patterns in registration order.
    pub fn patterns(&self) -> Vec<String> {
        self.state
            .lock()
            .subscriptions
            .iter()
            .map(|s| s.pattern.clone())
            .collect()
    }

    /// Deliver `msg` to every matching subscriber, in registration order.
    ///
    /// A panicking subscriber is logged and skipped.
    pub fn dispatch(&self, msg: &ReceivedMessage) {
        let targets = self.state.lock().resolve(&msg.channel);
        self.messages_dispatched.fetch_add(1, Ordering::Relaxed);

        for sub in targets.iter() {
            self.callbacks_invoked.fetch_add(1, Ordering::Relaxed);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                sub.subscriber.message_received(msg);
            }));
            if outcome.is_err() {
                self.callback_panics.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    "subscriber for pattern '{}' panicked on channel '{}'",
                    sub.pattern,
                    msg.channel
                );
            }
        }
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            callbacks_invoked: self.callbacks_invoked.load(Ordering::Relaxed),
            callback_panics: self.callback_panics.load(Ordering::Relaxed),
        }
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageSink for SubscriptionRegistry {
    fn deliver(&self, msg: ReceivedMessage) {
        self.dispatch(&msg);
    }

    fn num_subscriptions(&self) -> usize {
        SubscriptionRegistry::num_subscriptions(self)
    }
}

fn same_subscriber(a: &Arc<dyn Subscriber>, b: &Arc<dyn Subscriber>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a).cast::<()>(),
        Arc::as_ptr(b).cast::<()>(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every channel it sees.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Subscriber for Recorder {
        fn message_received(&self, msg: &ReceivedMessage) {
            self.seen.lock().push(msg.channel.clone());
        }
    }

    fn recorder() -> (Arc<Recorder>, Arc<dyn Subscriber>) {
        let rec = Arc::new(Recorder::default());
        let dynamic: Arc<dyn Subscriber> = rec.clone();
        (rec, dynamic)
    }

    fn msg(channel: &str) -> ReceivedMessage {
        ReceivedMessage::with_utime(channel, vec![1, 2, 3], 0)
    }

    #[test]
    fn test_full_match_only() {
        let reg = SubscriptionRegistry::new();
        let (rec, sub) = recorder();
        reg.subscribe("A.*", sub).expect("subscribe");

        reg.dispatch(&msg("ABC"));
        reg.dispatch(&msg("XABC"));
        reg.dispatch(&msg("A"));
        assert_eq!(*rec.seen.lock(), vec!["ABC".to_string(), "A".to_string()]);
    }

    #[test]
    fn test_alternation_is_anchored() {
        let reg = SubscriptionRegistry::new();
        let (rec, sub) = recorder();
        reg.subscribe("FOO|BAR", sub).expect("subscribe");
        reg.dispatch(&msg("FOOX"));
        reg.dispatch(&msg("XBAR"));
        reg.dispatch(&msg("BAR"));
        assert_eq!(*rec.seen.lock(), vec!["BAR".to_string()]);
    }

    #[test]
    fn test_invalid_pattern() {
        let reg = SubscriptionRegistry::new();
        let (_rec, sub) = recorder();
        let err = reg.subscribe("(", sub).expect_err("bad regex");
        assert!(matches!(err, Error::InvalidPattern { .. }));
        assert_eq!(reg.num_subscriptions(), 0);
    }

    #[test]
    fn test_overlapping_subscriptions_all_receive() {
        let reg = SubscriptionRegistry::new();
        let (rec, sub) = recorder();
        reg.subscribe(".*", sub.clone()).expect("subscribe");
        reg.subscribe("POSE", sub).expect("subscribe");
        reg.dispatch(&msg("POSE"));
        assert_eq!(rec.seen.lock().len(), 2);
    }

    #[test]
    fn test_subscribe_after_cache_populated() {
        let reg = SubscriptionRegistry::new();
        let (first, sub1) = recorder();
        reg.subscribe("C", sub1).expect("subscribe");
        reg.dispatch(&msg("C"));

        let (second, sub2) = recorder();
        reg.subscribe("C|D", sub2).expect("subscribe");
        reg.dispatch(&msg("C"));

        assert_eq!(first.seen.lock().len(), 2);
        assert_eq!(second.seen.lock().len(), 1);
    }

    #[test]
    fn test_unsubscribe_by_subscriber() {
        let reg = SubscriptionRegistry::new();
        let (a, sub_a) = recorder();
        let (b, sub_b) = recorder();
        reg.subscribe("X", sub_a.clone()).expect("subscribe");
        reg.subscribe("Y.*", sub_a.clone()).expect("subscribe");
        reg.subscribe("X", sub_b).expect("subscribe");
        reg.dispatch(&msg("X"));

        let removed = reg.unsubscribe(None, Some(&sub_a));
        assert_eq!(removed, vec!["X".to_string(), "Y.*".to_string()]);
        reg.dispatch(&msg("X"));
        reg.dispatch(&msg("YY"));

        assert_eq!(a.seen.lock().len(), 1);
        assert_eq!(b.seen.lock().len(), 2);
    }

    #[test]
    fn test_unsubscribe_by_pattern() {
        let reg = SubscriptionRegistry::new();
        let (a, sub_a) = recorder();
        let (b, sub_b) = recorder();
        reg.subscribe("X", sub_a).expect("subscribe");
        reg.subscribe("X", sub_b.clone()).expect("subscribe");
        reg.subscribe(".*", sub_b).expect("subscribe");

        assert_eq!(reg.unsubscribe(Some("X"), None).len(), 2);
        reg.dispatch(&msg("X"));
        assert!(a.seen.lock().is_empty());
        assert_eq!(b.seen.lock().len(), 1);
        assert_eq!(reg.patterns(), vec![".*".to_string()]);
    }

    #[test]
    fn test_unsubscribe_both_filters() {
        let reg = SubscriptionRegistry::new();
        let (a, sub_a) = recorder();
        reg.subscribe("X", sub_a.clone()).expect("subscribe");
        reg.subscribe("Y", sub_a.clone()).expect("subscribe");
        assert_eq!(reg.unsubscribe(Some("X"), Some(&sub_a)).len(), 1);
        reg.dispatch(&msg("X"));
        reg.dispatch(&msg("Y"));
        assert_eq!(*a.seen.lock(), vec!["Y".to_string()]);
    }

    #[test]
    fn test_unsubscribe_all() {
        let reg = SubscriptionRegistry::new();
        let (a, sub_a) = recorder();
        reg.subscribe(".*", sub_a.clone()).expect("subscribe");
        reg.subscribe("Z", sub_a).expect("subscribe");
        reg.dispatch(&msg("Z"));
        assert_eq!(reg.unsubscribe(None, None).len(), 2);
        reg.dispatch(&msg("Z"));
        assert_eq!(reg.num_subscriptions(), 0);
        assert_eq!(a.seen.lock().len(), 2);
    }

    #[test]
    fn test_closure_subscriber() {
        let reg = SubscriptionRegistry::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        let sub: Arc<dyn Subscriber> = Arc::new(move |_: &ReceivedMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        reg.subscribe("T.*", sub).expect("subscribe");
        reg.dispatch(&msg("TEST"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_subscriber_does_not_stop_others() {
        let reg = SubscriptionRegistry::new();
        let bad: Arc<dyn Subscriber> = Arc::new(|_: &ReceivedMessage| {
            panic!("boom");
        });
        let (rec, good) = recorder();
        reg.subscribe(".*", bad).expect("subscribe");
        reg.subscribe(".*", good).expect("subscribe");
        reg.dispatch(&msg("P"));
        assert_eq!(rec.seen.lock().len(), 1);
        assert_eq!(reg.stats().callback_panics, 1);
    }

    #[test]
    fn test_callback_may_subscribe_without_deadlock() {
        let reg = Arc::new(SubscriptionRegistry::new());
        let inner = Arc::clone(&reg);
        let sub: Arc<dyn Subscriber> = Arc::new(move |_: &ReceivedMessage| {
            let noop: Arc<dyn Subscriber> = Arc::new(|_: &ReceivedMessage| {});
            inner.subscribe("LATE", noop).expect("subscribe from callback");
        });
        reg.subscribe("TRIGGER", sub).expect("subscribe");
        reg.dispatch(&msg("TRIGGER"));
        assert_eq!(reg.num_subscriptions(), 2);
    }
}
