// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The message bus.
//!
//! An [`Lcm`] owns one provider per configured URL and one
//! [`SubscriptionRegistry`]. Publishing fans out to every provider;
//! messages received by any provider are dispatched to every subscription
//! whose pattern fully matches the channel.
//!
//! There is no global instance: construct one and share it (`Lcm` is
//! `Send + Sync`, wrap it in an `Arc` when several owners need it).

/// Dispatch strategies between providers and the registry.
pub mod dispatch;
/// Regex subscriptions and per-channel resolve cache.
pub mod registry;

use crate::config::default_url;
use crate::error::{Error, Result};
use crate::message::{LcmMessage, ReceivedMessage};
use crate::transport::frame::validate_channel;
use crate::transport::{create_provider, Provider};
use crate::url::LcmUrl;
use dispatch::{DispatchMode, MessageSink, QueuedDispatcher};
use registry::{RegistryStats, Subscriber, SubscriptionRegistry, DEFAULT_CHANNEL_CACHE_CAPACITY};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Builder for an [`Lcm`] with several providers or non-default dispatch.
#[derive(Debug, Clone)]
pub struct LcmBuilder {
    urls: Vec<String>,
    dispatch: DispatchMode,
    channel_cache_capacity: usize,
}

impl LcmBuilder {
    pub fn new() -> Self {
        Self {
            urls: Vec::new(),
            dispatch: DispatchMode::Direct,
            channel_cache_capacity: DEFAULT_CHANNEL_CACHE_CAPACITY,
        }
    }

    /// Add a provider URL. With none, [`default_url`] is used.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.urls.push(url.into());
        self
    }

    pub fn urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.urls.extend(urls.into_iter().map(Into::into));
        self
    }

    pub fn dispatch(mut self, mode: DispatchMode) -> Self {
        self.dispatch = mode;
        self
    }

    /// Run callbacks on one worker thread fed by a queue of `capacity`.
    pub fn queued_dispatch(self, capacity: usize) -> Self {
        self.dispatch(DispatchMode::Queued(capacity))
    }

    /// Number of distinct channels whose subscriber lists are cached.
    pub fn channel_cache_capacity(mut self, capacity: usize) -> Self {
        self.channel_cache_capacity = capacity;
        self
    }

    /// Parse every URL, then start every provider.
    ///
    /// Any failure closes the providers already started and is returned.
    pub fn build(self) -> Result<Lcm> {
        let urls = if self.urls.is_empty() {
            vec![default_url()]
        } else {
            self.urls
        };
        let urls = urls
            .iter()
            .map(|u| LcmUrl::parse(u))
            .collect::<Result<Vec<_>>>()?;

        let registry = Arc::new(SubscriptionRegistry::with_cache_capacity(
            self.channel_cache_capacity,
        ));
        let queued = match self.dispatch {
            DispatchMode::Direct => None,
            DispatchMode::Queued(capacity) => Some(Arc::new(QueuedDispatcher::spawn(
                Arc::clone(&registry),
                capacity,
            )?)),
        };
        let sink: Arc<dyn MessageSink> = match &queued {
            Some(q) => Arc::clone(q) as Arc<dyn MessageSink>,
            None => Arc::clone(&registry) as Arc<dyn MessageSink>,
        };

        let mut providers: Vec<Box<dyn Provider>> = Vec::with_capacity(urls.len());
        for url in &urls {
            match create_provider(url, Arc::clone(&sink)) {
                Ok(provider) => {
                    tracing::debug!("started provider {}", url);
                    providers.push(provider);
                }
                Err(e) => {
                    tracing::error!("cannot start provider {}: {}", url, e);
                    for p in &providers {
                        p.close();
                    }
                    if let Some(q) = &queued {
                        q.shutdown();
                    }
                    return Err(e);
                }
            }
        }

        Ok(Lcm {
            registry,
            queued,
            providers,
            closed: AtomicBool::new(false),
        })
    }
}

impl Default for LcmBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Publish/subscribe bus over one or more providers.
///
/// # Example
///
/// ```no_run
/// use lcm::{Lcm, ReceivedMessage};
///
/// let lcm = Lcm::new("udpm://239.255.76.67:7667?ttl=0")?;
/// lcm.subscribe_fn("EXAMPLE", |msg: &ReceivedMessage| {
///     println!("{} bytes on {}", msg.data.len(), msg.channel);
/// })?;
/// lcm.publish_str("EXAMPLE", "hello")?;
/// # Ok::<(), lcm::Error>(())
/// ```
pub struct Lcm {
    registry: Arc<SubscriptionRegistry>,
    queued: Option<Arc<QueuedDispatcher>>,
    providers: Vec<Box<dyn Provider>>,
    closed: AtomicBool,
}

impl Lcm {
    /// Bus with a single provider.
    pub fn new(url: &str) -> Result<Self> {
        LcmBuilder::new().url(url).build()
    }

    /// Bus on `LCM_DEFAULT_URL`, or the default multicast group.
    pub fn new_default() -> Result<Self> {
        LcmBuilder::new().build()
    }

    pub fn builder() -> LcmBuilder {
        LcmBuilder::new()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    // ===== Publishing =====

    /// Send `data` on `channel` through every provider.
    ///
    /// A failing provider does not stop the others; the first error is
    /// returned after all providers were tried.
    pub fn publish(&self, channel: &str, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        validate_channel(channel)?;

        let mut first_err = None;
        for provider in &self.providers {
            if let Err(e) = provider.publish(channel, data) {
                tracing::warn!("publish on {} via {} failed: {}", channel, provider.url(), e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Publish a string followed by a NUL byte.
    pub fn publish_str(&self, channel: &str, s: &str) -> Result<()> {
        let mut data = Vec::with_capacity(s.len() + 1);
        data.extend_from_slice(s.as_bytes());
        data.push(0);
        self.publish(channel, &data)
    }

    /// Encode and publish a typed message.
    pub fn publish_message<M: LcmMessage>(&self, channel: &str, msg: &M) -> Result<()> {
        self.publish(channel, &msg.encode()?)
    }

    // ===== Subscriptions =====

    /// Deliver messages on channels fully matching `pattern` to `subscriber`.
    pub fn subscribe(&self, pattern: &str, subscriber: Arc<dyn Subscriber>) -> Result<()> {
        self.ensure_open()?;
        self.registry.subscribe(pattern, subscriber)?;
        for provider in &self.providers {
            if let Err(e) = provider.subscribe(pattern) {
                tracing::warn!("subscribe '{}' on {} failed: {}", pattern, provider.url(), e);
            }
        }
        Ok(())
    }

    /// Subscribe a closure; the returned handle identifies it for
    /// [`Lcm::unsubscribe`].
    pub fn subscribe_fn<F>(&self, pattern: &str, f: F) -> Result<Arc<dyn Subscriber>>
    where
        F: Fn(&ReceivedMessage) + Send + Sync + 'static,
    {
        let subscriber: Arc<dyn Subscriber> = Arc::new(f);
        self.subscribe(pattern, Arc::clone(&subscriber))?;
        Ok(subscriber)
    }

    /// Subscribe to every channel.
    pub fn subscribe_all(&self, subscriber: Arc<dyn Subscriber>) -> Result<()> {
        self.subscribe(".*", subscriber)
    }

    /// Remove subscriptions matching both filters (`None` matches any).
    ///
    /// `unsubscribe(None, None)` removes everything. Returns the number of
    /// subscriptions removed.
    pub fn unsubscribe(
        &self,
        pattern: Option<&str>,
        subscriber: Option<&Arc<dyn Subscriber>>,
    ) -> Result<usize> {
        self.ensure_open()?;
        let removed = self.registry.unsubscribe(pattern, subscriber);
        for pattern in &removed {
            for provider in &self.providers {
                if let Err(e) = provider.unsubscribe(pattern) {
                    tracing::warn!(
                        "unsubscribe '{}' on {} failed: {}",
                        pattern,
                        provider.url(),
                        e
                    );
                }
            }
        }
        Ok(removed.len())
    }

    pub fn num_subscriptions(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.registry.num_subscriptions())
    }

    // ===== Introspection =====

    /// Provider URLs in construction order.
    pub fn urls(&self) -> Result<Vec<&LcmUrl>> {
        self.ensure_open()?;
        Ok(self.providers.iter().map(|p| p.url()).collect())
    }

    pub fn stats(&self) -> Result<RegistryStats> {
        self.ensure_open()?;
        Ok(self.registry.stats())
    }

    /// Whether every provider has delivered all of its input.
    ///
    /// Only replay providers ever finish; live transports keep this `false`.
    pub fn providers_finished(&self) -> Result<bool> {
        self.ensure_open()?;
        Ok(!self.providers.is_empty() && self.providers.iter().all(|p| p.is_finished()))
    }

    /// The only query that stays valid after [`Lcm::close`].

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop every provider and release their resources.
    ///
    /// Idempotent. Every other method returns [`Error::Closed`] afterwards.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for provider in &self.providers {
            provider.close();
        }
        if let Some(q) = &self.queued {
            q.shutdown();
        }
        self.registry.unsubscribe(None, None);
        tracing::debug!("LCM instance closed");
    }
}

impl Drop for Lcm {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn memq() -> Lcm {
        Lcm::new("memq://").expect("memq bus")
    }

    /// Provider whose publish always fails.
    struct DownProvider {
        url: LcmUrl,
    }

    impl Provider for DownProvider {
        fn publish(&self, _channel: &str, _data: &[u8]) -> Result<()> {
            Err(Error::Protocol("link down".to_string()))
        }

        fn close(&self) {}

        fn url(&self) -> &LcmUrl {
            &self.url
        }
    }

    #[test]
    fn test_failing_provider_does_not_block_others() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let sink: Arc<dyn MessageSink> = Arc::clone(&registry) as Arc<dyn MessageSink>;
        let down: Box<dyn Provider> = Box::new(DownProvider {
            url: LcmUrl::parse("down://").expect("url"),
        });
        let memq = create_provider(&LcmUrl::parse("memq://").expect("url"), sink).expect("memq");
        let lcm = Lcm {
            registry,
            queued: None,
            providers: vec![down, memq],
            closed: AtomicBool::new(false),
        };

        let (tx, rx) = mpsc::channel();
        let tx = parking_lot::Mutex::new(tx);
        lcm.subscribe_fn("FANOUT", move |msg: &ReceivedMessage| {
            let _ = tx.lock().send(msg.data.clone());
        })
        .expect("subscribe");

        let err = lcm.publish("FANOUT", b"still sent").err().expect("first error");
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).expect("memq delivery"),
            b"still sent".to_vec()
        );
    }

    #[test]
    fn test_bad_url_is_fatal() {
        assert!(matches!(Lcm::new("nonsense"), Err(Error::InvalidUrl(_))));
        assert!(matches!(Lcm::new("bogus://x"), Err(Error::UnknownScheme(_))));
    }

    #[test]
    fn test_one_bad_url_fails_whole_bus() {
        let res = Lcm::builder().url("memq://").url("bogus://x").build();
        assert!(matches!(res, Err(Error::UnknownScheme(_))));
    }

    #[test]
    fn test_publish_rejects_empty_channel() {
        let lcm = memq();
        assert!(matches!(lcm.publish("", b"x"), Err(Error::InvalidChannel(_))));
    }

    #[test]
    fn test_memq_loopback() {
        let lcm = memq();
        let (tx, rx) = mpsc::channel();
        let tx = parking_lot::Mutex::new(tx);
        lcm.subscribe_fn("TEST", move |msg: &ReceivedMessage| {
            let _ = tx.lock().send(msg.clone());
        })
        .expect("subscribe");

        lcm.publish_str("TEST", "foobar").expect("publish");
        lcm.publish_str("OTHER", "ignored").expect("publish");

        let msg = rx.recv_timeout(Duration::from_secs(2)).expect("delivered");
        assert_eq!(msg.channel, "TEST");
        assert_eq!(msg.data, b"foobar\0");
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_closed_bus_rejects_calls() {
        let lcm = memq();
        lcm.close();
        lcm.close();
        assert!(lcm.is_closed());
        assert!(matches!(lcm.publish("A", b""), Err(Error::Closed)));
        let sub: Arc<dyn Subscriber> = Arc::new(|_: &ReceivedMessage| {});
        assert!(matches!(lcm.subscribe("A", sub), Err(Error::Closed)));
        assert!(matches!(lcm.unsubscribe(None, None), Err(Error::Closed)));
        assert!(matches!(lcm.num_subscriptions(), Err(Error::Closed)));
        assert!(matches!(lcm.urls(), Err(Error::Closed)));
        assert!(matches!(lcm.stats(), Err(Error::Closed)));
    }

    #[test]
    fn test_unsubscribe_counts() {
        let lcm = memq();
        let sub = lcm.subscribe_fn("A", |_: &ReceivedMessage| {}).expect("subscribe");
        lcm.subscribe("B", Arc::clone(&sub)).expect("subscribe");
        lcm.subscribe_all(Arc::new(|_: &ReceivedMessage| {})).expect("subscribe");
        assert_eq!(lcm.num_subscriptions().expect("open"), 3);
        assert_eq!(lcm.unsubscribe(None, Some(&sub)).expect("unsubscribe"), 2);
        assert_eq!(lcm.unsubscribe(None, None).expect("unsubscribe"), 1);
        assert_eq!(lcm.num_subscriptions().expect("open"), 0);
    }

    #[test]
    fn test_queued_dispatch_delivers() {
        let lcm = Lcm::builder()
            .url("memq://")
            .queued_dispatch(16)
            .build()
            .expect("bus");
        let (tx, rx) = mpsc::channel();
        let tx = parking_lot::Mutex::new(tx);
        lcm.subscribe_fn(".*", move |msg: &ReceivedMessage| {
            let _ = tx.lock().send(msg.channel.clone());
        })
        .expect("subscribe");
        lcm.publish("Q", b"1").expect("publish");
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).expect("delivered"), "Q");
        assert_eq!(lcm.stats().expect("open").messages_dispatched, 1);
    }
}
