// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # LCM - Lightweight Communications and Marshalling transport
//!
//! A publish/subscribe message bus for small opaque binary messages on
//! named channels. Subscribers register regular expressions and receive
//! every message whose channel fully matches.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lcm::{Lcm, ReceivedMessage, Result};
//!
//! fn main() -> Result<()> {
//!     let lcm = Lcm::new("udpm://239.255.76.67:7667?ttl=0")?;
//!
//!     lcm.subscribe_fn("POSE.*", |msg: &ReceivedMessage| {
//!         println!("{}: {} bytes", msg.channel, msg.data.len());
//!     })?;
//!
//!     lcm.publish("POSE_EST", &[1, 2, 3])?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                         Application Layer                          |
//! |   Lcm (publish / subscribe)  |  MessageAggregator  |  LcmMessage    |
//! +---------------------------------------------------------------------+
//! |                            Bus Layer                                |
//! |   SubscriptionRegistry (regex + channel cache) | QueuedDispatcher   |
//! +---------------------------------------------------------------------+
//! |                          Provider Layer                             |
//! |   udpm (multicast + fragments) | tcpq (relay) | file (log) | memq   |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Providers
//!
//! | URL | Description |
//! |-----|-------------|
//! | `udpm://239.255.76.67:7667?ttl=0` | UDP multicast, fragments large messages |
//! | `tcpq://host:7700` | Client of a [`hub::TcpHub`] relay |
//! | `file:///path/log?mode=r&speed=1` | Replay or record an event log |
//! | `memq://` | In-process loopback |
//!
//! When no URL is given, [`Lcm::new_default`] reads `LCM_DEFAULT_URL` and
//! falls back to [`config::DEFAULT_URL`].

/// Bounded buffering subscriber for pull-style consumers.
pub mod aggregator;
/// Subscription registry, dispatch and the `Lcm` bus.
pub mod bus;
/// Protocol constants and defaults.
pub mod config;
pub mod error;
/// Event log file format.
pub mod eventlog;
/// TCP relay hub.
pub mod hub;
pub mod message;
/// Transport providers and wire codecs.
pub mod transport;
pub mod url;

pub use aggregator::MessageAggregator;
pub use bus::dispatch::{DispatchMode, MessageSink};
pub use bus::registry::Subscriber;
pub use bus::{Lcm, LcmBuilder};
pub use error::{Error, Result};
pub use eventlog::{Event, EventLogReader, EventLogWriter};
pub use hub::{ClientStats, HubConfig, HubHandle, HubStats, TcpHub};
pub use message::{LcmMessage, ReceivedMessage};
pub use url::LcmUrl;
