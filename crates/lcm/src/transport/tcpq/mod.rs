// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP relay transport (`tcpq://host:port`).
//!
//! Clients connect to a hub ([`crate::hub::TcpHub`]) that forwards each
//! publish to the clients whose subscriptions match the channel.

/// Relay stream codec and handshake.
pub mod codec;
mod provider;

pub use codec::{RelayDecoder, RelayFrame};
pub use provider::{TcpqOptions, TcpqProvider};
