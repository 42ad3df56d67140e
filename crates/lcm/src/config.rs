// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! LCM global configuration.
//!
//! Wire constants and defaults live here and nowhere else.
//!
//! # Architecture
//!
//! - **Static**: wire magics, fragmentation limits, default endpoints
//! - **Environment**: `LCM_DEFAULT_URL` selects the provider used by
//!   [`crate::Lcm::new_default`]

use std::time::Duration;

// =======================================================================
// Datagram framing
// =======================================================================

/// Magic of a single-datagram message ("LC02").
pub const MAGIC_SHORT: u32 = 0x4c43_3032;

/// Magic of one fragment of a multi-datagram message ("LC03").
pub const MAGIC_LONG: u32 = 0x4c43_3033;

/// Largest `channel + NUL + payload` that still fits a short datagram.
///
/// Also the size of every fragment body in the long form.
pub const FRAGMENTATION_THRESHOLD: usize = 64_000;

/// Fragment index and count are 16-bit on the wire.
pub const MAX_FRAGMENTS: usize = 65_535;

/// Largest payload a reassembly buffer will accept from the network.
pub const MAX_MESSAGE_SIZE: usize = 1 << 28;

/// Largest datagram the receive loop reads.
pub const MAX_DATAGRAM_SIZE: usize = 65_536;

// =======================================================================
// TCP relay
// =======================================================================

/// Handshake magic sent by the hub.
pub const TCPQ_MAGIC_SERVER: u32 = 0x2876_17fa;

/// Handshake magic sent by a client.
pub const TCPQ_MAGIC_CLIENT: u32 = 0x2876_17fb;

/// Relay protocol version exchanged during the handshake.
pub const TCPQ_VERSION: u32 = 0x0100;

/// Default hub port when a `tcpq://` URL omits one.
pub const TCPQ_DEFAULT_PORT: u16 = 7700;

/// Delay between connection attempts to the hub.
pub const TCPQ_RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

// =======================================================================
// Defaults
// =======================================================================

/// Multicast group and port used when a `udpm://` URL has no location.
pub const UDPM_DEFAULT_NETWORK: &str = "239.255.76.67:7667";

/// Hub address used when a `tcpq://` URL has no location.
pub const TCPQ_DEFAULT_NETWORK: &str = "127.0.0.1:7700";

/// Fallback when `LCM_DEFAULT_URL` is unset.
pub const DEFAULT_URL: &str = "udpm://239.255.76.67:7667";

/// Environment variable overriding [`DEFAULT_URL`].
pub const DEFAULT_URL_ENV: &str = "LCM_DEFAULT_URL";

/// Socket read timeout used by receive loops to poll their stop flag.
pub const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Default aggregator ceiling (100 MiB).
pub const AGGREGATOR_DEFAULT_MAX_BYTES: usize = 100 * 1024 * 1024;

/// URL used when no explicit provider is configured.
///
/// Reads `LCM_DEFAULT_URL`; empty values are ignored.
pub fn default_url() -> String {
    match std::env::var(DEFAULT_URL_ENV) {
        Ok(url) if !url.trim().is_empty() => url,
        _ => DEFAULT_URL.to_string(),
    }
}
