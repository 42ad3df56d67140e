// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! LCM TCP relay hub
//!
//! Relays messages between `tcpq://` clients when multicast is unavailable.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default port (7700)
//! lcm-tcpq-hub
//!
//! # Loopback only, echo publishes back to their sender
//! lcm-tcpq-hub --bind 127.0.0.1 --port 7701 --echo
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use lcm::config::TCPQ_DEFAULT_PORT;
use lcm::{HubConfig, TcpHub};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "lcm-tcpq-hub")]
#[command(author, version, about = "TCP relay hub for LCM tcpq:// clients", long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value_t = TCPQ_DEFAULT_PORT)]
    port: u16,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Also relay each publish back to the client that sent it
    #[arg(long)]
    echo: bool,

    /// Seconds between statistics lines (0 = never)
    #[arg(long, default_value = "0")]
    stats_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt().with_env_filter(filter).with_target(false).init();

    let config = HubConfig {
        bind_address: args.bind,
        port: args.port,
        echo_to_sender: args.echo,
    };
    let hub = TcpHub::bind(config.clone())
        .with_context(|| format!("cannot listen on {}:{}", config.bind_address, config.port))?
        .spawn()
        .context("cannot start hub")?;

    info!("+----------------------------------------------------+");
    info!("|       LCM tcpq hub v{:31}|", env!("CARGO_PKG_VERSION"));
    info!("+----------------------------------------------------+");
    info!("|  Bind:   {:40} |", hub.local_addr());
    info!(
        "|  Echo:   {:40} |",
        if config.echo_to_sender { "enabled" } else { "disabled" }
    );
    info!("+----------------------------------------------------+");

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("Received Ctrl+C, shutting down...");
        handler_flag.store(false, Ordering::Release);
    })
    .context("cannot install Ctrl+C handler")?;

    let interval = Duration::from_secs(args.stats_interval);
    let mut last_report = Instant::now();
    while running.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(100));
        if !interval.is_zero() && last_report.elapsed() >= interval {
            last_report = Instant::now();
            let stats = hub.stats();
            info!(
                clients = stats.clients,
                received = stats.messages_received,
                relayed = stats.messages_relayed,
                bytes = stats.bytes_relayed,
                "hub stats"
            );
        }
    }

    let stats = hub.stats();
    hub.shutdown();
    info!(
        received = stats.messages_received,
        relayed = stats.messages_relayed,
        "Hub shutdown complete"
    );
    Ok(())
}
