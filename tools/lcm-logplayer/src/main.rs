// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! LCM log player
//!
//! Reads an event log through a `file://` bus and republishes every
//! matching message onto an output bus.
//!
//! ```bash
//! lcm-logplayer --speed 2.0 --regexp 'POSE.*' lcmlog-2026-01-05.00
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use lcm::bus::registry::compile_pattern;
use lcm::{EventLogReader, Lcm, ReceivedMessage};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "lcm-logplayer")]
#[command(author, version, about = "Replay an LCM event log onto a bus", long_about = None)]
struct Args {
    /// Event log to replay
    file: PathBuf,

    /// Playback speed multiplier (0 = as fast as possible)
    #[arg(short, long, default_value = "1.0")]
    speed: f64,

    /// Only replay channels fully matching this regex
    #[arg(short = 'e', long, default_value = ".*")]
    regexp: String,

    /// Output bus URL (default: LCM_DEFAULT_URL or udpm)
    #[arg(short, long)]
    lcm_url: Option<String>,

    /// Print playback progress once per second
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn input_url(args: &Args) -> String {
    format!(
        "file://{}?speed={}&verbose={}",
        args.file.display(),
        args.speed,
        args.verbose
    )
}

fn count_events(path: &Path) -> Result<u64> {
    let mut reader = EventLogReader::open(path)?;
    let mut count = 0;
    while reader.read_next_event()?.is_some() {
        count += 1;
    }
    Ok(count)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplayEnd {
    Complete,
    ReaderStopped,
    Interrupted,
}

/// Block until every event was seen, the replay thread exits, or Ctrl-C.
fn wait_for_replay(input: &Lcm, running: &AtomicBool, seen: &AtomicU64, total: u64) -> ReplayEnd {
    loop {
        if seen.load(Ordering::Acquire) >= total {
            return ReplayEnd::Complete;
        }
        if !running.load(Ordering::Acquire) {
            return ReplayEnd::Interrupted;
        }
        if input.providers_finished().unwrap_or(true) {
            // Deliveries run on the replay thread, so the count is final.
            return if seen.load(Ordering::Acquire) >= total {
                ReplayEnd::Complete
            } else {
                ReplayEnd::ReaderStopped
            };
        }
        thread::sleep(Duration::from_millis(50));
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt().with_env_filter(filter).with_target(false).init();

    let channel_filter = compile_pattern(&args.regexp)
        .with_context(|| format!("invalid channel regex '{}'", args.regexp))?;
    let total = count_events(&args.file)
        .with_context(|| format!("cannot read {}", args.file.display()))?;
    if total == 0 {
        bail!("{} contains no events", args.file.display());
    }

    let output = Arc::new(
        match &args.lcm_url {
            Some(url) => Lcm::new(url),
            None => Lcm::new_default(),
        }
        .context("cannot open output bus")?,
    );
    let input = Lcm::new(&input_url(&args)).context("cannot open log")?;

    // Every event is counted; only matching ones are republished.
    let seen = Arc::new(AtomicU64::new(0));
    let republished = Arc::new(AtomicU64::new(0));
    {
        let output = Arc::clone(&output);
        let seen = Arc::clone(&seen);
        let republished = Arc::clone(&republished);
        input.subscribe_fn(".*", move |msg: &ReceivedMessage| {
            if channel_filter.is_match(&msg.channel) {
                match output.publish(&msg.channel, &msg.data) {
                    Ok(()) => {
                        republished.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => tracing::warn!("republish on {} failed: {}", msg.channel, e),
                }
            }
            seen.fetch_add(1, Ordering::Release);
        })?;
    }

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || handler_flag.store(false, Ordering::Release))
        .context("cannot install Ctrl+C handler")?;

    tracing::info!(file = %args.file.display(), events = total, speed = args.speed, "Replaying log");

    let ended = wait_for_replay(&input, &running, &seen, total);
    if ended == ReplayEnd::ReaderStopped {
        tracing::warn!(
            events = seen.load(Ordering::Relaxed),
            expected = total,
            "replay stopped before the end of the log"
        );
    }

    input.close();
    output.close();
    tracing::info!(
        events = seen.load(Ordering::Relaxed),
        republished = republished.load(Ordering::Relaxed),
        "Replay finished"
    );
    Ok(())
}
