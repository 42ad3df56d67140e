// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! LCM logger
//!
//! Records messages seen on a bus into an event log file.
//!
//! # Usage
//!
//! ```bash
//! # lcmlog-YYYY-MM-DD.NN in the current directory
//! lcm-logger
//!
//! # Only POSE channels, named after the current time
//! lcm-logger -c 'POSE.*' -s 'run-%H%M%S.log'
//!
//! # Everything except camera images, appended to an existing log
//! lcm-logger -v -c 'CAMERA.*' -a session.log
//! ```

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use clap::Parser;
use lcm::bus::registry::compile_pattern;
use lcm::{EventLogWriter, Lcm, ReceivedMessage};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{fmt, EnvFilter};

/// Highest `.NN` suffix tried when numbering file names.
const MAX_INCREMENT: u32 = 99;

#[derive(Parser, Debug)]
#[command(name = "lcm-logger")]
#[command(author, version, about = "Record LCM traffic to an event log", long_about = None)]
struct Args {
    /// Output file (default: lcmlog-YYYY-MM-DD.NN)
    file: Option<String>,

    /// Channels to record (full-match regex)
    #[arg(short, long, default_value = ".*")]
    channel: String,

    /// Record channels that do NOT match --channel
    #[arg(short = 'v', long)]
    invert_channels: bool,

    /// Overwrite an existing file
    #[arg(short, long, conflicts_with = "append")]
    force: bool,

    /// Append to an existing file
    #[arg(short, long)]
    append: bool,

    /// Add a .NN suffix, picking the first unused number
    #[arg(short, long)]
    increment: bool,

    /// Bus URL to listen on (default: LCM_DEFAULT_URL or udpm)
    #[arg(short, long)]
    lcm_url: Option<String>,

    /// No per-second summary
    #[arg(short, long)]
    quiet: bool,

    /// Milliseconds between file flushes
    #[arg(long, default_value = "100")]
    flush_interval: u64,

    /// Expand strftime escapes in the file name
    #[arg(short = 's', long)]
    strftime: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Decide where to write, honouring naming and overwrite flags.
fn output_path(args: &Args, now: DateTime<Local>) -> Result<PathBuf> {
    let (base, increment) = match &args.file {
        Some(name) if args.strftime => (now.format(name).to_string(), args.increment),
        Some(name) => (name.clone(), args.increment),
        None => (format!("lcmlog-{}", now.format("%Y-%m-%d")), true),
    };

    if increment {
        return (0..=MAX_INCREMENT)
            .map(|n| PathBuf::from(format!("{}.{:02}", base, n)))
            .find(|p| !p.exists())
            .with_context(|| format!("no free file name for {}.NN", base));
    }

    let path = PathBuf::from(base);
    if path.exists() && !args.force && !args.append {
        bail!(
            "{} exists; use --force to overwrite or --append",
            path.display()
        );
    }
    Ok(path)
}

fn open_writer(path: &Path, append: bool) -> Result<EventLogWriter> {
    let writer = if append {
        EventLogWriter::append(path)
    } else {
        EventLogWriter::create(path)
    };
    writer.with_context(|| format!("cannot open {}", path.display()))
}

/// Throughput over the last reporting window.
#[derive(Debug, Default)]
struct Summary {
    events: u64,
    bytes: u64,
    window_events: u64,
    window_bytes: u64,
    /// Messages the log format cannot hold.
    skipped: u64,
}

impl Summary {
    fn record(&mut self, len: usize) {
        self.events += 1;
        self.window_events += 1;
        self.bytes += len as u64;
        self.window_bytes += len as u64;
    }

    fn line(&mut self, elapsed: Duration) -> String {
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let line = format!(
            "{:.1} msg/s, {:.1} KiB/s, {} events, {:.2} MiB total",
            self.window_events as f64 / secs,
            self.window_bytes as f64 / 1024.0 / secs,
            self.events,
            self.bytes as f64 / (1024.0 * 1024.0)
        );
        self.window_events = 0;
        self.window_bytes = 0;
        line
    }
}

/// Append one message; records the log format cannot hold are skipped.
fn write_message(writer: &mut EventLogWriter, summary: &mut Summary, msg: &ReceivedMessage) -> Result<()> {
    match writer.write_event(msg.recv_utime, &msg.channel, &msg.data) {
        Ok(_) => {
            summary.record(msg.data.len());
            Ok(())
        }
        Err(e @ lcm::Error::RecordTooLarge { .. }) => {
            summary.skipped += 1;
            tracing::warn!("skipping message on {}: {}", msg.channel, e);
            Ok(())
        }
        Err(e) => {
            Err(anyhow::Error::new(e).context(format!("write to {} failed", writer.path().display())))
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt().with_env_filter(filter).with_target(false).init();

    let channel_filter = compile_pattern(&args.channel)
        .with_context(|| format!("invalid channel regex '{}'", args.channel))?;
    let invert = args.invert_channels;

    let path = output_path(&args, Local::now())?;
    let mut writer = open_writer(&path, args.append)?;

    let lcm = match &args.lcm_url {
        Some(url) => Lcm::new(url),
        None => Lcm::new_default(),
    }
    .context("cannot open bus")?;

    // One writer: the subscriber only forwards.
    let (tx, rx) = mpsc::channel::<ReceivedMessage>();
    lcm.subscribe_fn(".*", move |msg: &ReceivedMessage| {
        if channel_filter.is_match(&msg.channel) != invert {
            let _ = tx.send(msg.clone());
        }
    })?;

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        tracing::info!("Received Ctrl+C, shutting down...");
        handler_flag.store(false, Ordering::Release);
    })
    .context("cannot install Ctrl+C handler")?;

    tracing::info!(file = %path.display(), channel = %args.channel, invert, "Recording");

    let flush_interval = Duration::from_millis(args.flush_interval);
    let mut last_flush = Instant::now();
    let mut last_report = Instant::now();
    let mut summary = Summary::default();

    while running.load(Ordering::Acquire) {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(msg) => write_message(&mut writer, &mut summary, &msg)?,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        if last_flush.elapsed() >= flush_interval {
            writer.flush()?;
            last_flush = Instant::now();
        }
        if !args.quiet && last_report.elapsed() >= Duration::from_secs(1) {
            println!("{}", summary.line(last_report.elapsed()));
            last_report = Instant::now();
        }
    }

    lcm.close();
    for msg in rx.try_iter() {
        write_message(&mut writer, &mut summary, &msg)?;
    }
    writer.flush()?;

    tracing::info!(
        events = summary.events,
        bytes = summary.bytes,
        skipped = summary.skipped,
        file = %path.display(),
        "Logger shutdown complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["lcm-logger"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    fn fixed_time() -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2026, 1, 5, 13, 4, 5)
            .single()
            .expect("valid time")
    }

    #[test]
    fn test_default_name_is_numbered() {
        let dir = tempdir().expect("tempdir");
        let base = dir.path().join("lcmlog-%Y-%m-%d");
        let a = args(&["-s", "-i", base.to_str().expect("utf8")]);

        let first = output_path(&a, fixed_time()).expect("path");
        assert!(first.ends_with("lcmlog-2026-01-05.00"));

        std::fs::write(&first, b"").expect("touch");
        let second = output_path(&a, fixed_time()).expect("path");
        assert!(second.ends_with("lcmlog-2026-01-05.01"));
    }

    #[test]
    fn test_existing_file_needs_force_or_append() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("taken.log");
        std::fs::write(&path, b"").expect("touch");
        let name = path.to_str().expect("utf8");

        assert!(output_path(&args(&[name]), fixed_time()).is_err());
        assert_eq!(output_path(&args(&["-f", name]), fixed_time()).expect("force"), path);
        assert_eq!(output_path(&args(&["-a", name]), fixed_time()).expect("append"), path);
    }

    #[test]
    fn test_strftime_expansion() {
        let a = args(&["-s", "run-%H%M%S.log"]);
        assert_eq!(
            output_path(&a, fixed_time()).expect("path"),
            PathBuf::from("run-130405.log")
        );
    }

    #[test]
    fn test_force_conflicts_with_append() {
        assert!(Args::try_parse_from(["lcm-logger", "-f", "-a", "x"]).is_err());
    }

    #[test]
    fn test_oversized_channel_is_skipped() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("skip.log");
        let mut writer = EventLogWriter::create(&path).expect("create");
        let mut summary = Summary::default();

        let long = ReceivedMessage::with_utime("L".repeat(1500), b"x".to_vec(), 1);
        let short = ReceivedMessage::with_utime("SHORT", b"y".to_vec(), 2);
        write_message(&mut writer, &mut summary, &long).expect("skipped");
        write_message(&mut writer, &mut summary, &short).expect("written");
        writer.flush().expect("flush");

        assert_eq!((summary.events, summary.skipped), (1, 1));
        let mut reader = lcm::EventLogReader::open(&path).expect("open");
        let event = reader.read_next_event().expect("read").expect("event");
        assert_eq!(event.channel, "SHORT");
        assert!(reader.read_next_event().expect("read").is_none());
    }

    #[test]
    fn test_summary_window_resets() {
        let mut summary = Summary::default();
        summary.record(1024);
        summary.record(1024);
        let line = summary.line(Duration::from_secs(1));
        assert!(line.starts_with("2.0 msg/s, 2.0 KiB/s, 2 events"));
        assert_eq!(summary.window_events, 0);
        assert_eq!(summary.events, 2);
    }
}
