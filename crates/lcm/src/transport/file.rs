// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event log provider (`file://path?speed=1.0&delay=0.5&verbose=false&skip=0.0&mode=r`).
//!
//! In read mode (`mode=r`, the default) the log is replayed into the bus,
//! paced by the recorded timestamps. Playback waits for the first
//! subscription and then for `delay` seconds, so consumers constructed
//! right after the bus do not miss the opening messages. `publish` is
//! ignored.
//!
//! With `mode=w` (or `mode=a` to append) every publish is recorded instead
//! and nothing is replayed.

use crate::bus::dispatch::MessageSink;
use crate::error::{Error, Result};
use crate::eventlog::{EventLogReader, EventLogWriter};
use crate::message::{timestamp_now, ReceivedMessage};
use crate::transport::{join_worker, spawn_worker, Provider, StopSignal};
use crate::url::LcmUrl;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Poll interval while waiting for the first subscription.
const SUBSCRIBER_POLL: Duration = Duration::from_millis(10);

/// Sleeps shorter than this are skipped and carried forward.
const MIN_SLEEP: f64 = 0.001;

/// Longest single pacing sleep; larger recorded gaps are shortened.
const MAX_SLEEP: f64 = 3600.0;

/// Slowest accepted playback multiplier.
pub const MIN_SPEED: f64 = 1e-6;

/// Playback speed control.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum PlaybackSpeed {
    /// Recorded timing (1.0x).
    #[default]
    Realtime,
    /// Fixed multiplier (2.0 = twice as fast).
    Speed(f64),
    /// No pacing.
    Unlimited,
}

impl PlaybackSpeed {
    /// Zero or negative multipliers mean as fast as possible.
    pub fn from_multiplier(multiplier: f64) -> Self {
        if multiplier <= 0.0 || !multiplier.is_finite() {
            Self::Unlimited
        } else if (multiplier - 1.0).abs() < f64::EPSILON {
            Self::Realtime
        } else {
            Self::Speed(multiplier)
        }
    }

    /// Wall-clock seconds to wait for a recorded gap of `delta_micros`.
    pub fn delay_for(&self, delta_micros: i64) -> f64 {
        let recorded = delta_micros.max(0) as f64 / 1e6;
        match self {
            Self::Realtime => recorded,
            Self::Speed(s) => recorded / s,
            Self::Unlimited => 0.0,
        }
    }
}

/// How the log file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
    Append,
}

/// Options read from a `file://` URL.
#[derive(Debug, Clone, PartialEq)]
pub struct FileOptions {
    pub path: PathBuf,
    pub mode: FileMode,
    pub speed: PlaybackSpeed,
    pub delay: Duration,
    pub verbose: bool,
    /// Fraction of the file to skip before playback.
    pub skip: f64,
}

impl FileOptions {
    pub fn from_url(url: &LcmUrl) -> Result<Self> {
        let path = url
            .get("host")
            .or_else(|| url.get("network"))
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::InvalidUrl(url.to_string()))?;

        let mode = match url.get_str("mode", "r").as_str() {
            "r" => FileMode::Read,
            "w" => FileMode::Write,
            "a" => FileMode::Append,
            other => {
                return Err(Error::InvalidParam {
                    key: "mode".to_string(),
                    value: other.to_string(),
                })
            }
        };

        let delay = url.get_double("delay", 0.5)?;
        let delay = Duration::try_from_secs_f64(delay).map_err(|_| Error::InvalidParam {
            key: "delay".to_string(),
            value: delay.to_string(),
        })?;

        let speed = url.get_double("speed", 1.0)?;
        if speed.is_nan() || (speed > 0.0 && speed < MIN_SPEED) {
            return Err(Error::InvalidParam {
                key: "speed".to_string(),
                value: speed.to_string(),
            });
        }

        let skip = url.get_double("skip", 0.0)?;
        if !(0.0..=1.0).contains(&skip) {
            return Err(Error::InvalidParam {
                key: "skip".to_string(),
                value: skip.to_string(),
            });
        }

        Ok(Self {
            path: PathBuf::from(path),
            mode,
            speed: PlaybackSpeed::from_multiplier(speed),
            delay,
            verbose: url.get_bool("verbose", false)?,
            skip,
        })
    }
}

/// Event log replay or recording.
pub struct FileProvider {
    url: LcmUrl,
    options: FileOptions,
    writer: Mutex<Option<EventLogWriter>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<StopSignal>,
    warned_read_only: AtomicBool,
    closed: AtomicBool,
}

impl FileProvider {
    pub fn new(url: &LcmUrl, sink: Arc<dyn MessageSink>) -> Result<Self> {
        let options = FileOptions::from_url(url)?;
        let stop = Arc::new(StopSignal::new());

        let (writer, worker) = match options.mode {
            FileMode::Read => {
                let reader = EventLogReader::open(&options.path)?;
                tracing::debug!(
                    "[FILE] replaying {} ({} bytes) speed={:?}",
                    options.path.display(),
                    reader.len(),
                    options.speed
                );
                let replay = Replay {
                    reader,
                    sink,
                    stop: Arc::clone(&stop),
                    options: options.clone(),
                };
                (None, Some(spawn_worker("lcm-file-replay", move || replay.run())?))
            }
            FileMode::Write => (Some(EventLogWriter::create(&options.path)?), None),
            FileMode::Append => (Some(EventLogWriter::append(&options.path)?), None),
        };

        Ok(Self {
            url: url.clone(),
            options,
            writer: Mutex::new(writer),
            worker: Mutex::new(worker),
            stop,
            warned_read_only: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &FileOptions {
        &self.options
    }
}

impl Provider for FileProvider {
    fn publish(&self, channel: &str, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        let Some(log) = writer.as_mut() else {
            if self.options.mode == FileMode::Read
                && !self.warned_read_only.swap(true, Ordering::Relaxed)
            {
                tracing::warn!(
                    "[FILE] {} is open for replay; publish is ignored",
                    self.options.path.display()
                );
            }
            return Ok(());
        };
        match log.write_event(timestamp_now(), channel, data) {
            Ok(_) => Ok(()),
            Err(e @ Error::RecordTooLarge { .. }) => Err(e),
            Err(e) => {
                tracing::warn!("[FILE] write to {} failed: {}", log.path().display(), e);
                Ok(())
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|h| h.is_finished())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop.stop();
        join_worker(self.worker.lock().take(), "file replay");
        if let Some(mut log) = self.writer.lock().take() {
            if let Err(e) = log.flush() {
                tracing::warn!("[FILE] flush of {} failed: {}", log.path().display(), e);
            }
        }
    }

    fn url(&self) -> &LcmUrl {
        &self.url
    }
}

impl Drop for FileProvider {
    fn drop(&mut self) {
        self.close();
    }
}

// ===== Replay thread =====

struct Replay {
    reader: EventLogReader,
    sink: Arc<dyn MessageSink>,
    stop: Arc<StopSignal>,
    options: FileOptions,
}

impl Replay {
    fn run(mut self) {
        while self.sink.num_subscriptions() == 0 {
            if self.stop.sleep(SUBSCRIBER_POLL) {
                return;
            }
        }
        if self.stop.sleep(self.options.delay) {
            return;
        }
        if self.options.skip > 0.0 {
            if let Err(e) = self.reader.seek_to_position(self.options.skip) {
                tracing::error!("[FILE] seek in {} failed: {}", self.options.path.display(), e);
                return;
            }
        }

        let mut last_utime: Option<i64> = None;
        let mut pending_delay = 0.0f64;
        let mut last_wall = Instant::now();
        let mut report = Instant::now();
        let mut since_report = 0u64;

        while !self.stop.is_stopped() {
            let event = match self.reader.read_next_event() {
                Ok(Some(event)) => event,
                Ok(None) => {
                    tracing::info!("[FILE] end of log {}", self.options.path.display());
                    return;
                }
                Err(e) => {
                    tracing::error!("[FILE] read from {} failed: {}", self.options.path.display(), e);
                    return;
                }
            };

            if let Some(last) = last_utime {
                pending_delay += self.options.speed.delay_for(event.utime.saturating_sub(last));
                pending_delay = pending_delay.min(MAX_SLEEP);
            }
            last_utime = Some(event.utime);

            let now = Instant::now();
            pending_delay -= now.duration_since(last_wall).as_secs_f64();
            last_wall = now;
            if pending_delay > MIN_SLEEP && self.stop.sleep(Duration::from_secs_f64(pending_delay)) {
                return;
            }

            self.sink.deliver(ReceivedMessage::with_utime(
                event.channel,
                event.data,
                event.utime,
            ));

            since_report += 1;
            if self.options.verbose && report.elapsed() >= Duration::from_secs(1) {
                let position = self.reader.position_fraction().unwrap_or(0.0);
                tracing::info!(
                    "[FILE] {:.1} msg/s, {:.1}% of {}",
                    since_report as f64 / report.elapsed().as_secs_f64(),
                    position * 100.0,
                    self.options.path.display()
                );
                report = Instant::now();
                since_report = 0;
            }
        }
    }
}
