// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! LCM event log files.
//!
//! # Record Format
//!
//! ```text
//! +-----------+------------------+------------+-----------------+--------------+
//! | magic (4) | event_number (8) | utime (8)  | channel_len (4) | data_len (4) |
//! +-----------+------------------+------------+-----------------+--------------+
//! | channel (channel_len)        | data (data_len)                             |
//! +------------------------------+---------------------------------------------+
//! ```
//!
//! Big-endian throughout. There is no file header or index: readers scan for
//! the magic byte by byte, which also lets them resynchronise after a
//! corrupt or truncated record and seek to an arbitrary byte offset.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Record sync word.
pub const LOG_MAGIC: u32 = 0xEDA1_DA01;

/// Fixed part of a record after the magic.
pub const RECORD_HEADER_SIZE: usize = 4 + 8 + 8 + 4 + 4;

/// Longest channel name accepted by readers and writers.
pub const MAX_CHANNEL_LEN: usize = 999;

/// Largest payload accepted by readers and writers (256 MiB).
pub const MAX_DATA_LEN: usize = 256 * 1024 * 1024;

/// One log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_number: i64,
    /// Microseconds since the Unix epoch.
    pub utime: i64,
    pub channel: String,
    pub data: Vec<u8>,
}

// ===== Reader =====

/// Sequential event log reader with resync and seeking.
pub struct EventLogReader {
    reader: BufReader<File>,
    path: PathBuf,
    len: u64,
    corrupt_records: u64,
}

impl EventLogReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::new(file),
            path: path.as_ref().to_path_buf(),
            len,
            corrupt_records: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File size in bytes when opened.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Records skipped because their header failed validation.
    pub fn corrupt_records(&self) -> u64 {
        self.corrupt_records
    }

    pub fn position(&mut self) -> Result<u64> {
        Ok(self.reader.stream_position()?)
    }

    /// Current position as a fraction of the file size.
    pub fn position_fraction(&mut self) -> Result<f64> {
        if self.len == 0 {
            return Ok(0.0);
        }
        Ok(self.position()? as f64 / self.len as f64)
    }

    /// Next valid record, or `None` at end of file.
    ///
    /// Corrupt records are skipped. A record cut short by end of file is
    /// treated as end of file.
    pub fn read_next_event(&mut self) -> Result<Option<Event>> {
        Ok(self.next_record()?.map(|(_, event)| event))
    }

    /// Jump to `fraction` (0.0..=1.0) of the file; the next read resyncs.
    pub fn seek_to_position(&mut self, fraction: f64) -> Result<()> {
        let fraction = fraction.clamp(0.0, 1.0);
        let pos = (fraction * self.len as f64) as u64;
        self.reader.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    /// Position before the first record with `utime >= target`.
    ///
    /// Binary search over byte offsets; assumes timestamps are
    /// non-decreasing through the file.
    pub fn seek_to_timestamp(&mut self, target: i64) -> Result<()> {
        let (mut lo, mut hi) = (0u64, self.len);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            self.reader.seek(SeekFrom::Start(mid))?;
            match self.next_record()? {
                Some((_, event)) if event.utime < target => lo = mid + 1,
                _ => hi = mid,
            }
        }
        self.reader.seek(SeekFrom::Start(lo))?;
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<(u64, Event)>> {
        loop {
            let Some(start) = self.sync()? else {
                return Ok(None);
            };
            match self.read_record_body() {
                Ok(Some(event)) => return Ok(Some((start, event))),
                Ok(None) => {
                    self.corrupt_records += 1;
                    tracing::debug!(
                        "{}: corrupt record at offset {}, resyncing",
                        self.path.display(),
                        start
                    );
                    self.reader.seek(SeekFrom::Start(start + 4))?;
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    tracing::debug!(
                        "{}: truncated record at offset {}",
                        self.path.display(),
                        start
                    );
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Consume bytes up to and including the next magic; returns its offset.
    fn sync(&mut self) -> Result<Option<u64>> {
        let mut word: u32 = 0;
        let mut consumed = 0u64;
        let origin = self.reader.stream_position()?;
        loop {
            let mut byte = [0u8; 1];
            match self.reader.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            consumed += 1;
            word = (word << 8) | u32::from(byte[0]);
            if consumed >= 4 && word == LOG_MAGIC {
                return Ok(Some(origin + consumed - 4));
            }
        }
    }

    /// Read a record after its magic. `Ok(None)` means the header is invalid.
    fn read_record_body(&mut self) -> io::Result<Option<Event>> {
        let event_number = self.reader.read_i64::<BigEndian>()?;
        let utime = self.reader.read_i64::<BigEndian>()?;
        let channel_len = self.reader.read_i32::<BigEndian>()?;
        let data_len = self.reader.read_i32::<BigEndian>()?;

        if channel_len <= 0 || channel_len as usize > MAX_CHANNEL_LEN {
            return Ok(None);
        }
        if data_len < 0 || data_len as usize > MAX_DATA_LEN {
            return Ok(None);
        }

        let mut channel = vec![0u8; channel_len as usize];
        self.reader.read_exact(&mut channel)?;
        let Ok(channel) = String::from_utf8(channel) else {
            return Ok(None);
        };

        let mut data = vec![0u8; data_len as usize];
        self.reader.read_exact(&mut data)?;

        Ok(Some(Event {
            event_number,
            utime,
            channel,
            data,
        }))
    }
}

impl Iterator for EventLogReader {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next_event().transpose()
    }
}

// ===== Writer =====

/// Event log writer; assigns increasing event numbers.
pub struct EventLogWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    next_event_number: i64,
    bytes_written: u64,
}

impl EventLogWriter {
    /// Create or truncate `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        Ok(Self::from_file(file, path.as_ref()))
    }

    /// Open `path` for appending, creating it if missing.
    ///
    /// Event numbers restart at zero.
    pub fn append<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self::from_file(file, path.as_ref()))
    }

    fn from_file(file: File, path: &Path) -> Self {
        Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            next_event_number: 0,
            bytes_written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written through this writer.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Append a record; returns its event number.
    ///
    /// Records a reader would reject as corrupt are refused with
    /// [`Error::RecordTooLarge`] and nothing is written.
    pub fn write_event(&mut self, utime: i64, channel: &str, data: &[u8]) -> Result<i64> {
        if channel.is_empty() || channel.len() > MAX_CHANNEL_LEN || data.len() > MAX_DATA_LEN {
            return Err(Error::RecordTooLarge {
                channel_len: channel.len(),
                data_len: data.len(),
            });
        }
        let event_number = self.next_event_number;
        let w = &mut self.writer;
        w.write_u32::<BigEndian>(LOG_MAGIC)?;
        w.write_i64::<BigEndian>(event_number)?;
        w.write_i64::<BigEndian>(utime)?;
        w.write_i32::<BigEndian>(channel.len() as i32)?;
        w.write_i32::<BigEndian>(data.len() as i32)?;
        w.write_all(channel.as_bytes())?;
        w.write_all(data)?;

        self.next_event_number += 1;
        self.bytes_written += (RECORD_HEADER_SIZE + channel.len() + data.len()) as u64;
        Ok(event_number)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for EventLogWriter {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!("{}: flush on close failed: {}", self.path.display(), e);
        }
    }
}
