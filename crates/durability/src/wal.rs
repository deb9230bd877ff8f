//! Write-ahead commit log
//!
//! Segments are named `log-NNNNNN.seg`. Each holds a header followed by one
//! record per committed version.
//!
//! # Segment Layout
//!
//! ```text
//! ┌──────────────┬──────────────────┬────────────────────┐
//! │ Magic "ITDB" │ Format ver (u32) │ Segment no. (u64)  │
//! └──────────────┴──────────────────┴────────────────────┘
//! ```
//!
//! # Record Layout
//!
//! ```text
//! ┌─────────────────┬──────────────────┬──────────────────────┬──────────┐
//! │ Length (4 bytes)│ Format Ver (1)   │ Payload (MessagePack)│ CRC32 (4)│
//! └─────────────────┴──────────────────┴──────────────────────┴──────────┘
//! ```
//!
//! Length covers the format byte and payload. The CRC covers the same
//! bytes. A record cut short at the end of the newest segment is a torn
//! write and is discarded; damage anywhere else is corruption.

use crate::error::DurabilityError;
use crate::mode::DurabilityMode;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use itemdb_core::CommitBatch;
use std::fs::{self, File, OpenOptions};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Magic bytes identifying a log segment
pub const SEGMENT_MAGIC: [u8; 4] = *b"ITDB";

/// Current segment format version
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Size of segment header in bytes
pub const SEGMENT_HEADER_SIZE: usize = 16;

/// Current record format version
pub const RECORD_FORMAT_VERSION: u8 = 1;

/// Path of segment `number` in `dir`
pub fn segment_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("log-{:06}.seg", number))
}

/// Segment numbers present in `dir`, ascending
pub fn list_segments(dir: &Path) -> Result<Vec<u64>, DurabilityError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut numbers = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if let Some(n) = name
            .strip_prefix("log-")
            .and_then(|s| s.strip_suffix(".seg"))
            .and_then(|s| s.parse::<u64>().ok())
        {
            numbers.push(n);
        }
    }
    numbers.sort_unstable();
    Ok(numbers)
}

fn header_bytes(number: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(SEGMENT_HEADER_SIZE);
    out.extend_from_slice(&SEGMENT_MAGIC);
    // writes into a Vec cannot fail
    let _ = out.write_u32::<LittleEndian>(SEGMENT_FORMAT_VERSION);
    let _ = out.write_u64::<LittleEndian>(number);
    out
}

fn check_header(bytes: &[u8], path: &Path) -> Result<(), DurabilityError> {
    if bytes.len() < SEGMENT_HEADER_SIZE || bytes[0..4] != SEGMENT_MAGIC {
        return Err(DurabilityError::Corrupt {
            path: path.to_path_buf(),
            reason: "bad segment header".into(),
        });
    }
    let mut cursor = Cursor::new(&bytes[4..8]);
    let format = cursor.read_u32::<LittleEndian>()?;
    if format != SEGMENT_FORMAT_VERSION {
        return Err(DurabilityError::FormatVersion {
            expected: SEGMENT_FORMAT_VERSION,
            found: format,
        });
    }
    Ok(())
}

/// Frame one batch as a log record
pub fn encode_record(batch: &CommitBatch) -> Result<Vec<u8>, DurabilityError> {
    let payload = rmp_serde::to_vec(batch)?;
    let mut body = Vec::with_capacity(payload.len() + 1);
    body.push(RECORD_FORMAT_VERSION);
    body.extend_from_slice(&payload);

    let mut hasher = Hasher::new();
    hasher.update(&body);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(body.len() + 8);
    out.write_u32::<LittleEndian>(body.len() as u32)?;
    out.extend_from_slice(&body);
    out.write_u32::<LittleEndian>(crc)?;
    Ok(out)
}

/// Outcome of decoding one segment's records
#[derive(Debug)]
pub struct DecodedSegment {
    /// Records in order
    pub batches: Vec<CommitBatch>,
    /// Bytes up to the end of the last good record
    pub valid_len: u64,
    /// True when trailing bytes did not form a complete record
    pub torn: bool,
}

/// Decode the records after a segment header.
///
/// A short or checksum-failing record ends decoding and is reported as torn.
pub fn decode_records(bytes: &[u8], path: &Path) -> Result<DecodedSegment, DurabilityError> {
    check_header(bytes, path)?;
    let mut pos = SEGMENT_HEADER_SIZE;
    let mut batches = Vec::new();
    let mut torn = false;
    while pos < bytes.len() {
        if bytes.len() - pos < 4 {
            torn = true;
            break;
        }
        let len = u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]) as usize;
        let body_start = pos + 4;
        let body_end = body_start + len;
        if len == 0 || body_end + 4 > bytes.len() {
            torn = true;
            break;
        }
        let body = &bytes[body_start..body_end];
        let stored = u32::from_le_bytes([
            bytes[body_end],
            bytes[body_end + 1],
            bytes[body_end + 2],
            bytes[body_end + 3],
        ]);
        let mut hasher = Hasher::new();
        hasher.update(body);
        if hasher.finalize() != stored {
            torn = true;
            break;
        }
        if body[0] != RECORD_FORMAT_VERSION {
            return Err(DurabilityError::FormatVersion {
                expected: RECORD_FORMAT_VERSION as u32,
                found: body[0] as u32,
            });
        }
        let batch: CommitBatch = rmp_serde::from_slice(&body[1..])?;
        batches.push(batch);
        pos = body_end + 4;
    }
    Ok(DecodedSegment {
        batches,
        valid_len: pos as u64,
        torn,
    })
}

/// Everything read back from a log directory
#[derive(Debug, Default)]
pub struct WalReplay {
    /// Records from every segment in order
    pub batches: Vec<CommitBatch>,
    /// Segments read
    pub segments: usize,
    /// The newest segment ended in a torn record
    pub torn_tail: bool,
}

/// Read every segment in `dir`.
///
/// Damage in any segment but the newest is corruption.
pub fn read_log(dir: &Path) -> Result<WalReplay, DurabilityError> {
    let numbers = list_segments(dir)?;
    let mut replay = WalReplay::default();
    for (i, number) in numbers.iter().enumerate() {
        let path = segment_path(dir, *number);
        let bytes = fs::read(&path)?;
        let decoded = decode_records(&bytes, &path)?;
        let newest = i + 1 == numbers.len();
        if decoded.torn {
            if !newest {
                return Err(DurabilityError::Corrupt {
                    path,
                    reason: format!("damaged record at offset {}", decoded.valid_len),
                });
            }
            warn!(
                target: "itemdb::wal",
                segment = number,
                offset = decoded.valid_len,
                "Discarding torn record at log tail"
            );
            replay.torn_tail = true;
        }
        replay.batches.extend(decoded.batches);
        replay.segments += 1;
    }
    Ok(replay)
}

/// Appender for the active segment
pub struct WalWriter {
    dir: PathBuf,
    mode: DurabilityMode,
    file: Option<File>,
    segment: u64,
    unsynced: usize,
    last_sync: Instant,
    last_start: Option<u64>,
}

impl WalWriter {
    /// Open the newest segment for append, creating the first one if needed.
    ///
    /// A torn tail left by a crash is cut off so new records follow the
    /// last good one. In Cache mode no file is touched.
    pub fn open(dir: &Path, mode: DurabilityMode) -> Result<Self, DurabilityError> {
        let mut writer = Self {
            dir: dir.to_path_buf(),
            mode,
            file: None,
            segment: 0,
            unsynced: 0,
            last_sync: Instant::now(),
            last_start: None,
        };
        if !mode.requires_wal() {
            return Ok(writer);
        }
        fs::create_dir_all(dir)?;
        match list_segments(dir)?.last().copied() {
            Some(number) => {
                let path = segment_path(dir, number);
                let bytes = fs::read(&path)?;
                let decoded = decode_records(&bytes, &path)?;
                let file = OpenOptions::new().read(true).write(true).open(&path)?;
                if decoded.torn {
                    file.set_len(decoded.valid_len)?;
                    file.sync_all()?;
                }
                let mut file = file;
                std::io::Seek::seek(&mut file, std::io::SeekFrom::End(0))?;
                writer.file = Some(file);
                writer.segment = number;
            }
            None => writer.start_segment(1)?,
        }
        Ok(writer)
    }

    fn start_segment(&mut self, number: u64) -> Result<(), DurabilityError> {
        let path = segment_path(&self.dir, number);
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.write_all(&header_bytes(number))?;
        file.sync_all()?;
        self.file = Some(file);
        self.segment = number;
        debug!(target: "itemdb::wal", segment = number, "Started log segment");
        Ok(())
    }

    /// Active segment number (0 in Cache mode)
    pub fn segment(&self) -> u64 {
        self.segment
    }

    /// Durability mode
    pub fn mode(&self) -> DurabilityMode {
        self.mode
    }

    /// Append one committed version
    pub fn append(&mut self, batch: &CommitBatch) -> Result<(), DurabilityError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        let record = encode_record(batch)?;
        let start = std::io::Seek::stream_position(file)?;
        file.write_all(&record)?;
        self.last_start = Some(start);
        self.unsynced += 1;
        match self.mode {
            DurabilityMode::Always => self.sync()?,
            DurabilityMode::Standard {
                interval_ms,
                batch_size,
            } => {
                if self.unsynced >= batch_size
                    || self.last_sync.elapsed() >= Duration::from_millis(interval_ms)
                {
                    self.sync()?;
                }
            }
            DurabilityMode::Cache => {}
        }
        Ok(())
    }

    /// Force appended records to disk
    pub fn sync(&mut self) -> Result<(), DurabilityError> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
            file.sync_data()?;
        }
        self.unsynced = 0;
        self.last_sync = Instant::now();
        Ok(())
    }

    /// Cut the most recent record off the active segment.
    ///
    /// A commit that fails after its record was appended never happened;
    /// leaving the record would let recovery resurrect it.
    pub fn discard_last(&mut self) -> Result<bool, DurabilityError> {
        let (Some(file), Some(start)) = (self.file.as_mut(), self.last_start.take()) else {
            return Ok(false);
        };
        file.set_len(start)?;
        std::io::Seek::seek(file, std::io::SeekFrom::Start(start))?;
        file.sync_all()?;
        debug!(target: "itemdb::wal", segment = self.segment, offset = start, "Discarded last record");
        Ok(true)
    }

    /// Delete every closed segment
    pub fn discard_closed(&self) -> Result<usize, DurabilityError> {
        if self.file.is_none() {
            return Ok(0);
        }
        let mut removed = 0;
        for number in list_segments(&self.dir)? {
            if number < self.segment {
                fs::remove_file(segment_path(&self.dir, number))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Close the active segment and start the next one
    pub fn rotate(&mut self) -> Result<u64, DurabilityError> {
        if self.file.is_none() {
            return Ok(self.segment);
        }
        self.sync()?;
        self.last_start = None;
        let next = self.segment + 1;
        self.start_segment(next)?;
        Ok(next)
    }

    /// Move every closed segment into `archive_dir`
    pub fn archive_closed(&self, archive_dir: &Path) -> Result<usize, DurabilityError> {
        if self.file.is_none() {
            return Ok(0);
        }
        fs::create_dir_all(archive_dir)?;
        let mut moved = 0;
        for number in list_segments(&self.dir)? {
            if number >= self.segment {
                continue;
            }
            let from = segment_path(&self.dir, number);
            let to = segment_path(archive_dir, number);
            fs::rename(&from, &to)?;
            moved += 1;
        }
        if moved > 0 {
            info!(target: "itemdb::wal", moved, "Archived log segments");
        }
        Ok(moved)
    }
}

/// Read a single segment file, for diagnostics
pub fn read_segment(path: &Path) -> Result<DecodedSegment, DurabilityError> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    decode_records(&bytes, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use itemdb_core::{ItemId, Value};

    fn batch(version: u64) -> CommitBatch {
        let mut b = CommitBatch::new(version, "test");
        b.values.push((ItemId::new(), "n".into(), Some(Value::Int(version as i64))));
        b
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = WalWriter::open(dir.path(), DurabilityMode::Always).unwrap();
        for v in 1..=3 {
            writer.append(&batch(v)).unwrap();
        }
        let replay = read_log(dir.path()).unwrap();
        assert_eq!(replay.batches.iter().map(|b| b.version()).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(!replay.torn_tail);
    }

    #[test]
    fn test_cache_mode_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log");
        let mut writer = WalWriter::open(&log, DurabilityMode::Cache).unwrap();
        writer.append(&batch(1)).unwrap();
        assert!(!log.exists());
    }

    #[test]
    fn test_torn_tail_is_discarded_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut writer = WalWriter::open(dir.path(), DurabilityMode::Always).unwrap();
            writer.append(&batch(1)).unwrap();
            writer.append(&batch(2)).unwrap();
        }
        let path = segment_path(dir.path(), 1);
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let replay = read_log(dir.path()).unwrap();
        assert!(replay.torn_tail);
        assert_eq!(replay.batches.len(), 1);

        let mut writer = WalWriter::open(dir.path(), DurabilityMode::Always).unwrap();
        writer.append(&batch(2)).unwrap();
        let replay = read_log(dir.path()).unwrap();
        assert!(!replay.torn_tail);
        assert_eq!(replay.batches.len(), 2);
    }

    #[test]
    fn test_damage_in_closed_segment_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = WalWriter::open(dir.path(), DurabilityMode::Always).unwrap();
        writer.append(&batch(1)).unwrap();
        writer.rotate().unwrap();
        writer.append(&batch(2)).unwrap();
        let path = segment_path(dir.path(), 1);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 6;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();
        assert!(matches!(read_log(dir.path()), Err(DurabilityError::Corrupt { .. })));
    }

    #[test]
    fn test_discard_last_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = WalWriter::open(dir.path(), DurabilityMode::Always).unwrap();
        writer.append(&batch(1)).unwrap();
        writer.append(&batch(2)).unwrap();
        assert!(writer.discard_last().unwrap());
        assert!(!writer.discard_last().unwrap());
        writer.append(&batch(2)).unwrap();
        let versions: Vec<u64> = read_log(dir.path())
            .unwrap()
            .batches
            .iter()
            .map(|b| b.version())
            .collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[test]
    fn test_rotate_and_archive() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log");
        let archive = dir.path().join("archive");
        let mut writer = WalWriter::open(&log, DurabilityMode::Always).unwrap();
        writer.append(&batch(1)).unwrap();
        assert_eq!(writer.rotate().unwrap(), 2);
        assert_eq!(writer.archive_closed(&archive).unwrap(), 1);
        assert_eq!(list_segments(&log).unwrap(), vec![2]);
        assert_eq!(list_segments(&archive).unwrap(), vec![1]);
        assert!(read_log(&log).unwrap().batches.is_empty());
    }

    #[test]
    fn test_bad_header() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(segment_path(dir.path(), 1), b"garbage-header-bytes").unwrap();
        assert!(read_log(dir.path()).is_err());
    }
}
