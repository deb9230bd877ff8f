//! Checkpoint snapshots
//!
//! A snapshot is the complete store image at one version.
//!
//! # File Layout
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬──────────────┬─────────┬──────────┐
//! │ Magic "ITSN" │ Format (u32) │ Version (u64)│ Length (u64) │ Payload │ CRC32 (4)│
//! └──────────────┴──────────────┴──────────────┴──────────────┴─────────┴──────────┘
//! ```
//!
//! Writes go to a temp file which is fsynced and renamed into place, then
//! the directory is fsynced. A crash mid-write leaves the previous snapshot.

use crate::error::DurabilityError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use itemdb_core::Version;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Magic bytes identifying a snapshot
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"ITSN";

/// Current snapshot format version
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

const HEADER_SIZE: usize = 24;

/// Path of the snapshot for `version` in `dir`
pub fn snapshot_path(dir: &Path, version: Version) -> PathBuf {
    dir.join(format!("snap-{:020}.chk", version))
}

/// Versions with a snapshot in `dir`, ascending
pub fn list_snapshots(dir: &Path) -> Result<Vec<Version>, DurabilityError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut versions = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if let Some(v) = name
            .strip_prefix("snap-")
            .and_then(|s| s.strip_suffix(".chk"))
            .and_then(|s| s.parse::<Version>().ok())
        {
            versions.push(v);
        }
    }
    versions.sort_unstable();
    Ok(versions)
}

/// Newest snapshot version in `dir`
pub fn latest_snapshot(dir: &Path) -> Result<Option<Version>, DurabilityError> {
    Ok(list_snapshots(dir)?.last().copied())
}

/// Write `image` as the snapshot for `version`
pub fn write_snapshot<T: Serialize>(
    dir: &Path,
    version: Version,
    image: &T,
) -> Result<PathBuf, DurabilityError> {
    fs::create_dir_all(dir)?;
    let payload = rmp_serde::to_vec(image)?;

    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len() + 4);
    bytes.extend_from_slice(&SNAPSHOT_MAGIC);
    bytes.write_u32::<LittleEndian>(SNAPSHOT_FORMAT_VERSION)?;
    bytes.write_u64::<LittleEndian>(version)?;
    bytes.write_u64::<LittleEndian>(payload.len() as u64)?;
    bytes.extend_from_slice(&payload);
    let mut hasher = Hasher::new();
    hasher.update(&bytes);
    bytes.write_u32::<LittleEndian>(hasher.finalize())?;

    let path = snapshot_path(dir, version);
    let tmp = path.with_extension("chk.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, &path)?;
    sync_dir(dir)?;

    info!(
        target: "itemdb::checkpoint",
        version,
        bytes = bytes.len(),
        "Wrote snapshot"
    );
    Ok(path)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Read and verify the snapshot for `version`
pub fn read_snapshot<T: DeserializeOwned>(dir: &Path, version: Version) -> Result<T, DurabilityError> {
    let path = snapshot_path(dir, version);
    let mut bytes = Vec::new();
    File::open(&path)?.read_to_end(&mut bytes)?;
    let corrupt = |reason: &str| DurabilityError::Corrupt {
        path: path.clone(),
        reason: reason.to_string(),
    };

    if bytes.len() < HEADER_SIZE + 4 || bytes[0..4] != SNAPSHOT_MAGIC {
        return Err(corrupt("bad snapshot header"));
    }
    let body_len = bytes.len() - 4;
    let stored = u32::from_le_bytes([
        bytes[body_len],
        bytes[body_len + 1],
        bytes[body_len + 2],
        bytes[body_len + 3],
    ]);
    let mut hasher = Hasher::new();
    hasher.update(&bytes[..body_len]);
    if hasher.finalize() != stored {
        return Err(corrupt("checksum mismatch"));
    }

    let mut cursor = Cursor::new(&bytes[4..HEADER_SIZE]);
    let format = cursor.read_u32::<LittleEndian>()?;
    if format != SNAPSHOT_FORMAT_VERSION {
        return Err(DurabilityError::FormatVersion {
            expected: SNAPSHOT_FORMAT_VERSION,
            found: format,
        });
    }
    let stored_version = cursor.read_u64::<LittleEndian>()?;
    if stored_version != version {
        return Err(corrupt("version does not match file name"));
    }
    let len = cursor.read_u64::<LittleEndian>()? as usize;
    if HEADER_SIZE + len != body_len {
        return Err(corrupt("length mismatch"));
    }
    Ok(rmp_serde::from_slice(&bytes[HEADER_SIZE..body_len])?)
}

/// Delete all but the newest `keep` snapshots
pub fn prune_snapshots(dir: &Path, keep: usize) -> Result<usize, DurabilityError> {
    let versions = list_snapshots(dir)?;
    let excess = versions.len().saturating_sub(keep.max(1));
    for version in &versions[..excess] {
        fs::remove_file(snapshot_path(dir, *version))?;
        debug!(target: "itemdb::checkpoint", version, "Pruned snapshot");
    }
    Ok(excess)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn image() -> BTreeMap<String, i64> {
        [("a".to_string(), 1), ("b".to_string(), 2)].into_iter().collect()
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshot(dir.path(), 7, &image()).unwrap();
        assert_eq!(latest_snapshot(dir.path()).unwrap(), Some(7));
        let back: BTreeMap<String, i64> = read_snapshot(dir.path(), 7).unwrap();
        assert_eq!(back, image());
    }

    #[test]
    fn test_flipped_byte_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_snapshot(dir.path(), 3, &image()).unwrap();
        let mut bytes = fs::read(&path).unwrap();
        bytes[HEADER_SIZE + 1] ^= 0x55;
        fs::write(&path, bytes).unwrap();
        let result: Result<BTreeMap<String, i64>, _> = read_snapshot(dir.path(), 3);
        assert!(matches!(result, Err(DurabilityError::Corrupt { .. })));
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for v in [1, 5, 9] {
            write_snapshot(dir.path(), v, &image()).unwrap();
        }
        assert_eq!(prune_snapshots(dir.path(), 2).unwrap(), 1);
        assert_eq!(list_snapshots(dir.path()).unwrap(), vec![5, 9]);
    }

    #[test]
    fn test_empty_dir_has_no_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(latest_snapshot(&dir.path().join("missing")).unwrap(), None);
    }
}
