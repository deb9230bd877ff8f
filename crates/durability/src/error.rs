//! Durability errors

use itemdb_core::ItemDbError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by log, snapshot and layout code
#[derive(Debug, Error)]
pub enum DurabilityError {
    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record or snapshot payload could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// Checksum or framing failure
    #[error("Corrupt {path}: {reason}")]
    Corrupt {
        /// Offending file
        path: PathBuf,
        /// What failed
        reason: String,
    },

    /// On-disk format written by another build
    #[error("Format version {found} not supported (expected {expected})")]
    FormatVersion {
        /// Supported version
        expected: u32,
        /// Version on disk
        found: u32,
    },

    /// Unknown durability mode string
    #[error("Invalid durability mode '{0}'. Expected \"standard\", \"always\" or \"cache\"")]
    InvalidMode(String),
}

impl From<rmp_serde::encode::Error> for DurabilityError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        DurabilityError::Codec(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for DurabilityError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        DurabilityError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for DurabilityError {
    fn from(e: serde_json::Error) -> Self {
        DurabilityError::Codec(e.to_string())
    }
}

impl From<DurabilityError> for ItemDbError {
    fn from(e: DurabilityError) -> Self {
        match e {
            DurabilityError::Io(io) => ItemDbError::Io(io),
            DurabilityError::Codec(msg) => ItemDbError::Serialization(msg),
            DurabilityError::Corrupt { path, reason } => {
                ItemDbError::Corruption(format!("{}: {}", path.display(), reason))
            }
            DurabilityError::FormatVersion { expected, found } => {
                ItemDbError::VersionMismatch { expected, found }
            }
            DurabilityError::InvalidMode(mode) => {
                ItemDbError::InvalidOperation(format!("invalid durability mode '{}'", mode))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_maps_to_corruption() {
        let err: ItemDbError = DurabilityError::Corrupt {
            path: PathBuf::from("log-000001.seg"),
            reason: "crc mismatch".into(),
        }
        .into();
        let msg = err.to_string();
        assert!(msg.contains("Data corruption"));
        assert!(msg.contains("crc mismatch"));
    }

    #[test]
    fn test_format_version_maps_to_mismatch() {
        let err: ItemDbError = DurabilityError::FormatVersion {
            expected: 1,
            found: 9,
        }
        .into();
        assert!(matches!(err, ItemDbError::VersionMismatch { expected: 1, found: 9 }));
    }
}
