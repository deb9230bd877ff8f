//! Repository directory layout and metadata
//!
//! ```text
//! <root>/
//!   itemdb.meta        format version, repository id, password digest
//!   itemdb.toml        configuration (owned by the engine)
//!   .lock              exclusive-open lock file
//!   __open             present while the repository is open
//!   log/               active commit log segments
//!   archive/           log segments superseded by a checkpoint
//!   snapshots/         checkpoint snapshots
//! ```

use crate::error::DurabilityError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// On-disk format version written by this build
pub const FORMAT_VERSION: u32 = 1;

/// Metadata file name
pub const META_FILE_NAME: &str = "itemdb.meta";

/// Paths inside a repository directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLayout {
    root: PathBuf,
}

impl RepoLayout {
    /// Layout rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Repository directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Active log segments
    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    /// Archived log segments
    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    /// Checkpoint snapshots
    pub fn snapshot_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    /// Exclusive-open lock file
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    /// Unclean-shutdown marker
    pub fn open_marker(&self) -> PathBuf {
        self.root.join("__open")
    }

    /// Metadata file
    pub fn meta_file(&self) -> PathBuf {
        self.root.join(META_FILE_NAME)
    }

    /// True when the metadata file exists
    pub fn exists(&self) -> bool {
        self.meta_file().exists()
    }

    /// Create every directory
    pub fn create_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(self.log_dir())?;
        fs::create_dir_all(self.archive_dir())?;
        fs::create_dir_all(self.snapshot_dir())?;
        Ok(())
    }

    /// Drop the unclean-shutdown marker
    pub fn mark_open(&self) -> io::Result<()> {
        fs::write(self.open_marker(), Utc::now().to_rfc3339())
    }

    /// Remove the unclean-shutdown marker
    pub fn mark_closed(&self) -> io::Result<()> {
        match fs::remove_file(self.open_marker()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// True when the previous session did not close cleanly
    pub fn was_left_open(&self) -> bool {
        self.open_marker().exists()
    }
}

/// Contents of `itemdb.meta`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoMeta {
    /// Format version the repository was written with
    pub format_version: u32,
    /// Stable repository id
    pub repository_id: String,
    /// Creation time
    pub created: DateTime<Utc>,
    /// Hex digest of the password, if the repository has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_digest: Option<String>,
}

impl RepoMeta {
    /// Fresh metadata for this build's format
    pub fn new(repository_id: impl Into<String>, password_digest: Option<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            repository_id: repository_id.into(),
            created: Utc::now(),
            password_digest,
        }
    }

    /// Read and check the format version
    pub fn load(path: &Path) -> Result<Self, DurabilityError> {
        let bytes = fs::read(path)?;
        let meta: RepoMeta = serde_json::from_slice(&bytes)?;
        if meta.format_version != FORMAT_VERSION {
            return Err(DurabilityError::FormatVersion {
                expected: FORMAT_VERSION,
                found: meta.format_version,
            });
        }
        Ok(meta)
    }

    /// Write atomically
    pub fn store(&self, path: &Path) -> Result<(), DurabilityError> {
        let tmp = path.with_extension("meta.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Recursively copy `src` into `dst`, creating `dst`.
///
/// Lock and open-marker files are skipped.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<u64> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == ".lock" || name == "__open" {
            continue;
        }
        let target = dst.join(&name);
        if entry.file_type()?.is_dir() {
            copied += copy_tree(&entry.path(), &target)?;
        } else {
            copied += fs::copy(entry.path(), target)?;
        }
    }
    Ok(copied)
}
