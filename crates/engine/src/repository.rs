//! Repository lifecycle
//!
//! A [`Repository`] owns one store, its commit log and the background
//! workers, and hands out [`View`]s. Opening goes through
//! [`RepositoryBuilder`]:
//!
//! 1. refuse a second open of the same directory (process registry plus an
//!    `fs2` lock file)
//! 2. check the format version and password digest in `itemdb.meta`
//! 3. refuse an unclean directory unless recovery was asked for
//! 4. rebuild the store from the newest snapshot and the log above it
//! 5. start the checkpoint and indexer threads
//!
//! In-memory repositories skip every step that touches disk.

use crate::config::{RepositoryConfig, CONFIG_FILE_NAME};
use crate::shared::{Comparator, Shared};
use crate::view::View;
use crate::workers::{catch_up, CheckpointWorker, Indexer};
use itemdb_concurrency::{retry_on_deadlock, MergeRegistry, Mergeable};
use itemdb_core::{CommitRecord, ItemDbError, Result, Schema, TypeCatalog, Version};
use itemdb_durability::{
    copy_tree, recover, DurabilityError, RepoLayout, RepoMeta, WalWriter,
};
use itemdb_storage::{CompactionStats, FaultInjector, Store, StoreConfig, StoreImage};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Repositories open in this process, by canonical path
static OPEN_REPOSITORIES: Lazy<Mutex<HashMap<PathBuf, Weak<Shared>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn password_digest(password: &str) -> String {
    Sha256::digest(password.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

// ============================================================================
// Builder
// ============================================================================

/// Options for opening or creating a repository
pub struct RepositoryBuilder {
    path: Option<PathBuf>,
    schema: Schema,
    catalog: TypeCatalog,
    comparators: HashMap<String, Comparator>,
    merges: MergeRegistry,
    config: Option<RepositoryConfig>,
    create: bool,
    recover: bool,
    password: Option<String>,
    restore_from: Option<PathBuf>,
}

impl Default for RepositoryBuilder {
    fn default() -> Self {
        Self {
            path: None,
            schema: Schema::new(),
            catalog: TypeCatalog::builtin(),
            comparators: HashMap::new(),
            merges: MergeRegistry::new(),
            config: None,
            create: false,
            recover: false,
            password: None,
            restore_from: None,
        }
    }
}

impl RepositoryBuilder {
    /// Start with defaults: no path, empty schema, built-in types
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository directory
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Item kinds and their attributes
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Value types; defaults to [`TypeCatalog::builtin`]
    pub fn catalog(mut self, catalog: TypeCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Register a comparison method for comparator-sorted indexes
    pub fn comparator(mut self, method: impl Into<String>, comparator: Comparator) -> Self {
        self.comparators.insert(method.into(), comparator);
        self
    }

    /// Register a merge hook for items of `kind`
    pub fn mergeable(mut self, kind: impl Into<String>, mergeable: Arc<dyn Mergeable>) -> Self {
        self.merges.register(kind, mergeable);
        self
    }

    /// Use this configuration instead of the directory's `itemdb.toml`.
    /// It is written back to the directory on open.
    pub fn config(mut self, config: RepositoryConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Create the repository when the directory holds none
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Allow opening a directory that was not closed cleanly
    pub fn recover(mut self, recover: bool) -> Self {
        self.recover = recover;
        self
    }

    /// Password checked against (or stored in, on create) the metadata
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Copy a backup into the (new) repository directory before opening
    pub fn restore_from(mut self, backup: impl Into<PathBuf>) -> Self {
        self.restore_from = Some(backup.into());
        self
    }

    /// Open without a directory; nothing survives the process
    pub fn in_memory(self) -> Result<Repository> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let store = Arc::new(Store::new(StoreConfig {
            lock_timeout: config.lock_timeout(),
        }));
        let shared = Arc::new(Shared::new(
            store,
            self.schema,
            self.catalog,
            self.comparators,
            self.merges,
            config,
            None,
            None,
        ));
        debug!(target: "itemdb::repo", "Opened in-memory repository");
        Ok(Repository::start(shared, None, None))
    }

    /// Open the repository at the configured path
    pub fn open(self) -> Result<Repository> {
        let start = Instant::now();
        let path = self
            .path
            .clone()
            .ok_or_else(|| ItemDbError::InvalidOperation("no repository path given".into()))?;

        if let Some(backup) = &self.restore_from {
            if RepoLayout::new(&path).exists() {
                return Err(ItemDbError::OpenDenied(format!(
                    "cannot restore into '{}': a repository already exists there",
                    path.display()
                )));
            }
            if !RepoLayout::new(backup).exists() {
                return Err(ItemDbError::OpenDenied(format!(
                    "'{}' is not a repository backup",
                    backup.display()
                )));
            }
            let bytes = copy_tree(backup, &path)?;
            info!(
                target: "itemdb::repo",
                from = %backup.display(),
                to = %path.display(),
                bytes,
                "Restored backup"
            );
        }

        let layout = RepoLayout::new(&path);
        let created = !layout.exists();
        if created {
            if !self.create {
                return Err(ItemDbError::OpenDenied(format!(
                    "no repository at '{}'",
                    path.display()
                )));
            }
            layout.create_dirs()?;
        }
        let root = path.canonicalize()?;
        let layout = RepoLayout::new(&root);

        // held until the repository is registered
        let mut registry = OPEN_REPOSITORIES.lock();
        if registry.get(&root).map_or(false, |w| w.upgrade().is_some()) {
            return Err(ItemDbError::OpenDenied(format!(
                "repository at '{}' is already open in this process",
                root.display()
            )));
        }
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(layout.lock_file())?;
        fs2::FileExt::try_lock_exclusive(&lock_file).map_err(|_| {
            ItemDbError::OpenDenied(format!(
                "repository at '{}' is in use by another process",
                root.display()
            ))
        })?;

        if created {
            let digest = self.password.as_deref().map(password_digest);
            RepoMeta::new(uuid::Uuid::new_v4().to_string(), digest).store(&layout.meta_file())?;
        }
        let meta = RepoMeta::load(&layout.meta_file()).map_err(|e| match e {
            DurabilityError::FormatVersion { expected, found } => {
                ItemDbError::VersionMismatch { expected, found }
            }
            other => other.into(),
        })?;
        if let Some(expected) = &meta.password_digest {
            let given = self.password.as_deref().map(password_digest);
            if given.as_ref() != Some(expected) {
                return Err(ItemDbError::PermissionDenied(format!(
                    "wrong password for repository at '{}'",
                    root.display()
                )));
            }
        }
        if layout.was_left_open() && !self.recover {
            return Err(ItemDbError::RecoveryRequired(format!(
                "repository at '{}' was not closed cleanly",
                root.display()
            )));
        }

        let config_path = root.join(CONFIG_FILE_NAME);
        let config = match self.config {
            Some(config) => {
                config.write_to_file(&config_path)?;
                config
            }
            None => {
                RepositoryConfig::write_default_if_missing(&config_path)?;
                RepositoryConfig::from_file(&config_path)?
            }
        };
        config.validate()?;
        let mode = config.durability_mode()?;

        let store = Arc::new(Store::new(StoreConfig {
            lock_timeout: config.lock_timeout(),
        }));
        let stats = recover::<StoreImage, _, _>(
            &layout,
            |image| {
                store.restore_image(image);
                Ok(())
            },
            |batch| store.replay(batch),
        )?;
        if stats.torn_tail {
            warn!(target: "itemdb::repo", path = %root.display(), "Discarded torn log record");
        }
        let wal = WalWriter::open(&layout.log_dir(), mode)?;
        layout.mark_open()?;

        let shared = Arc::new(Shared::new(
            store,
            self.schema,
            self.catalog,
            self.comparators,
            self.merges,
            config,
            Some(layout),
            Some(wal),
        ));
        registry.insert(root.clone(), Arc::downgrade(&shared));
        drop(registry);

        info!(
            target: "itemdb::repo",
            path = %root.display(),
            id = %meta.repository_id,
            version = shared.store.version(),
            created,
            duration_ms = start.elapsed().as_millis() as u64,
            "Opened repository"
        );
        Ok(Repository::start(shared, Some(root), Some(lock_file)))
    }
}

// ============================================================================
// Repository
// ============================================================================

/// An open repository.
///
/// Closing (or dropping) stops the workers, takes a final checkpoint and
/// clears the unclean-shutdown marker.
pub struct Repository {
    shared: Arc<Shared>,
    root: Option<PathBuf>,
    lock_file: Option<File>,
    checkpointer: Option<(CheckpointWorker, JoinHandle<()>)>,
    indexer: Option<(Indexer, JoinHandle<()>)>,
    closed: bool,
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("root", &self.root)
            .field("version", &self.shared.store.version())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Repository {
    /// Builder for open/create/restore
    pub fn builder() -> RepositoryBuilder {
        RepositoryBuilder::new()
    }

    /// Open an existing repository with an empty schema
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        RepositoryBuilder::new().path(path).open()
    }

    /// Throwaway repository with an empty schema
    pub fn in_memory() -> Result<Self> {
        RepositoryBuilder::new().in_memory()
    }

    fn start(shared: Arc<Shared>, root: Option<PathBuf>, lock_file: Option<File>) -> Self {
        let config = &shared.config;
        let checkpointer = (config.checkpoint_enabled && shared.layout.is_some()).then(|| {
            let worker = CheckpointWorker::new(Arc::clone(&shared), config.checkpoint_interval());
            let handle = worker.start();
            (worker, handle)
        });
        let indexer = config.indexer_enabled.then(|| {
            let worker = Indexer::new(Arc::clone(&shared), config.indexer_poll());
            let handle = worker.start();
            (worker, handle)
        });
        Self {
            shared,
            root,
            lock_file,
            checkpointer,
            indexer,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(ItemDbError::InvalidOperation("repository is closed".into()));
        }
        Ok(())
    }

    /// Directory, or `None` in memory
    pub fn path(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Active configuration
    pub fn config(&self) -> &RepositoryConfig {
        &self.shared.config
    }

    /// Item kinds known to this repository
    pub fn schema(&self) -> &Schema {
        &self.shared.schema
    }

    /// Latest committed version
    pub fn version(&self) -> Version {
        self.shared.store.version()
    }

    /// Oldest version still held in history
    pub fn history_floor(&self) -> Version {
        self.shared.store.history_floor()
    }

    /// Open a view at the latest version
    pub fn view(&self, name: &str) -> Result<View> {
        self.ensure_open()?;
        Ok(View::open(Arc::clone(&self.shared), name))
    }

    /// Names of the views currently open, sorted
    pub fn open_views(&self) -> Vec<String> {
        self.shared.view_names()
    }

    /// Commit records in `(from, to]`
    pub fn history(&self, from: Version, to: Version) -> Result<Vec<CommitRecord>> {
        self.shared.store.iter_history(from, to)
    }

    /// Storage failure injection, for tests
    pub fn faults(&self) -> &FaultInjector {
        self.shared.store.faults()
    }

    /// Snapshot now and archive the log it covers. Returns the version
    /// written, or `None` in memory.
    pub fn checkpoint(&self) -> Result<Option<Version>> {
        self.ensure_open()?;
        self.shared.checkpoint()
    }

    fn paused<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if let Some((worker, _)) = &self.checkpointer {
            worker.pause();
        }
        let result = f();
        if let Some((worker, _)) = &self.checkpointer {
            worker.resume();
        }
        result
    }

    /// Checkpoint, then copy the repository directory to `target`.
    ///
    /// The copy opens with [`RepositoryBuilder::restore_from`] or directly.
    pub fn backup(&self, target: &Path) -> Result<Version> {
        self.ensure_open()?;
        let root = self.root.as_deref().ok_or_else(|| {
            ItemDbError::InvalidOperation("an in-memory repository has no directory to back up".into())
        })?;
        if target.starts_with(root) {
            return Err(ItemDbError::InvalidOperation(format!(
                "backup target '{}' is inside the repository",
                target.display()
            )));
        }
        self.paused(|| {
            let version = self.shared.checkpoint()?.unwrap_or_else(|| self.version());
            let bytes = copy_tree(root, target)?;
            info!(
                target: "itemdb::repo",
                to = %target.display(),
                version,
                bytes,
                "Backup complete"
            );
            Ok(version)
        })
    }

    /// Collapse history no open view still needs
    pub fn compact(&self) -> Result<CompactionStats> {
        self.ensure_open()?;
        self.paused(|| {
            retry_on_deadlock(&self.shared.config.retry, "compact", |_| {
                self.shared.store.compact(self.version())
            })
        })
    }

    /// Roll every container back to `version` and persist the rollback.
    ///
    /// Fails while a view is open above `version`.
    pub fn undo(&self, version: Version) -> Result<usize> {
        self.ensure_open()?;
        self.paused(|| {
            let before = self.version();
            let removed = retry_on_deadlock(&self.shared.config.retry, "undo", |_| {
                self.shared.store.undo(version)
            })?;
            if self.version() < before {
                self.shared.persist_undo()?;
            }
            Ok(removed)
        })
    }

    /// Run one indexing round now; returns the versions indexed
    pub fn index_now(&self) -> Result<usize> {
        self.ensure_open()?;
        catch_up(&self.shared)
    }

    /// Version the full-text index has caught up to
    pub fn indexed_version(&self) -> Version {
        self.shared.store.text().indexed_version()
    }

    /// Stop the workers, checkpoint, and release the directory.
    ///
    /// Refused while views are open.
    pub fn close(mut self) -> Result<()> {
        let open = self.shared.view_names();
        if !open.is_empty() {
            return Err(ItemDbError::InvalidOperation(format!(
                "cannot close with open views: {}",
                open.join(", ")
            )));
        }
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some((worker, handle)) = self.checkpointer.take() {
            worker.shutdown();
            if handle.join().is_err() {
                warn!(target: "itemdb::checkpoint", "Checkpoint thread panicked");
            }
        }
        if let Some((worker, handle)) = self.indexer.take() {
            worker.shutdown();
            if handle.join().is_err() {
                warn!(target: "itemdb::indexer", "Indexer thread panicked");
            }
        }

        let result = self.release();
        if let Some(root) = &self.root {
            OPEN_REPOSITORIES.lock().remove(root);
            info!(target: "itemdb::repo", path = %root.display(), "Closed repository");
        }
        self.lock_file = None;
        result
    }

    fn release(&self) -> Result<()> {
        let Some(layout) = &self.shared.layout else {
            return Ok(());
        };
        self.shared.checkpoint()?;
        if let Some(wal) = self.shared.wal.lock().as_mut() {
            wal.sync()?;
        }
        layout.mark_closed()?;
        Ok(())
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(target: "itemdb::repo", error = %e, "Repository did not close cleanly");
        }
    }
}
