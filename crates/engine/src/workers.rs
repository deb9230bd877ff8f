//! Background workers
//!
//! Two threads run beside the views, each in the same shape: sleep in
//! short slices so shutdown is noticed quickly, then do one round of work
//! through the normal locked paths.
//!
//! - [`CheckpointWorker`]: periodic snapshot plus log archival
//! - [`Indexer`]: keeps the full-text index caught up with committed history

use crate::shared::Shared;
use crate::text::{tokenize_unique, value_text};
use crate::view::View;
use itemdb_concurrency::{retry_on_deadlock, Decline};
use itemdb_core::{ItemChange, ItemDbError, ItemId, ItemStatus, Result, Version};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Sleep `interval` in slices, returning false once shutdown is signaled
fn idle(shutdown: &AtomicBool, interval: Duration) -> bool {
    let slice = Duration::from_millis(100).min(interval);
    let mut elapsed = Duration::ZERO;
    while elapsed < interval {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        thread::sleep(slice);
        elapsed += slice;
    }
    !shutdown.load(Ordering::Relaxed)
}

// ============================================================================
// Checkpoint
// ============================================================================

/// Periodic checkpoint thread
pub struct CheckpointWorker {
    shared: Arc<Shared>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

impl CheckpointWorker {
    pub(crate) fn new(shared: Arc<Shared>, interval: Duration) -> Self {
        Self {
            shared,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the thread; it runs until [`Self::shutdown`]
    pub fn start(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let shutdown = Arc::clone(&self.shutdown);
        let paused = Arc::clone(&self.paused);
        let interval = self.interval;

        thread::spawn(move || {
            while idle(&shutdown, interval) {
                if paused.load(Ordering::Acquire) {
                    debug!(target: "itemdb::checkpoint", "Checkpoint skipped while paused");
                    continue;
                }
                if let Err(e) = shared.checkpoint() {
                    warn!(target: "itemdb::checkpoint", error = %e, "Background checkpoint failed");
                }
            }
        })
    }

    /// Skip rounds until [`Self::resume`]
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Undo [`Self::pause`]
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    /// True while paused
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Signal the thread to exit
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Check if shutdown has been signaled
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Indexer
// ============================================================================

/// Full-text catch-up thread.
///
/// Replays committed history version by version in its own view and
/// feeds indexed attributes to the store's text index. It lags behind
/// commits and never holds the write lock.
pub struct Indexer {
    shared: Arc<Shared>,
    poll: Duration,
    shutdown: Arc<AtomicBool>,
}

impl Indexer {
    pub(crate) fn new(shared: Arc<Shared>, poll: Duration) -> Self {
        Self {
            shared,
            poll,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the thread; it runs until [`Self::shutdown`]
    pub fn start(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let shutdown = Arc::clone(&self.shutdown);
        let poll = self.poll;

        thread::spawn(move || {
            while idle(&shutdown, poll) {
                if let Err(e) = catch_up(&shared) {
                    warn!(target: "itemdb::indexer", error = %e, "Indexing round failed");
                }
            }
        })
    }

    /// Signal the thread to exit
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Check if shutdown has been signaled
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// Index every version committed since the last round. Returns how many
/// versions were processed.
pub(crate) fn catch_up(shared: &Arc<Shared>) -> Result<usize> {
    let store = &shared.store;
    let text = store.text();
    let latest = store.version();
    let indexed = text.indexed_version();
    if indexed >= latest {
        return Ok(0);
    }
    let mut view = View::open(Arc::clone(shared), "indexer");
    if indexed < store.history_floor() {
        let count = rebuild(shared, &mut view, latest)?;
        view.close();
        return Ok(count);
    }

    let mut done = 0;
    for version in indexed + 1..=latest {
        // a deadlock retries this version only
        retry_on_deadlock(&shared.config.retry, "index", |_| {
            view.refresh_to(&mut Decline, Some(version), false)?;
            for record in store.iter_history(version - 1, version)? {
                for change in &record.items {
                    index_change(shared, &mut view, change, version)?;
                }
            }
            Ok(())
        })?;
        text.set_indexed_version(version);
        done += 1;
    }
    view.close();
    debug!(target: "itemdb::indexer", from = indexed, to = latest, count = done, "Indexed versions");
    Ok(done)
}

fn index_change(shared: &Shared, view: &mut View, change: &ItemChange, version: Version) -> Result<()> {
    let text = shared.store.text();
    if change.status.contains(ItemStatus::DELETED) {
        text.remove_item(change.item);
        return Ok(());
    }
    for attribute in &change.values {
        let indexed = shared
            .schema
            .attribute(change.kind.as_deref(), attribute)
            .map_or(false, |d| d.indexed);
        if !indexed {
            continue;
        }
        index_attribute(shared, view, change.item, attribute, version)?;
    }
    Ok(())
}

fn index_attribute(
    shared: &Shared,
    view: &mut View,
    item: ItemId,
    attribute: &str,
    version: Version,
) -> Result<()> {
    let text = shared.store.text();
    let value = match view.item(item) {
        Ok(loaded) => loaded.value(attribute).cloned(),
        Err(ItemDbError::NoSuchItem(_)) => None,
        Err(e) => return Err(e),
    };
    match value.as_ref().and_then(value_text) {
        Some(body) => text.index_document(item, attribute, tokenize_unique(&body), version),
        None => text.remove_document(item, attribute),
    }
    Ok(())
}

/// History below the index is gone: index the latest state from scratch
fn rebuild(shared: &Shared, view: &mut View, latest: Version) -> Result<usize> {
    let store = &shared.store;
    view.refresh_to(&mut Decline, Some(latest), false)?;
    store.text().import(Default::default());
    let items = store.query_items(None, latest);
    for &id in &items {
        let kind = view.kind_of(id)?;
        let Some(declared) = kind.as_deref().and_then(|k| shared.schema.kind(k)) else {
            continue;
        };
        let attributes: Vec<String> = declared
            .attributes()
            .filter(|d| d.indexed)
            .map(|d| d.name.clone())
            .collect();
        for attribute in attributes {
            index_attribute(shared, view, id, &attribute, latest)?;
        }
        view.unload(id);
    }
    store.text().set_indexed_version(latest);
    warn!(
        target: "itemdb::indexer",
        version = latest,
        count = items.len(),
        "History compacted below the index; rebuilt from current state"
    );
    Ok(items.len())
}
