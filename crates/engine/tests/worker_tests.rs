//! Background worker and concurrency tests
//!
//! - Full-text indexer catch-up, on demand and in the background
//! - Index rebuild after history compaction
//! - Checkpoint thread writing snapshots
//! - Concurrent commits from many threads
//! - Injected deadlocks and commit failures

use itemdb_concurrency::Decline;
use itemdb_core::{AttributeDef, ItemId, Kind, Schema};
use itemdb_engine::{Repository, RepositoryConfig};
use itemdb_storage::FailPoint;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn schema() -> Schema {
    let mut schema = Schema::new();
    schema.define(
        Kind::new("Folder")
            .with(AttributeDef::value("title", "String"))
            .with(AttributeDef::collection("docs", "folder")),
    );
    schema.define(
        Kind::new("Doc")
            .with(AttributeDef::value("title", "String").indexed())
            .with(AttributeDef::value("body", "String"))
            .with(AttributeDef::reference("folder", "docs")),
    );
    schema
}

fn repo_with(config: RepositoryConfig) -> Repository {
    Repository::builder()
        .schema(schema())
        .config(config)
        .in_memory()
        .unwrap()
}

fn commit_doc(repo: &Repository, title: &str) -> ItemId {
    let mut view = repo.view("writer").unwrap();
    let doc = view.create(Some("Doc")).unwrap();
    view.set_value(doc, "title", title).unwrap();
    view.commit(&mut Decline).unwrap();
    view.close();
    doc
}

fn search(repo: &Repository, text: &str) -> Vec<ItemId> {
    let mut view = repo.view("search").unwrap();
    let hits = view
        .search_items(text)
        .unwrap()
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    view.close();
    hits
}

fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

// ============================================================================
// Indexer
// ============================================================================

mod indexer {
    use super::*;

    #[test]
    fn test_index_now_catches_up() {
        let repo = repo_with(RepositoryConfig::quiet());
        let fox = commit_doc(&repo, "The quick brown fox");
        commit_doc(&repo, "A lazy dog");

        assert_eq!(repo.index_now().unwrap(), 2);
        assert_eq!(repo.indexed_version(), repo.version());
        assert_eq!(search(&repo, "brown fox"), vec![fox]);
        assert!(search(&repo, "cat").is_empty());

        // nothing new
        assert_eq!(repo.index_now().unwrap(), 0);
    }

    #[test]
    fn test_unindexed_attribute_is_not_searchable() {
        let repo = repo_with(RepositoryConfig::quiet());
        let mut view = repo.view("writer").unwrap();
        let doc = view.create(Some("Doc")).unwrap();
        view.set_value(doc, "body", "hidden words").unwrap();
        view.commit(&mut Decline).unwrap();
        view.close();

        repo.index_now().unwrap();
        assert!(search(&repo, "hidden").is_empty());
    }

    #[test]
    fn test_update_and_delete_reach_the_index() {
        let repo = repo_with(RepositoryConfig::quiet());
        let doc = commit_doc(&repo, "first title");
        repo.index_now().unwrap();

        let mut view = repo.view("editor").unwrap();
        view.set_value(doc, "title", "second title").unwrap();
        view.commit(&mut Decline).unwrap();
        repo.index_now().unwrap();
        view.close();
        assert!(search(&repo, "first").is_empty());
        assert_eq!(search(&repo, "second"), vec![doc]);

        let mut view = repo.view("editor").unwrap();
        view.delete(doc).unwrap();
        view.commit(&mut Decline).unwrap();
        view.close();
        repo.index_now().unwrap();
        assert!(search(&repo, "second").is_empty());
    }

    #[test]
    fn test_rebuild_after_compaction() {
        let repo = repo_with(RepositoryConfig::quiet());
        let a = commit_doc(&repo, "alpha");
        let b = commit_doc(&repo, "beta");

        let stats = repo.compact().unwrap();
        assert_eq!(stats.compacted_to, repo.version());
        assert!(repo.history_floor() > repo.indexed_version());

        assert_eq!(repo.index_now().unwrap(), 2);
        assert_eq!(search(&repo, "alpha"), vec![a]);
        assert_eq!(search(&repo, "beta"), vec![b]);
    }

    #[test]
    fn test_background_indexer() {
        let config = RepositoryConfig {
            indexer_enabled: true,
            indexer_poll_ms: 20,
            ..RepositoryConfig::quiet()
        };
        let repo = repo_with(config);
        let doc = commit_doc(&repo, "eventually searchable");

        assert!(wait_for(Duration::from_secs(5), || {
            repo.indexed_version() == repo.version()
        }));
        assert_eq!(search(&repo, "searchable"), vec![doc]);
    }
}

// ============================================================================
// Checkpoint thread
// ============================================================================

mod checkpoint {
    use super::*;

    #[test]
    fn test_background_checkpoint_writes_snapshot() {
        let dir = TempDir::new().unwrap();
        let config = RepositoryConfig {
            checkpoint_enabled: true,
            checkpoint_interval_secs: 1,
            ..RepositoryConfig::quiet()
        };
        let repo = Repository::builder()
            .path(dir.path().join("repo"))
            .create(true)
            .schema(schema())
            .config(config)
            .open()
            .unwrap();
        commit_doc(&repo, "persist me");

        let snapshots = repo.path().unwrap().join("snapshots");
        assert!(wait_for(Duration::from_secs(5), || {
            itemdb_durability::list_snapshots(&snapshots)
                .map(|v| v.contains(&repo.version()))
                .unwrap_or(false)
        }));
        repo.close().unwrap();
    }
}

// ============================================================================
// Concurrency
// ============================================================================

mod concurrency {
    use super::*;

    #[test]
    fn test_concurrent_commits_all_land() {
        const THREADS: usize = 4;
        let repo = Arc::new(repo_with(RepositoryConfig::quiet()));
        let folder = {
            let mut view = repo.view("setup").unwrap();
            let folder = view.create(Some("Folder")).unwrap();
            view.commit(&mut Decline).unwrap();
            view.close();
            folder
        };

        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let repo = Arc::clone(&repo);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let mut view = repo.view(&format!("worker-{}", i)).unwrap();
                    let doc = view.create(Some("Doc")).unwrap();
                    view.set_value(doc, "title", format!("doc {}", i)).unwrap();
                    view.add_ref(folder, "docs", doc, None).unwrap();
                    barrier.wait();
                    let version = view.commit(&mut Decline).unwrap().unwrap();
                    view.close();
                    (doc, version)
                })
            })
            .collect();

        let results: Vec<(ItemId, u64)> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let mut versions: Vec<u64> = results.iter().map(|(_, v)| *v).collect();
        versions.sort_unstable();
        versions.dedup();
        assert_eq!(versions.len(), THREADS);
        assert_eq!(repo.version(), 1 + THREADS as u64);

        let mut reader = repo.view("reader").unwrap();
        let members = reader.peers(folder, "docs").unwrap();
        assert_eq!(members.len(), THREADS);
        for (doc, _) in &results {
            assert!(members.contains(doc));
            assert_eq!(reader.get_ref(*doc, "folder").unwrap(), Some(folder));
        }
    }

    #[test]
    fn test_injected_deadlocks_are_retried() {
        let repo = repo_with(RepositoryConfig::quiet());
        repo.faults().inject_deadlocks(2);

        let mut view = repo.view("main").unwrap();
        let doc = view.create(Some("Doc")).unwrap();
        view.set_value(doc, "title", "after retries").unwrap();
        assert_eq!(view.commit(&mut Decline).unwrap(), Some(1));
    }

    #[test]
    fn test_failed_commit_publishes_nothing() {
        let repo = repo_with(RepositoryConfig::quiet());
        let mut view = repo.view("main").unwrap();
        let doc = view.create(Some("Doc")).unwrap();
        view.set_value(doc, "title", "atomic").unwrap();

        for point in [FailPoint::BeforeLog, FailPoint::AfterLog] {
            repo.faults().fail_next_commit(point);
            assert!(view.commit(&mut Decline).is_err());
            assert_eq!(repo.version(), 0);
            assert!(view.is_dirty());

            let mut reader = repo.view("reader").unwrap();
            assert_eq!(reader.find(doc).unwrap(), None);
            reader.close();
        }

        assert_eq!(view.commit(&mut Decline).unwrap(), Some(1));
    }
}
