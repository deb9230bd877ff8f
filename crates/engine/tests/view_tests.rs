//! View lifecycle, refresh and merge tests
//!
//! Covers:
//! - Values, names and single references inside one view
//! - Commit visibility across views and version numbering
//! - Refresh with incoming-wins, local-wins and declining resolvers
//! - Deletion, cancel, notifications and the consistency check

use itemdb_concurrency::{Conflict, Decline, PreferIncoming, PreferLocal, Resolution};
use itemdb_core::{AttributeDef, ItemDbError, Kind, MergeReason, Schema, Value};
use itemdb_engine::{ChangeKind, Origin, Repository, RepositoryConfig, ViewState};

fn schema() -> Schema {
    let mut schema = Schema::new();
    schema.define(
        Kind::new("Folder")
            .with(AttributeDef::value("title", "String").indexed())
            .with(AttributeDef::collection("docs", "folder")),
    );
    schema.define(
        Kind::new("Doc")
            .with(AttributeDef::value("title", "String").indexed())
            .with(AttributeDef::value("rank", "Int").with_default(Value::Int(0)))
            .with(AttributeDef::value("serial", "String").read_only())
            .with(AttributeDef::value("cursor", "Int").transient())
            .with(AttributeDef::value("tags", "Set"))
            .with(AttributeDef::reference("folder", "docs"))
            .with(AttributeDef::reference("next", "previous"))
            .with(AttributeDef::reference("previous", "next")),
    );
    schema
}

fn repo() -> Repository {
    Repository::builder()
        .schema(schema())
        .config(RepositoryConfig::quiet())
        .in_memory()
        .unwrap()
}

// ============================================================================
// Values
// ============================================================================

mod values {
    use super::*;

    #[test]
    fn test_set_and_get_value() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        let doc = view.create(Some("Doc")).unwrap();
        view.set_value(doc, "title", "draft").unwrap();

        assert_eq!(
            view.get_value(doc, "title").unwrap(),
            Some(Value::String("draft".into()))
        );
        assert!(view.is_dirty());
    }

    #[test]
    fn test_default_value_for_unset_attribute() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        let doc = view.create(Some("Doc")).unwrap();

        assert_eq!(view.get_value(doc, "rank").unwrap(), Some(Value::Int(0)));
        assert_eq!(view.get_value(doc, "title").unwrap(), None);
    }

    #[test]
    fn test_type_checked_on_write() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        let doc = view.create(Some("Doc")).unwrap();

        assert!(view.set_value(doc, "rank", "high").is_err());
        view.set_value(doc, "rank", 3i64).unwrap();
    }

    #[test]
    fn test_read_only_after_commit() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        let doc = view.create(Some("Doc")).unwrap();
        view.set_value(doc, "serial", "A-1").unwrap();
        view.commit(&mut Decline).unwrap();

        let err = view.set_value(doc, "serial", "A-2").unwrap_err();
        assert!(matches!(err, ItemDbError::ReadOnlyAttribute { .. }));
    }

    #[test]
    fn test_transient_value_is_not_committed() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        let doc = view.create(Some("Doc")).unwrap();
        view.set_value(doc, "cursor", 7i64).unwrap();
        view.commit(&mut Decline).unwrap();

        let mut other = repo.view("other").unwrap();
        assert_eq!(other.get_value(doc, "cursor").unwrap(), None);
    }

    #[test]
    fn test_reference_attribute_rejects_values() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        let doc = view.create(Some("Doc")).unwrap();

        let err = view.set_value(doc, "folder", "x").unwrap_err();
        assert!(matches!(err, ItemDbError::Cardinality { .. }));
    }

    #[test]
    fn test_undeclared_kind_is_refused() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        assert!(matches!(
            view.create(Some("Nope")).unwrap_err(),
            ItemDbError::Schema(_)
        ));
    }

    #[test]
    fn test_item_hash_follows_content() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        let a = view.create(Some("Doc")).unwrap();
        let b = view.create(Some("Doc")).unwrap();
        view.set_value(a, "title", "x").unwrap();
        view.set_value(a, "tags", Value::Set(vec!["red".into(), "blue".into()]))
            .unwrap();
        view.set_value(b, "tags", Value::Set(vec!["blue".into(), "red".into()]))
            .unwrap();
        view.set_value(b, "title", "x").unwrap();
        assert_eq!(view.item_hash(a).unwrap(), view.item_hash(b).unwrap());
        view.commit(&mut Decline).unwrap();

        let mut other = repo.view("other").unwrap();
        assert_eq!(other.item_hash(a).unwrap(), view.item_hash(b).unwrap());

        view.set_value(b, "rank", 3i64).unwrap();
        assert_ne!(view.item_hash(a).unwrap(), view.item_hash(b).unwrap());
    }
}

// ============================================================================
// Commit
// ============================================================================

mod commit {
    use super::*;

    #[test]
    fn test_commit_advances_version() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        let before = view.version();
        let doc = view.create(Some("Doc")).unwrap();
        view.set_value(doc, "title", "x").unwrap();

        let version = view.commit(&mut Decline).unwrap();
        assert_eq!(version, Some(before + 1));
        assert_eq!(view.version(), before + 1);
        assert_eq!(repo.version(), before + 1);
        assert!(!view.is_dirty());
    }

    #[test]
    fn test_clean_commit_is_noop() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        assert_eq!(view.commit(&mut Decline).unwrap(), None);
        assert_eq!(repo.version(), 0);
    }

    #[test]
    fn test_commit_visible_to_new_view() {
        let repo = repo();
        let mut writer = repo.view("writer").unwrap();
        let doc = writer.create(Some("Doc")).unwrap();
        writer.set_value(doc, "title", "shared").unwrap();
        writer.commit(&mut Decline).unwrap();

        let mut reader = repo.view("reader").unwrap();
        assert_eq!(
            reader.get_value(doc, "title").unwrap(),
            Some(Value::String("shared".into()))
        );
    }

    #[test]
    fn test_old_view_does_not_see_newer_commit() {
        let repo = repo();
        let mut writer = repo.view("writer").unwrap();
        let doc = writer.create(Some("Doc")).unwrap();
        writer.set_value(doc, "title", "one").unwrap();
        writer.commit(&mut Decline).unwrap();

        let mut reader = repo.view("reader").unwrap();
        writer.set_value(doc, "title", "two").unwrap();
        writer.commit(&mut Decline).unwrap();

        assert_eq!(
            reader.get_value(doc, "title").unwrap(),
            Some(Value::String("one".into()))
        );
        reader.refresh(&mut Decline).unwrap();
        assert_eq!(
            reader.get_value(doc, "title").unwrap(),
            Some(Value::String("two".into()))
        );
    }

    #[test]
    fn test_cancel_drops_changes() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        let doc = view.create(Some("Doc")).unwrap();
        view.set_value(doc, "title", "kept").unwrap();
        view.commit(&mut Decline).unwrap();

        view.set_value(doc, "title", "dropped").unwrap();
        let scratch = view.create(Some("Doc")).unwrap();
        view.cancel().unwrap();

        assert!(!view.is_dirty());
        assert_eq!(
            view.get_value(doc, "title").unwrap(),
            Some(Value::String("kept".into()))
        );
        assert_eq!(view.find(scratch).unwrap(), None);
    }

    #[test]
    fn test_history_lists_changed_items() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        let doc = view.create(Some("Doc")).unwrap();
        view.set_value(doc, "title", "x").unwrap();
        let v = view.commit(&mut Decline).unwrap().unwrap();

        let history = view.history(v - 1, v).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].version, v);
        assert_eq!(history[0].view, "main");
        assert!(history[0].items.iter().any(|c| c.item == doc));

        // same answer twice
        assert_eq!(view.history(0, v).unwrap(), view.history(0, v).unwrap());
    }

    #[test]
    fn test_closed_view_rejects_operations() {
        let repo = repo();
        let view = repo.view("main").unwrap();
        assert_eq!(view.state(), ViewState::Open);
        assert_eq!(repo.open_views(), vec!["main".to_string()]);
        view.close();
        assert!(repo.open_views().is_empty());
    }
}

// ============================================================================
// Merge
// ============================================================================

mod merge {
    use super::*;

    fn committed_doc(repo: &Repository, title: &str) -> itemdb_core::ItemId {
        let mut view = repo.view("setup").unwrap();
        let doc = view.create(Some("Doc")).unwrap();
        view.set_value(doc, "title", title).unwrap();
        view.commit(&mut Decline).unwrap();
        view.close();
        doc
    }

    #[test]
    fn test_refresh_with_incoming_takes_newer_value() {
        let repo = repo();
        let mut view1 = repo.view("one").unwrap();
        let doc = view1.create(Some("Doc")).unwrap();
        view1.set_value(doc, "title", "x").unwrap();
        let v1 = view1.commit(&mut Decline).unwrap().unwrap();

        let mut view2 = repo.view("two").unwrap();
        assert_eq!(view2.version(), v1);
        view2.set_value(doc, "title", "y").unwrap();
        let v2 = view2.commit(&mut Decline).unwrap().unwrap();
        assert_eq!(v2, v1 + 1);

        view1.refresh(&mut PreferIncoming).unwrap();
        assert_eq!(
            view1.get_value(doc, "title").unwrap(),
            Some(Value::String("y".into()))
        );
    }

    #[test]
    fn test_concurrent_value_change_declined() {
        let repo = repo();
        let doc = committed_doc(&repo, "base");
        let mut first = repo.view("first").unwrap();
        let mut second = repo.view("second").unwrap();

        first.set_value(doc, "title", "x").unwrap();
        second.set_value(doc, "title", "y").unwrap();
        first.commit(&mut Decline).unwrap();

        let mut seen = Vec::new();
        let mut resolver = |c: &Conflict| {
            seen.push(c.clone());
            Resolution::Unresolved
        };
        let err = second.commit(&mut resolver).unwrap_err();

        assert_eq!(err.merge_reason(), Some(MergeReason::Value));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].reason, MergeReason::Value);
        assert_eq!(seen[0].attribute, "title");
        assert_eq!(
            seen[0].incoming,
            itemdb_concurrency::MergeValue::Value(Some(Value::String("x".into())))
        );

        // the failed commit keeps the change for a retry
        assert!(second.is_dirty());
        assert_eq!(
            second.get_value(doc, "title").unwrap(),
            Some(Value::String("y".into()))
        );
    }

    #[test]
    fn test_concurrent_value_change_local_wins() {
        let repo = repo();
        let doc = committed_doc(&repo, "base");
        let mut first = repo.view("first").unwrap();
        let mut second = repo.view("second").unwrap();

        first.set_value(doc, "title", "x").unwrap();
        second.set_value(doc, "title", "y").unwrap();
        first.commit(&mut Decline).unwrap();
        second.commit(&mut PreferLocal).unwrap();

        let mut reader = repo.view("reader").unwrap();
        assert_eq!(
            reader.get_value(doc, "title").unwrap(),
            Some(Value::String("y".into()))
        );
    }

    #[test]
    fn test_disjoint_attributes_merge_silently() {
        let repo = repo();
        let doc = committed_doc(&repo, "base");
        let mut first = repo.view("first").unwrap();
        let mut second = repo.view("second").unwrap();

        first.set_value(doc, "title", "renamed").unwrap();
        second.set_value(doc, "rank", 5i64).unwrap();
        first.commit(&mut Decline).unwrap();
        second.commit(&mut Decline).unwrap();

        let mut reader = repo.view("reader").unwrap();
        assert_eq!(
            reader.get_value(doc, "title").unwrap(),
            Some(Value::String("renamed".into()))
        );
        assert_eq!(reader.get_value(doc, "rank").unwrap(), Some(Value::Int(5)));
    }

    #[test]
    fn test_failed_refresh_keeps_version() {
        let repo = repo();
        let doc = committed_doc(&repo, "base");
        let mut first = repo.view("first").unwrap();
        let mut second = repo.view("second").unwrap();
        let before = second.version();

        first.set_value(doc, "title", "x").unwrap();
        first.commit(&mut Decline).unwrap();
        second.set_value(doc, "title", "y").unwrap();

        assert!(second.refresh(&mut Decline).is_err());
        assert_eq!(second.version(), before);
        assert_eq!(second.state(), ViewState::Open);
    }

    #[test]
    fn test_edit_of_remotely_deleted_item() {
        let repo = repo();
        let doc = committed_doc(&repo, "base");
        let mut first = repo.view("first").unwrap();
        let mut second = repo.view("second").unwrap();

        first.delete(doc).unwrap();
        first.commit(&mut Decline).unwrap();
        second.set_value(doc, "title", "edited").unwrap();

        let err = second.refresh(&mut Decline).unwrap_err();
        assert!(err.is_merge_error());

        // accepting the deletion drops the edit
        second.refresh(&mut PreferIncoming).unwrap();
        assert_eq!(second.find(doc).unwrap(), None);
    }

    #[test]
    fn test_name_collision_needs_new_name() {
        let repo = repo();
        let mut first = repo.view("first").unwrap();
        let mut second = repo.view("second").unwrap();

        first.create_named(Some("Folder"), None, "inbox").unwrap();
        let mine = second.create_named(Some("Folder"), None, "inbox").unwrap();
        first.commit(&mut Decline).unwrap();

        assert!(second.refresh(&mut PreferLocal).is_err());

        let mut rename = |c: &Conflict| match c.reason {
            MergeReason::Name => Resolution::Use(itemdb_concurrency::MergeValue::Name(
                "inbox-2".to_string(),
            )),
            _ => Resolution::Unresolved,
        };
        second.commit(&mut rename).unwrap();

        let mut reader = repo.view("reader").unwrap();
        assert_eq!(reader.find_path("//inbox-2").unwrap(), Some(mine));
        assert_eq!(reader.roots().unwrap().len(), 2);
    }

    #[test]
    fn test_identical_concurrent_values_merge_silently() {
        let repo = repo();
        let doc = committed_doc(&repo, "base");
        let mut first = repo.view("first").unwrap();
        let mut second = repo.view("second").unwrap();

        first.set_value(doc, "title", "same").unwrap();
        second.set_value(doc, "title", "same").unwrap();
        first.commit(&mut Decline).unwrap();

        let mut seen = Vec::new();
        let mut resolver = |c: &Conflict| {
            seen.push(c.clone());
            Resolution::Unresolved
        };
        second.commit(&mut resolver).unwrap();
        assert!(seen.is_empty());
        assert!(!second.is_dirty());

        let mut reader = repo.view("reader").unwrap();
        assert_eq!(
            reader.get_value(doc, "title").unwrap(),
            Some(Value::String("same".into()))
        );
    }

    #[test]
    fn test_identical_concurrent_references_merge_silently() {
        let repo = repo();
        let a = committed_doc(&repo, "a");
        let b = committed_doc(&repo, "b");
        let mut first = repo.view("first").unwrap();
        let mut second = repo.view("second").unwrap();

        first.set_ref(a, "next", Some(b)).unwrap();
        second.set_ref(a, "next", Some(b)).unwrap();
        first.commit(&mut Decline).unwrap();
        second.commit(&mut Decline).unwrap();

        let mut reader = repo.view("reader").unwrap();
        assert_eq!(reader.get_ref(a, "next").unwrap(), Some(b));
        assert_eq!(reader.get_ref(b, "previous").unwrap(), Some(a));
    }

    #[test]
    fn test_concurrent_single_reference_stays_symmetric() {
        for keep_local in [false, true] {
            let repo = repo();
            let a = committed_doc(&repo, "a");
            let b = committed_doc(&repo, "b");
            let c = committed_doc(&repo, "c");
            let mut first = repo.view("first").unwrap();
            let mut second = repo.view("second").unwrap();

            first.set_ref(a, "next", Some(b)).unwrap();
            second.set_ref(a, "next", Some(c)).unwrap();
            first.commit(&mut Decline).unwrap();
            if keep_local {
                second.commit(&mut PreferLocal).unwrap();
            } else {
                second.commit(&mut PreferIncoming).unwrap();
            }

            let (winner, loser) = if keep_local { (c, b) } else { (b, c) };
            let mut reader = repo.view("reader").unwrap();
            assert_eq!(reader.get_ref(a, "next").unwrap(), Some(winner));
            assert_eq!(reader.get_ref(winner, "previous").unwrap(), Some(a));
            assert_eq!(reader.get_ref(loser, "previous").unwrap(), None);
            let report = reader.check(false).unwrap();
            assert!(report.is_clean(), "{:?}", report.problems);
            assert!(reader.check_link(a, "next").unwrap());
        }
    }

    #[test]
    fn test_refresh_merges_against_final_version() {
        let repo = repo();
        let doc = committed_doc(&repo, "base");
        let mut local = repo.view("local").unwrap();
        let mut remote = repo.view("remote").unwrap();

        remote.set_value(doc, "title", "x").unwrap();
        remote.commit(&mut Decline).unwrap();
        remote.set_value(doc, "title", "same").unwrap();
        remote.commit(&mut Decline).unwrap();

        local.set_value(doc, "title", "same").unwrap();
        local.refresh(&mut Decline).unwrap();
        assert_eq!(local.version(), repo.version());

        let remote_changes = local
            .drain_notifications()
            .into_iter()
            .filter(|n| n.origin == Origin::Remote && n.item == doc)
            .count();
        assert_eq!(remote_changes, 2);
    }
}

// ============================================================================
// Names
// ============================================================================

mod names {
    use super::*;

    #[test]
    fn test_paths_resolve_through_parents() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        let root = view.create_named(Some("Folder"), None, "projects").unwrap();
        let child = view
            .create_named(Some("Doc"), Some(root), "plan")
            .unwrap();

        assert_eq!(view.find_path("//projects/plan").unwrap(), Some(child));
        assert_eq!(
            view.path_of(child).unwrap().map(|p| p.to_string()),
            Some("//projects/plan".to_string())
        );
        view.commit(&mut Decline).unwrap();

        let mut reader = repo.view("reader").unwrap();
        assert_eq!(reader.find_path("//projects/plan").unwrap(), Some(child));
        assert_eq!(
            reader.children(Some(root)).unwrap(),
            vec![("plan".to_string(), child)]
        );
    }

    #[test]
    fn test_duplicate_sibling_name_refused() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        view.create_named(Some("Folder"), None, "inbox").unwrap();
        assert!(view.create_named(Some("Folder"), None, "inbox").is_err());
    }

    #[test]
    fn test_rename_and_move() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        let a = view.create_named(Some("Folder"), None, "a").unwrap();
        let b = view.create_named(Some("Folder"), None, "b").unwrap();
        let doc = view.create_named(Some("Doc"), Some(a), "doc").unwrap();
        view.commit(&mut Decline).unwrap();

        view.rename(doc, "memo").unwrap();
        view.move_item(doc, Some(b)).unwrap();
        view.commit(&mut Decline).unwrap();

        let mut reader = repo.view("reader").unwrap();
        assert_eq!(reader.find_path("//a/doc").unwrap(), None);
        assert_eq!(reader.find_path("//b/memo").unwrap(), Some(doc));
    }

    #[test]
    fn test_relative_path_is_rejected() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        assert!(matches!(
            view.find_path("inbox").unwrap_err(),
            ItemDbError::NoSuchPath(_)
        ));
    }
}

// ============================================================================
// References
// ============================================================================

mod references {
    use super::*;

    #[test]
    fn test_single_reference_is_symmetric() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        let a = view.create(Some("Doc")).unwrap();
        let b = view.create(Some("Doc")).unwrap();

        view.set_ref(a, "next", Some(b)).unwrap();
        assert_eq!(view.get_ref(a, "next").unwrap(), Some(b));
        assert_eq!(view.get_ref(b, "previous").unwrap(), Some(a));

        view.set_ref(a, "next", None).unwrap();
        assert_eq!(view.get_ref(b, "previous").unwrap(), None);
    }

    #[test]
    fn test_reassignment_detaches_old_owner() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        let a = view.create(Some("Doc")).unwrap();
        let b = view.create(Some("Doc")).unwrap();
        let c = view.create(Some("Doc")).unwrap();

        view.set_ref(a, "next", Some(c)).unwrap();
        view.set_ref(b, "next", Some(c)).unwrap();

        assert_eq!(view.get_ref(c, "previous").unwrap(), Some(b));
        assert_eq!(view.get_ref(a, "next").unwrap(), None);
    }

    #[test]
    fn test_detach_then_attach_restores_state() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        let a = view.create(Some("Doc")).unwrap();
        let b = view.create(Some("Doc")).unwrap();
        view.set_ref(a, "next", Some(b)).unwrap();
        view.commit(&mut Decline).unwrap();

        view.set_ref(a, "next", None).unwrap();
        view.set_ref(a, "next", Some(b)).unwrap();
        assert_eq!(view.get_ref(a, "next").unwrap(), Some(b));
        assert_eq!(view.get_ref(b, "previous").unwrap(), Some(a));
        view.commit(&mut Decline).unwrap();

        let mut reader = repo.view("reader").unwrap();
        assert_eq!(reader.get_ref(b, "previous").unwrap(), Some(a));
    }

    #[test]
    fn test_stub_by_path_resolves_at_commit() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        let a = view.create(Some("Doc")).unwrap();
        view.set_ref_path(a, "next", "//later").unwrap();
        let later = view.create_named(Some("Doc"), None, "later").unwrap();
        view.commit(&mut Decline).unwrap();

        let mut reader = repo.view("reader").unwrap();
        assert_eq!(reader.get_ref(a, "next").unwrap(), Some(later));
        assert_eq!(reader.get_ref(later, "previous").unwrap(), Some(a));
    }

    #[test]
    fn test_unresolvable_stub_fails_commit() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        let a = view.create(Some("Doc")).unwrap();
        view.set_ref_path(a, "next", "//missing").unwrap();

        let err = view.commit(&mut Decline).unwrap_err();
        assert!(matches!(err, ItemDbError::DanglingReference { .. }));
        assert!(view.is_dirty());
        assert_eq!(repo.version(), 0);
    }

    #[test]
    fn test_delete_detaches_references() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        let a = view.create(Some("Doc")).unwrap();
        let b = view.create(Some("Doc")).unwrap();
        view.set_ref(a, "next", Some(b)).unwrap();
        view.commit(&mut Decline).unwrap();

        view.delete(b).unwrap();
        assert_eq!(view.get_ref(a, "next").unwrap(), None);
        view.commit(&mut Decline).unwrap();

        let mut reader = repo.view("reader").unwrap();
        assert_eq!(reader.find(b).unwrap(), None);
        assert_eq!(reader.get_ref(a, "next").unwrap(), None);
    }

    #[test]
    fn test_deferred_delete_waits_for_commit() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        let doc = view.create(Some("Doc")).unwrap();
        view.commit(&mut Decline).unwrap();

        view.set_defer_deletes(true);
        view.delete(doc).unwrap();
        view.commit(&mut Decline).unwrap();
        assert_eq!(view.find(doc).unwrap(), None);
    }

    #[test]
    fn test_check_reports_clean_graph() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        let a = view.create(Some("Doc")).unwrap();
        let b = view.create(Some("Doc")).unwrap();
        view.set_ref(a, "next", Some(b)).unwrap();
        view.commit(&mut Decline).unwrap();

        let report = view.check(false).unwrap();
        assert!(report.is_clean(), "{:?}", report.problems);
    }
}

// ============================================================================
// Notifications
// ============================================================================

mod notifications {
    use super::*;

    #[test]
    fn test_local_commit_notifies() {
        let repo = repo();
        let mut view = repo.view("main").unwrap();
        let doc = view.create(Some("Doc")).unwrap();
        view.set_value(doc, "title", "x").unwrap();
        let v = view.commit(&mut Decline).unwrap().unwrap();

        let events = view.drain_notifications();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].item, doc);
        assert_eq!(events[0].change, ChangeKind::Added);
        assert_eq!(events[0].origin, Origin::Local);
        assert_eq!(events[0].version, v);
        assert!(events[0].attributes.contains(&"title".to_string()));
    }

    #[test]
    fn test_refresh_notifies_remote_changes() {
        let repo = repo();
        let mut watcher = repo.view("watcher").unwrap();
        let mut writer = repo.view("writer").unwrap();
        let doc = writer.create(Some("Doc")).unwrap();
        writer.commit(&mut Decline).unwrap();
        writer.delete(doc).unwrap();
        writer.commit(&mut Decline).unwrap();

        watcher.refresh(&mut Decline).unwrap();
        let mut kinds = Vec::new();
        let count = watcher.dispatch_notifications(|n| {
            assert_eq!(n.origin, Origin::Remote);
            kinds.push(n.change);
        });
        assert_eq!(count, 2);
        assert_eq!(kinds, vec![ChangeKind::Added, ChangeKind::Deleted]);
    }
}
