//! End-to-end behavior of the storage facade over both layouts.

mod common;

use common::*;
use verso_error::VersoError;
use verso_store::TableKind;

#[test]
fn insert_then_get_round_trip() {
    for kind in BOTH_KINDS {
        let (storage, table) = fresh_table(kind);
        let data = tuple(1, "a");
        storage.insert(table, key(42), &data, &snap(10, &[])).unwrap();

        let got = storage.get(table, key(42), &snap(20, &[10])).unwrap();
        assert_eq!(got.data, data);
        assert_eq!(got.version, v(10));
        assert!(got.is_newest);
    }
}

#[test]
fn update_respects_snapshot_visibility() {
    for kind in BOTH_KINDS {
        let (storage, table) = fresh_table(kind);
        let a = tuple(1, "a");
        let b = tuple(2, "b");
        storage.insert(table, key(1), &a, &snap(10, &[])).unwrap();
        storage.update(table, key(1), &b, &snap(12, &[10])).unwrap();

        let old = storage.get(table, key(1), &snap(11, &[10])).unwrap();
        assert_eq!(old.data, a);
        assert!(!old.is_newest);

        let new = storage.get(table, key(1), &snap(13, &[10, 12])).unwrap();
        assert_eq!(new.data, b);
        assert_eq!(new.version, v(12));
        assert!(new.is_newest);
    }
}

#[test]
fn remove_hides_the_record_from_newer_snapshots() {
    for kind in BOTH_KINDS {
        let (storage, table) = fresh_table(kind);
        let a = tuple(1, "a");
        storage.insert(table, key(7), &a, &snap(10, &[])).unwrap();
        storage.remove(table, key(7), &snap(12, &[10])).unwrap();

        assert!(matches!(
            storage.get(table, key(7), &snap(13, &[10, 12])),
            Err(VersoError::NotFound)
        ));
        let old = storage.get(table, key(7), &snap(11, &[10])).unwrap();
        assert_eq!(old.data, a);
    }
}

#[test]
fn gc_discards_shadowed_sub_floor_versions() {
    for kind in BOTH_KINDS {
        let (storage, table) = fresh_table(kind);
        storage
            .insert(table, key(3), &tuple(1, "a"), &snap(10, &[]))
            .unwrap();
        storage
            .update(table, key(3), &tuple(2, "b"), &snap(20, &[10]))
            .unwrap();
        let stats = storage.run_gc(v(15));
        assert!(stats.entries_discarded >= 1, "kind {kind:?}");

        // Version 10 was below the floor and shadowed by newer data.
        assert!(matches!(
            storage.get(table, key(3), &snap(16, &[10])),
            Err(VersoError::NotFound)
        ));
        let got = storage.get(table, key(3), &snap(21, &[20])).unwrap();
        assert_eq!(got.data, tuple(2, "b"));
    }
}

#[test]
fn gc_keeps_the_read_through_version_under_a_delete() {
    for kind in BOTH_KINDS {
        let (storage, table) = fresh_table(kind);
        storage
            .insert(table, key(4), &tuple(1, "a"), &snap(10, &[]))
            .unwrap();
        storage.remove(table, key(4), &snap(20, &[10])).unwrap();
        storage.run_gc(v(15));

        // A reader that does not see the delete still resolves the data.
        let got = storage.get(table, key(4), &snap(16, &[10])).unwrap();
        assert_eq!(got.data, tuple(1, "a"));
        assert!(matches!(
            storage.get(table, key(4), &snap(21, &[10, 20])),
            Err(VersoError::NotFound)
        ));
    }
}

#[test]
fn gc_removes_records_with_old_tombstones() {
    for kind in BOTH_KINDS {
        let (storage, table) = fresh_table(kind);
        storage
            .insert(table, key(5), &tuple(1, "a"), &snap(10, &[]))
            .unwrap();
        storage.remove(table, key(5), &snap(12, &[10])).unwrap();
        let stats = storage.run_gc(v(15));
        assert_eq!(stats.records_removed, 1, "kind {kind:?}");

        assert!(matches!(
            storage.get(table, key(5), &snap_all(100)),
            Err(VersoError::NotFound)
        ));
        let count = storage.scan(table, &snap_all(100), &mut |_, _, _| {}).unwrap();
        assert_eq!(count, 0);
    }
}

#[test]
fn sole_sub_floor_version_survives_gc() {
    for kind in BOTH_KINDS {
        let (storage, table) = fresh_table(kind);
        storage
            .insert(table, key(6), &tuple(9, "only"), &snap(10, &[]))
            .unwrap();
        storage.run_gc(v(100));
        let got = storage.get(table, key(6), &snap_all(100)).unwrap();
        assert_eq!(got.data, tuple(9, "only"));
        assert_eq!(got.version, v(10));
    }
}

#[test]
fn insert_on_live_key_conflicts() {
    for kind in BOTH_KINDS {
        let (storage, table) = fresh_table(kind);
        storage
            .insert(table, key(8), &tuple(1, "a"), &snap(10, &[]))
            .unwrap();
        assert!(matches!(
            storage.insert(table, key(8), &tuple(2, "b"), &snap(12, &[10])),
            Err(VersoError::WriteConflict { key: 8 })
        ));
    }
}

#[test]
fn insert_over_deleted_key_revives_the_record() {
    for kind in BOTH_KINDS {
        let (storage, table) = fresh_table(kind);
        storage
            .insert(table, key(9), &tuple(1, "a"), &snap(10, &[]))
            .unwrap();
        storage.remove(table, key(9), &snap(12, &[10])).unwrap();
        storage
            .insert(table, key(9), &tuple(2, "b"), &snap(14, &[10, 12]))
            .unwrap();

        let got = storage.get(table, key(9), &snap(15, &[10, 12, 14])).unwrap();
        assert_eq!(got.data, tuple(2, "b"));
        // A snapshot between delete and revive still sees nothing.
        assert!(matches!(
            storage.get(table, key(9), &snap(13, &[10, 12])),
            Err(VersoError::NotFound)
        ));
    }
}

#[test]
fn update_on_missing_or_deleted_key_is_not_found() {
    for kind in BOTH_KINDS {
        let (storage, table) = fresh_table(kind);
        assert!(matches!(
            storage.update(table, key(10), &tuple(1, "x"), &snap(5, &[])),
            Err(VersoError::NotFound)
        ));
        storage
            .insert(table, key(10), &tuple(1, "a"), &snap(10, &[]))
            .unwrap();
        storage.remove(table, key(10), &snap(12, &[10])).unwrap();
        assert!(matches!(
            storage.update(table, key(10), &tuple(2, "b"), &snap(14, &[10, 12])),
            Err(VersoError::NotFound)
        ));
    }
}

#[test]
fn stale_writer_gets_a_write_conflict() {
    for kind in BOTH_KINDS {
        let (storage, table) = fresh_table(kind);
        storage
            .insert(table, key(11), &tuple(1, "a"), &snap(10, &[]))
            .unwrap();
        storage
            .update(table, key(11), &tuple(2, "b"), &snap(20, &[10]))
            .unwrap();
        // A writer whose snapshot cannot see version 20 must not blindly
        // overwrite it.
        assert!(matches!(
            storage.update(table, key(11), &tuple(3, "c"), &snap(25, &[10])),
            Err(VersoError::WriteConflict { .. })
        ));
    }
}

#[test]
fn revert_is_idempotent_and_hides_the_version() {
    for kind in BOTH_KINDS {
        let (storage, table) = fresh_table(kind);
        storage
            .insert(table, key(12), &tuple(1, "a"), &snap(10, &[]))
            .unwrap();
        storage
            .update(table, key(12), &tuple(2, "b"), &snap(12, &[10]))
            .unwrap();

        let writer = snap(12, &[10]);
        storage.revert(table, key(12), &writer).unwrap();
        storage.revert(table, key(12), &writer).unwrap();

        // The reverted version is skipped; the insert shows through.
        let got = storage.get(table, key(12), &snap(13, &[10, 12])).unwrap();
        assert_eq!(got.data, tuple(1, "a"));
        assert!(got.is_newest);
    }
}

#[test]
fn reverted_insert_reads_as_absent() {
    for kind in BOTH_KINDS {
        let (storage, table) = fresh_table(kind);
        let writer = snap(10, &[]);
        storage
            .insert(table, key(13), &tuple(1, "a"), &writer)
            .unwrap();
        storage.revert(table, key(13), &writer).unwrap();
        assert!(matches!(
            storage.get(table, key(13), &snap_all(50)),
            Err(VersoError::NotFound)
        ));
    }
}

#[test]
fn scan_sees_newest_visible_version_per_key() {
    for kind in BOTH_KINDS {
        let (storage, table) = fresh_table(kind);
        for k in 1..=5u64 {
            storage
                .insert(table, key(k), &tuple(k as i64, "v1"), &snap(10, &[]))
                .unwrap();
        }
        storage
            .update(table, key(2), &tuple(2, "v2"), &snap(20, &[10]))
            .unwrap();
        storage.remove(table, key(5), &snap(22, &[10])).unwrap();

        let mut seen = Vec::new();
        let count = storage
            .scan(table, &snap_all(30), &mut |k, version, _| {
                seen.push((k.get(), version.get()));
            })
            .unwrap();
        seen.sort_unstable();
        assert_eq!(count, 4);
        assert_eq!(seen, vec![(1, 10), (2, 20), (3, 10), (4, 10)]);

        // A scan fixed before the update sees the old versions.
        let mut old = Vec::new();
        storage
            .scan(table, &snap(15, &[10]), &mut |k, version, _| {
                old.push((k.get(), version.get()));
            })
            .unwrap();
        old.sort_unstable();
        assert_eq!(old, vec![(1, 10), (2, 10), (3, 10), (4, 10), (5, 10)]);
    }
}

#[test]
fn writes_after_compaction_land_on_the_relocated_record() {
    let (storage, table) = fresh_table(TableKind::DeltaMain);
    storage
        .insert(table, key(20), &tuple(1, "a"), &snap(10, &[]))
        .unwrap();
    storage
        .update(table, key(20), &tuple(2, "b"), &snap(20, &[10]))
        .unwrap();
    // Fold the record into a main page.
    storage.run_gc(v(5));

    // The hash now leads to the main run; updates chain onto it.
    storage
        .update(table, key(20), &tuple(3, "c"), &snap(30, &[10, 20]))
        .unwrap();
    let got = storage.get(table, key(20), &snap_all(40)).unwrap();
    assert_eq!(got.data, tuple(3, "c"));

    // A second sweep folds the new update and discards the shadowed
    // sub-floor versions.
    storage.run_gc(v(25));
    let got = storage.get(table, key(20), &snap_all(40)).unwrap();
    assert_eq!(got.data, tuple(3, "c"));
    assert!(matches!(
        storage.get(table, key(20), &snap(26, &[10, 20])),
        Err(VersoError::NotFound)
    ));
}

#[test]
fn compaction_preserves_the_visible_map() {
    let (storage, table) = fresh_table(TableKind::DeltaMain);
    for k in 1..=20u64 {
        storage
            .insert(table, key(k), &tuple(k as i64, "base"), &snap(10, &[]))
            .unwrap();
        if k % 2 == 0 {
            storage
                .update(table, key(k), &tuple(k as i64, "upd"), &snap(20, &[10]))
                .unwrap();
        }
        if k % 5 == 0 {
            storage.remove(table, key(k), &snap(30, &[10, 20])).unwrap();
        }
    }
    let observe = |storage: &verso_store::Storage| {
        let mut map = Vec::new();
        for k in 1..=20u64 {
            match storage.get(table, key(k), &snap_all(40)) {
                Ok(got) => map.push((k, Some((got.version.get(), got.data.clone())))),
                Err(_) => map.push((k, None)),
            }
        }
        map
    };
    let before = observe(&storage);
    let stats = storage.run_gc(v(12));
    assert!(stats.pages_rewritten == 0 || stats.entries_relocated > 0);
    let after = observe(&storage);
    assert_eq!(before, after);

    // Sweeping twice is stable.
    storage.run_gc(v(12));
    assert_eq!(observe(&storage), after);
}

#[test]
fn exhausted_page_budget_reports_out_of_memory() {
    let storage = verso_store::Storage::new(verso_store::StorageConfig {
        max_pages: 0,
        ..Default::default()
    });
    let (table, _) = storage
        .create_table("records", schema(), TableKind::LogStructured)
        .unwrap();
    assert!(matches!(
        storage.insert(table, key(1), &tuple(1, "a"), &snap(10, &[])),
        Err(VersoError::OutOfMemory { .. })
    ));
}
