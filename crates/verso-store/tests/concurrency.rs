//! Concurrency behavior: same-key CAS races and compaction racing writers.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use rand::{rngs::StdRng, Rng, SeedableRng};

use common::*;
use verso_error::VersoError;
use verso_store::TableKind;
use verso_types::SnapshotDescriptor;

/// Two concurrent updates to one key serialize through the CAS on the
/// record's newest pointer: either both land in version order, or the
/// later-versioned writer wins alone and the earlier one reports a
/// conflict. No interleaving loses the version-12 payload.
#[test]
fn same_key_updates_serialize() {
    for kind in BOTH_KINDS {
        for round in 0..32 {
            let (storage, table) = fresh_table(kind);
            storage
                .insert(table, key(1), &tuple(0, "base"), &snap(10, &[]))
                .unwrap();
            let storage = Arc::new(storage);
            let barrier = Arc::new(Barrier::new(2));

            let a = {
                let storage = Arc::clone(&storage);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    storage.update(table, key(1), &tuple(11, "a11"), &snap(11, &[10]))
                })
            };
            let b = {
                let storage = Arc::clone(&storage);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    storage.update(table, key(1), &tuple(12, "b12"), &snap(12, &[10, 11]))
                })
            };
            let res_a = a.join().unwrap();
            let res_b = b.join().unwrap();

            // The version-12 writer never conflicts: it either chained onto
            // 11 or onto the base insert.
            assert!(res_b.is_ok(), "round {round}: 12 failed: {res_b:?}");

            let newest = storage.get(table, key(1), &snap(13, &[10, 11, 12])).unwrap();
            assert_eq!(newest.data, tuple(12, "b12"));
            assert!(newest.is_newest);

            match res_a {
                Ok(()) => {
                    // Both landed: the chain must read 12 -> 11 -> insert.
                    let mid = storage.get(table, key(1), &snap(13, &[10, 11])).unwrap();
                    assert_eq!(mid.data, tuple(11, "a11"));
                    assert!(!mid.is_newest);
                }
                Err(VersoError::WriteConflict { .. }) => {
                    let mid = storage.get(table, key(1), &snap(13, &[10, 11])).unwrap();
                    assert_eq!(mid.data, tuple(0, "base"));
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
    }
}

/// Writers keep appending while the compactor sweeps; every successful
/// write must remain readable afterwards, and relocated records must keep
/// forwarding new updates (the pointer-swing retry protocol).
#[test]
fn compaction_races_concurrent_writers() {
    const KEYS: u64 = 64;
    const WRITERS: usize = 4;
    const OPS_PER_WRITER: usize = 300;

    let (storage, table) = fresh_table(TableKind::DeltaMain);
    let storage = Arc::new(storage);
    let clock = Arc::new(AtomicU64::new(100));
    // Highest version successfully written per key.
    let committed: Arc<Vec<Mutex<(u64, Vec<u8>)>>> = Arc::new(
        (0..KEYS)
            .map(|_| Mutex::new((0, Vec::new())))
            .collect(),
    );

    for k in 0..KEYS {
        let version = clock.fetch_add(1, Ordering::Relaxed);
        let data = tuple(k as i64, "seed");
        storage
            .insert(table, key(k + 1), &data, &writer_snap(version))
            .unwrap();
        *committed[k as usize].lock().unwrap() = (version, data);
    }

    let barrier = Arc::new(Barrier::new(WRITERS + 1));
    let mut handles = Vec::new();
    for w in 0..WRITERS {
        let storage = Arc::clone(&storage);
        let clock = Arc::clone(&clock);
        let committed = Arc::clone(&committed);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(0xC0FFEE + w as u64);
            barrier.wait();
            for i in 0..OPS_PER_WRITER {
                let k = rng.gen_range(0..KEYS);
                let version = clock.fetch_add(1, Ordering::Relaxed);
                let data = tuple((w * OPS_PER_WRITER + i) as i64, "racer");
                // Serialize the logical commit against other writers of the
                // same key so the expectation map stays exact.
                let mut slot = committed[k as usize].lock().unwrap();
                match storage.update(table, key(k + 1), &data, &writer_snap(version)) {
                    Ok(()) => *slot = (version, data),
                    Err(VersoError::WriteConflict { .. } | VersoError::NotFound) => {}
                    Err(other) => panic!("writer {w}: {other}"),
                }
            }
        }));
    }

    let gc_handle = {
        let storage = Arc::clone(&storage);
        let clock = Arc::clone(&clock);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for _ in 0..20 {
                let floor = clock.load(Ordering::Relaxed).saturating_sub(64);
                storage.run_gc(verso_types::Version::new(floor));
                thread::yield_now();
            }
        })
    };

    for handle in handles {
        handle.join().unwrap();
    }
    gc_handle.join().unwrap();

    let read_snap = snap_all(clock.load(Ordering::Relaxed) + 1);
    for k in 0..KEYS {
        let (version, data) = committed[k as usize].lock().unwrap().clone();
        let got = storage.get(table, key(k + 1), &read_snap).unwrap();
        assert_eq!(got.version.get(), version, "key {}", k + 1);
        assert_eq!(got.data, data, "key {}", k + 1);
    }
    // One more sweep over the settled table stays consistent.
    storage.run_gc(verso_types::Version::new(clock.load(Ordering::Relaxed)));
    for k in 0..KEYS {
        let (version, _) = committed[k as usize].lock().unwrap().clone();
        let got = storage.get(table, key(k + 1), &read_snap).unwrap();
        assert_eq!(got.version.get(), version, "key {} after settle sweep", k + 1);
    }
}

/// Concurrent inserts of the same key admit exactly one winner.
#[test]
fn same_key_inserts_admit_one_winner() {
    for kind in BOTH_KINDS {
        let (storage, table) = fresh_table(kind);
        let storage = Arc::new(storage);
        let barrier = Arc::new(Barrier::new(4));
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let storage = Arc::clone(&storage);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                storage
                    .insert(table, key(99), &tuple(t as i64, "i"), &snap(10 + t, &[]))
                    .is_ok()
            }));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ok| ok)
            .count();
        assert_eq!(wins, 1, "kind {kind:?}");
        assert!(storage.get(table, key(99), &snap_all(50)).is_ok());
    }
}

fn writer_snap(version: u64) -> SnapshotDescriptor {
    // Sees everything below its own version; the test's global clock hands
    // out unique, increasing versions.
    SnapshotDescriptor::from_parts(
        verso_types::Version::ZERO,
        verso_types::Version::new(version - 1),
        verso_types::Version::new(version),
        [],
    )
}
