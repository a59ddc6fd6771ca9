//! Lock-free open-addressed hash index: key to tagged pointer.
//!
//! Fixed capacity, linear probing, two-word slots (`key`, `value`). The
//! reserved key values are [`Key::EMPTY_RAW`] for never-used slots and
//! [`Key::TOMBSTONE_RAW`] for removed ones; a slot with a real key and a
//! zero value is pending or removed and reads as absent.
//!
//! Insert claims a free slot with CAS and then re-probes the prefix of its
//! probe sequence: if another thread claimed an earlier slot for the same
//! key concurrently, the later claim rolls itself back. This keeps at most
//! one live slot per key without locks.

use std::sync::atomic::{AtomicU64, Ordering};

use xxhash_rust::xxh3::xxh3_64;

use verso_types::Key;

use crate::tagged::TaggedPtr;

struct Slot {
    key: AtomicU64,
    value: AtomicU64,
}

/// Abstract mapping `key -> tagged pointer` with lock-free insert,
/// update-if-equal, and remove-if-equal.
pub struct HashIndex {
    slots: Box<[Slot]>,
    mask: usize,
}

impl HashIndex {
    /// Create an index with at least `capacity` slots (rounded up to a
    /// power of two).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let cap = capacity.next_power_of_two().max(16);
        let slots = (0..cap)
            .map(|_| Slot {
                key: AtomicU64::new(Key::EMPTY_RAW),
                value: AtomicU64::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: cap - 1,
        }
    }

    #[inline]
    fn start(&self, key: Key) -> usize {
        xxh3_64(&key.get().to_le_bytes()) as usize & self.mask
    }

    /// Look up the pointer for `key`.
    #[must_use]
    pub fn get(&self, key: Key) -> Option<TaggedPtr> {
        let raw_key = key.get();
        let mut idx = self.start(key);
        for _ in 0..self.slots.len() {
            let slot = &self.slots[idx];
            let k = slot.key.load(Ordering::Acquire);
            if k == Key::EMPTY_RAW {
                return None;
            }
            if k == raw_key {
                let v = slot.value.load(Ordering::Acquire);
                return if v == 0 {
                    None
                } else {
                    Some(TaggedPtr::from_raw(v))
                };
            }
            idx = (idx + 1) & self.mask;
        }
        None
    }

    /// Install `key -> ptr`. Fails if the key is already present (live or
    /// pending) or the table is full.
    pub fn insert(&self, key: Key, ptr: TaggedPtr) -> bool {
        debug_assert!(!ptr.is_null());
        let raw_key = key.get();
        'restart: loop {
            let start = self.start(key);
            let mut candidate = None;
            let mut idx = start;
            // Phase 1: find the key or the first free slot.
            for probe in 0..self.slots.len() {
                let slot = &self.slots[idx];
                let k = slot.key.load(Ordering::Acquire);
                if k == raw_key {
                    // Present (even if pending): the insert loses.
                    return false;
                }
                if k == Key::EMPTY_RAW {
                    candidate = Some((probe, idx, Key::EMPTY_RAW));
                    break;
                }
                if k == Key::TOMBSTONE_RAW && candidate.is_none() {
                    candidate = Some((probe, idx, Key::TOMBSTONE_RAW));
                }
                idx = (idx + 1) & self.mask;
            }
            let Some((probe_len, claim_idx, expected)) = candidate else {
                return false; // full
            };
            // Phase 2: claim.
            let slot = &self.slots[claim_idx];
            if slot
                .key
                .compare_exchange(expected, raw_key, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue 'restart;
            }
            slot.value.store(ptr.raw(), Ordering::Release);
            // Phase 3: verify no concurrent insert claimed an earlier slot
            // of the same probe sequence.
            let mut check = start;
            for _ in 0..probe_len {
                let other = &self.slots[check];
                if check != claim_idx && other.key.load(Ordering::Acquire) == raw_key {
                    // The earlier claim wins; roll ours back.
                    slot.value.store(0, Ordering::Release);
                    slot.key.store(Key::TOMBSTONE_RAW, Ordering::Release);
                    return false;
                }
                check = (check + 1) & self.mask;
            }
            return true;
        }
    }

    /// CAS the pointer for `key` from `old` to `new`. Fails if the key is
    /// absent or holds a different value.
    pub fn update_if_equal(&self, key: Key, old: TaggedPtr, new: TaggedPtr) -> bool {
        debug_assert!(!new.is_null());
        match self.slot_of(key) {
            Some(slot) => slot
                .value
                .compare_exchange(old.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            None => false,
        }
    }

    /// Remove `key` if it still maps to `expected`.
    pub fn remove_if_equal(&self, key: Key, expected: TaggedPtr) -> bool {
        match self.slot_of(key) {
            Some(slot) => {
                if slot
                    .value
                    .compare_exchange(expected.raw(), 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    slot.key.store(Key::TOMBSTONE_RAW, Ordering::Release);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    fn slot_of(&self, key: Key) -> Option<&Slot> {
        let raw_key = key.get();
        let mut idx = self.start(key);
        for _ in 0..self.slots.len() {
            let slot = &self.slots[idx];
            let k = slot.key.load(Ordering::Acquire);
            if k == Key::EMPTY_RAW {
                return None;
            }
            if k == raw_key {
                return Some(slot);
            }
            idx = (idx + 1) & self.mask;
        }
        None
    }

    /// Visit every live entry. The iteration is racy: each entry is read
    /// atomically but the set is not a snapshot. Callers (GC, scans)
    /// re-validate through [`get`](Self::get) before acting.
    pub fn for_each(&self, mut f: impl FnMut(Key, TaggedPtr)) {
        for slot in self.slots.iter() {
            let k = slot.key.load(Ordering::Acquire);
            if k == Key::EMPTY_RAW || k == Key::TOMBSTONE_RAW {
                continue;
            }
            let v = slot.value.load(Ordering::Acquire);
            if v == 0 {
                continue;
            }
            if let Some(key) = Key::new(k) {
                f(key, TaggedPtr::from_raw(v));
            }
        }
    }
}

impl std::fmt::Debug for HashIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashIndex")
            .field("capacity", &self.slots.len())
            .finish_non_exhaustive()
    }
}
