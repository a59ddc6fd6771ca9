//! The log-structured table layout.
//!
//! Every version of every record lives in one chunked log; the hash index
//! points at the chain head. A head is either an INSERT entry whose link
//! is the update-chain head (`newest`), or, after the insert has been
//! collected, an UPDATE/DELETE entry reached directly. Updates and deletes
//! chain downward through their `previous` links; versions strictly
//! decrease from head to tail.
//!
//! Writers serialize per key by CAS: on the insert's `newest` link when
//! the head is an INSERT, on the hash slot when the head is a direct
//! update entry. The garbage collector splices reverted entries out of
//! chains, truncates shadowed tails, swings heads off dead inserts, and
//! recycles chunks whose entries have all been retired.

use parking_lot::Mutex;
use smallvec::SmallVec;

use verso_error::{Result, VersoError};
use verso_types::{Key, SnapshotDescriptor, Version};

use crate::gc::{keep_plan, GcStats, KeepPlan};
use crate::hash::HashIndex;
use crate::log::{EntryKind, EntryRef, Log};
use crate::pool::PagePool;
use crate::store::ReadOutcome;
use crate::tagged::{ContainerKind, PtrTag, TaggedPtr};

type Chain = SmallVec<[EntryRef; 8]>;

/// A table backed purely by the log.
pub struct LogTable {
    hash: HashIndex,
    log: Log,
    gc_lock: Mutex<()>,
}

impl LogTable {
    #[must_use]
    pub fn new(pool: PagePool, hash_capacity: usize) -> Self {
        Self {
            hash: HashIndex::new(hash_capacity),
            log: Log::new(pool, ContainerKind::Log),
            gc_lock: Mutex::new(()),
        }
    }

    /// Walk the chain from `head`, newest to oldest, including reverted
    /// entries. Returns the observed `newest` word of an INSERT head (the
    /// CAS expectation) alongside the entries. `None` means a link could
    /// not be resolved (chunk recycled or head mid-replacement); the
    /// caller restarts from the hash index.
    fn collect_chain(&self, head: &EntryRef) -> Option<(TaggedPtr, Chain)> {
        let mut chain = Chain::new();
        let observed;
        match head.entry().kind() {
            EntryKind::Insert => {
                observed = head.entry().link();
                let mut cursor = observed;
                while !cursor.is_null() {
                    if cursor.is_invalid() {
                        // Head is being invalidated or replaced by GC.
                        return None;
                    }
                    debug_assert_eq!(cursor.tag(), PtrTag::Update);
                    let entry = self.log.resolve(cursor.loc())?;
                    let next = entry.entry().link();
                    chain.push(entry);
                    cursor = next;
                }
                chain.push(head.clone());
            }
            EntryKind::Update | EntryKind::Delete => {
                observed = TaggedPtr::NULL;
                chain.push(head.clone());
                let mut cursor = head.entry().link();
                while !cursor.is_null() {
                    if cursor.is_invalid() {
                        return None;
                    }
                    let entry = self.log.resolve(cursor.loc())?;
                    let next = entry.entry().link();
                    chain.push(entry);
                    cursor = next;
                }
            }
        }
        debug_assert!(chain
            .windows(2)
            .all(|w| w[0].entry().version() > w[1].entry().version()));
        Some((observed, chain))
    }

    fn resolve_head(&self, ptr: TaggedPtr) -> Option<EntryRef> {
        if ptr.is_null() || ptr.is_invalid() {
            return None;
        }
        self.log.resolve(ptr.loc())
    }

    pub fn get(&self, key: Key, snapshot: &SnapshotDescriptor) -> ReadOutcome {
        loop {
            let Some(head_ptr) = self.hash.get(key) else {
                return ReadOutcome::Absent;
            };
            let Some(head) = self.resolve_head(head_ptr) else {
                continue;
            };
            let Some((_, chain)) = self.collect_chain(&head) else {
                continue;
            };
            let mut newest_seen = false;
            for entry in &chain {
                let e = entry.entry();
                if e.is_reverted() {
                    continue;
                }
                let is_newest = !newest_seen;
                newest_seen = true;
                if snapshot.visible(e.version()) {
                    return if e.is_delete() {
                        ReadOutcome::Deleted {
                            version: e.version(),
                            is_newest,
                        }
                    } else {
                        ReadOutcome::Found {
                            version: e.version(),
                            is_newest,
                            payload: e.payload().to_vec(),
                        }
                    };
                }
            }
            return ReadOutcome::Absent;
        }
    }

    pub fn insert(&self, key: Key, payload: &[u8], snapshot: &SnapshotDescriptor) -> Result<()> {
        loop {
            let Some(head_ptr) = self.hash.get(key) else {
                let entry = self.log.append(
                    EntryKind::Insert,
                    key,
                    snapshot.version(),
                    TaggedPtr::NULL,
                    payload.into(),
                )?;
                let ptr = TaggedPtr::new(entry.loc(), PtrTag::Update);
                if self.hash.insert(key, ptr) {
                    return Ok(());
                }
                // Lost the install race; the entry is unreachable garbage.
                entry.entry().set_reverted();
                entry.retire();
                continue;
            };
            let Some(head) = self.resolve_head(head_ptr) else {
                continue;
            };
            let Some((observed, chain)) = self.collect_chain(&head) else {
                continue;
            };
            let Some(newest) = chain.iter().find(|e| !e.entry().is_reverted()) else {
                // Every version was reverted: replace the dead head with a
                // fresh INSERT.
                let entry = self.log.append(
                    EntryKind::Insert,
                    key,
                    snapshot.version(),
                    TaggedPtr::NULL,
                    payload.into(),
                )?;
                let ptr = TaggedPtr::new(entry.loc(), PtrTag::Update);
                if self.hash.update_if_equal(key, head_ptr, ptr) {
                    for old in &chain {
                        old.retire();
                    }
                    return Ok(());
                }
                entry.entry().set_reverted();
                entry.retire();
                continue;
            };
            let newest_version = newest.entry().version();
            if !snapshot.visible(newest_version) {
                return Err(VersoError::WriteConflict { key: key.get() });
            }
            if !newest.entry().is_delete() {
                // Live key: insert loses.
                return Err(VersoError::WriteConflict { key: key.get() });
            }
            // Deleted key: revive by chaining a data entry onto the record.
            let newest_physical = chain[0].entry().version();
            if self.chain_write(
                key,
                EntryKind::Update,
                payload,
                snapshot,
                head_ptr,
                &head,
                observed,
                newest_physical,
            )? {
                return Ok(());
            }
        }
    }

    pub fn update(&self, key: Key, payload: &[u8], snapshot: &SnapshotDescriptor) -> Result<()> {
        self.mutate(key, EntryKind::Update, payload, snapshot)
    }

    pub fn remove(&self, key: Key, snapshot: &SnapshotDescriptor) -> Result<()> {
        self.mutate(key, EntryKind::Delete, &[], snapshot)
    }

    fn mutate(
        &self,
        key: Key,
        kind: EntryKind,
        payload: &[u8],
        snapshot: &SnapshotDescriptor,
    ) -> Result<()> {
        loop {
            let Some(head_ptr) = self.hash.get(key) else {
                return Err(VersoError::NotFound);
            };
            let Some(head) = self.resolve_head(head_ptr) else {
                continue;
            };
            let Some((observed, chain)) = self.collect_chain(&head) else {
                continue;
            };
            let Some(newest) = chain.iter().find(|e| !e.entry().is_reverted()) else {
                return Err(VersoError::NotFound);
            };
            let newest_version = newest.entry().version();
            if !snapshot.visible(newest_version) {
                return Err(VersoError::WriteConflict { key: key.get() });
            }
            if newest.entry().is_delete() {
                return Err(VersoError::NotFound);
            }
            let newest_physical = chain[0].entry().version();
            if self.chain_write(
                key,
                kind,
                payload,
                snapshot,
                head_ptr,
                &head,
                observed,
                newest_physical,
            )? {
                return Ok(());
            }
        }
    }

    /// Append a new chain head entry and publish it with CAS. Returns
    /// `Ok(false)` on a benign CAS loss (caller re-observes and retries).
    #[allow(clippy::too_many_arguments)]
    fn chain_write(
        &self,
        key: Key,
        kind: EntryKind,
        payload: &[u8],
        snapshot: &SnapshotDescriptor,
        head_ptr: TaggedPtr,
        head: &EntryRef,
        observed: TaggedPtr,
        newest_physical: Version,
    ) -> Result<bool> {
        let version = snapshot.version();
        if version <= newest_physical {
            return Err(VersoError::WriteConflict { key: key.get() });
        }
        let previous = match head.entry().kind() {
            EntryKind::Insert => observed,
            _ => head_ptr,
        };
        let entry = self.log.append(kind, key, version, previous, payload.into())?;
        let ptr = TaggedPtr::new(entry.loc(), PtrTag::Update);
        let installed = match head.entry().kind() {
            EntryKind::Insert => head.entry().cas_link(observed, ptr).is_ok(),
            _ => self.hash.update_if_equal(key, head_ptr, ptr),
        };
        if installed {
            tracing::trace!(key = %key, version = version.get(), kind = ?kind, "chain head published");
            Ok(true)
        } else {
            entry.entry().set_reverted();
            entry.retire();
            Ok(false)
        }
    }

    /// Mark the entry at the snapshot's own version reverted. No-op when
    /// that version is not on the chain.
    pub fn revert(&self, key: Key, snapshot: &SnapshotDescriptor) -> Result<()> {
        let target = snapshot.version();
        loop {
            let Some(head_ptr) = self.hash.get(key) else {
                return Ok(());
            };
            let Some(head) = self.resolve_head(head_ptr) else {
                continue;
            };
            let Some((_, chain)) = self.collect_chain(&head) else {
                continue;
            };
            for entry in &chain {
                let e = entry.entry();
                if e.version() == target {
                    e.set_reverted();
                    return Ok(());
                }
                if e.version() < target {
                    break;
                }
            }
            return Ok(());
        }
    }

    /// Deliver each key's newest snapshot-visible version to `sink`.
    pub fn scan(&self, snapshot: &SnapshotDescriptor, sink: &mut dyn FnMut(Key, Version, &[u8])) {
        let mut keys = Vec::new();
        self.hash.for_each(|key, _| keys.push(key));
        for key in keys {
            if let ReadOutcome::Found {
                version, payload, ..
            } = self.get(key, snapshot)
            {
                sink(key, version, &payload);
            }
        }
    }

    /// Sweep every chain against `min_version` and recycle dead chunks.
    pub fn run_gc(&self, min_version: Version) -> GcStats {
        let _guard = self.gc_lock.lock();
        let mut stats = GcStats::default();
        let mut keys = Vec::new();
        self.hash.for_each(|key, _| keys.push(key));
        for key in keys {
            self.collect_key(key, min_version, &mut stats);
        }
        stats.chunks_recycled += self.log.truncate_while(|c| c.is_fully_retired()) as u64;
        stats
    }

    fn collect_key(&self, key: Key, min_version: Version, stats: &mut GcStats) {
        'restart: loop {
            let Some(head_ptr) = self.hash.get(key) else {
                return;
            };
            let Some(head) = self.resolve_head(head_ptr) else {
                return;
            };
            let Some((observed, chain)) = self.collect_chain(&head) else {
                // Only this sweeper invalidates or recycles; a broken walk
                // here means the key is mid-mutation, skip it this round.
                return;
            };
            let survivors_idx: SmallVec<[usize; 8]> = {
                let nonrev: SmallVec<[usize; 8]> = chain
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| !e.entry().is_reverted())
                    .map(|(i, _)| i)
                    .collect();
                let versions: SmallVec<[(Version, bool); 8]> = nonrev
                    .iter()
                    .map(|&i| {
                        let e = chain[i].entry();
                        (e.version(), e.is_delete())
                    })
                    .collect();
                match keep_plan(&versions, min_version) {
                    KeepPlan::Dead => {
                        match head.entry().kind() {
                            EntryKind::Insert => {
                                // Lock writers out of the dying insert head
                                // before unhooking the key.
                                if head
                                    .entry()
                                    .cas_link(observed, TaggedPtr::INVALID)
                                    .is_err()
                                {
                                    continue 'restart;
                                }
                                if !self.hash.remove_if_equal(key, head_ptr) {
                                    tracing::warn!(key = %key, "hash removal failed after head invalidation");
                                }
                            }
                            _ => {
                                // Direct heads are guarded by the hash slot;
                                // the conditional remove is the
                                // linearization point against writers.
                                if !self.hash.remove_if_equal(key, head_ptr) {
                                    continue 'restart;
                                }
                            }
                        }
                        stats.records_removed += 1;
                        for entry in &chain {
                            entry.retire();
                        }
                        stats.entries_discarded += chain.len() as u64;
                        return;
                    }
                    KeepPlan::Keep {
                        prefix,
                        keep_one_below,
                    } => {
                        let mut idx: SmallVec<[usize; 8]> =
                            nonrev[..prefix].iter().copied().collect();
                        if keep_one_below {
                            idx.push(nonrev[prefix]);
                        }
                        idx
                    }
                }
            };
            if survivors_idx.len() == chain.len() {
                // Nothing to splice.
                return;
            }

            // The insert entry can only be the chain tail; updates above it
            // re-link through their previous pointers.
            let head_is_insert = head.entry().kind() == EntryKind::Insert;
            let insert_survives =
                head_is_insert && survivors_idx.last() == Some(&(chain.len() - 1));

            // Fix inner links of surviving update entries so they skip the
            // discarded ones. Links of update entries are never CASed by
            // writers, so plain stores are safe here.
            let update_survivors: &[usize] = if insert_survives {
                &survivors_idx[..survivors_idx.len() - 1]
            } else {
                &survivors_idx
            };
            for w in 0..update_survivors.len() {
                let i = update_survivors[w];
                let next = update_survivors
                    .get(w + 1)
                    .map(|&j| TaggedPtr::new(chain[j].loc(), PtrTag::Update))
                    .unwrap_or(TaggedPtr::NULL);
                if chain[i].entry().link() != next {
                    chain[i].entry().store_link(next);
                }
            }

            // Publish the new head.
            let new_head_ok = if head_is_insert {
                if insert_survives {
                    let new_newest = update_survivors
                        .first()
                        .map(|&j| TaggedPtr::new(chain[j].loc(), PtrTag::Update))
                        .unwrap_or(TaggedPtr::NULL);
                    if new_newest == observed {
                        true
                    } else {
                        head.entry().cas_link(observed, new_newest).is_ok()
                    }
                } else {
                    // The insert dies; lock writers out, then swing the
                    // hash to the surviving update head.
                    if head.entry().cas_link(observed, TaggedPtr::INVALID).is_ok() {
                        let new_head = TaggedPtr::new(
                            chain[survivors_idx[0]].loc(),
                            PtrTag::Update,
                        );
                        if !self.hash.update_if_equal(key, head_ptr, new_head) {
                            tracing::warn!(key = %key, "hash swing failed after head invalidation");
                        }
                        true
                    } else {
                        false
                    }
                }
            } else {
                // Direct head: survives iff it is survivor 0.
                if survivors_idx.first() == Some(&0) {
                    true
                } else {
                    let new_head =
                        TaggedPtr::new(chain[survivors_idx[0]].loc(), PtrTag::Update);
                    self.hash.update_if_equal(key, head_ptr, new_head)
                }
            };
            if !new_head_ok {
                continue 'restart;
            }
            let mut discarded = 0u64;
            for (i, entry) in chain.iter().enumerate() {
                if !survivors_idx.contains(&i) {
                    entry.retire();
                    discarded += 1;
                }
            }
            stats.entries_discarded += discarded;
            stats.entries_relocated += survivors_idx.len() as u64;
            return;
        }
    }

    #[cfg(test)]
    pub(crate) fn chunk_count(&self) -> usize {
        self.log.chunks().len()
    }
}

impl std::fmt::Debug for LogTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogTable").field("log", &self.log).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> LogTable {
        LogTable::new(PagePool::new(64), 1 << 10)
    }

    fn key(raw: u64) -> Key {
        Key::new(raw).unwrap()
    }

    fn snap(version: u64, visible: &[u64]) -> SnapshotDescriptor {
        SnapshotDescriptor::with_committed(
            Version::new(version),
            visible.iter().map(|&v| Version::new(v)),
        )
    }

    fn found(outcome: ReadOutcome) -> (u64, bool, Vec<u8>) {
        match outcome {
            ReadOutcome::Found {
                version,
                is_newest,
                payload,
            } => (version.get(), is_newest, payload),
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[test]
    fn chain_grows_newest_first() {
        let t = table();
        t.insert(key(1), b"a", &snap(10, &[])).unwrap();
        t.update(key(1), b"b", &snap(12, &[10])).unwrap();
        t.update(key(1), b"c", &snap(14, &[10, 12])).unwrap();

        let (version, is_newest, payload) = found(t.get(key(1), &snap(20, &[10, 12, 14])));
        assert_eq!((version, is_newest, payload.as_slice()), (14, true, &b"c"[..]));
        let (version, is_newest, _) = found(t.get(key(1), &snap(13, &[10, 12])));
        assert_eq!((version, is_newest), (12, false));
    }

    #[test]
    fn gc_splices_reverted_entries_out() {
        let t = table();
        t.insert(key(1), b"a", &snap(10, &[])).unwrap();
        let writer = snap(12, &[10]);
        t.update(key(1), b"b", &writer).unwrap();
        t.update(key(1), b"c", &snap(14, &[10, 12])).unwrap();
        t.revert(key(1), &writer).unwrap();

        let mut stats = GcStats::default();
        t.collect_key(key(1), Version::new(1), &mut stats);
        assert_eq!(stats.entries_discarded, 1);

        // The reverted version stays invisible and the rest survives.
        assert!(matches!(
            t.get(key(1), &snap(13, &[10, 12])),
            ReadOutcome::Found { version, .. } if version == Version::new(10)
        ));
        let (version, _, payload) = found(t.get(key(1), &snap(20, &[10, 12, 14])));
        assert_eq!((version, payload.as_slice()), (14, &b"c"[..]));
    }

    #[test]
    fn gc_swings_the_head_off_a_dead_insert() {
        let t = table();
        t.insert(key(1), b"a", &snap(10, &[])).unwrap();
        t.update(key(1), b"b", &snap(20, &[10])).unwrap();

        let mut stats = GcStats::default();
        t.collect_key(key(1), Version::new(15), &mut stats);
        assert_eq!(stats.entries_discarded, 1);

        // The insert is gone; the update entry is the direct head now.
        let head_ptr = t.hash.get(key(1)).unwrap();
        let head = t.resolve_head(head_ptr).unwrap();
        assert_eq!(head.entry().kind(), EntryKind::Update);
        let (version, _, payload) = found(t.get(key(1), &snap(25, &[20])));
        assert_eq!((version, payload.as_slice()), (20, &b"b"[..]));
        assert!(matches!(t.get(key(1), &snap(16, &[10])), ReadOutcome::Absent));

        // Chains headed by a direct update keep accepting writes.
        t.update(key(1), b"c", &snap(30, &[10, 20])).unwrap();
        let (version, _, payload) = found(t.get(key(1), &snap(35, &[20, 30])));
        assert_eq!((version, payload.as_slice()), (30, &b"c"[..]));
    }

    #[test]
    fn gc_recycles_fully_dead_chunks() {
        let t = table();
        // Burn through more than one chunk of short-lived records.
        let mut version = 1u64;
        for k in 1..=3000u64 {
            t.insert(key(k), b"x", &snap(version, &[])).unwrap();
            t.remove(key(k), &snap(version + 1, &[version])).unwrap();
            version += 2;
        }
        assert!(t.chunk_count() >= 2);
        let stats = t.run_gc(Version::new(version));
        assert_eq!(stats.records_removed, 3000);
        assert!(stats.chunks_recycled >= 1, "stats: {stats:?}");
        assert!(t.chunk_count() < 2);
    }
}
