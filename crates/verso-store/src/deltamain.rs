//! The delta-main table layout.
//!
//! A record lives either in the insert log (freshly born) or as a run of
//! column-map main entries (after compaction), with newer versions hanging
//! off the record's `newest` atomic as a forward-linked update log. The
//! hash index points at the insert entry or the run's first main entry.
//!
//! `newest` is a tagged word: an update-log pointer heads the update
//! chain, a MAIN-tagged pointer forwards to the relocated main entry, and
//! INVALID marks a record logically deleted by compaction. Readers follow
//! forwards and reconcile the update chain (strictly newer than any main
//! version) with the main run under the snapshot. Writers CAS `newest`;
//! the compactor swings it with its own retry protocol.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use verso_error::{Result, VersoError};
use verso_types::{Key, Schema, SnapshotDescriptor, Version};

use crate::colmap::ColumnMapMainPage;
use crate::gc::GcStats;
use crate::hash::HashIndex;
use crate::log::{EntryKind, EntryRef, Log};
use crate::pool::PagePool;
use crate::store::ReadOutcome;
use crate::tagged::{ContainerKind, Loc, PtrTag, TaggedPtr};

/// Registry of published main pages, addressed by 1-based page id.
pub struct PageRegistry {
    slots: RwLock<Vec<Option<Arc<ColumnMapMainPage>>>>,
}

impl PageRegistry {
    fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Claim the id the next installed page will use.
    pub fn reserve_id(&self) -> u32 {
        let mut slots = self.slots.write();
        slots.push(None);
        slots.len() as u32
    }

    pub fn install(&self, page: Arc<ColumnMapMainPage>) {
        let id = page.id();
        let mut slots = self.slots.write();
        let slot = &mut slots[(id - 1) as usize];
        debug_assert!(slot.is_none(), "page id installed twice");
        *slot = Some(page);
    }

    #[must_use]
    pub fn resolve(&self, id: u32) -> Option<Arc<ColumnMapMainPage>> {
        self.slots
            .read()
            .get((id - 1) as usize)
            .and_then(Clone::clone)
    }

    pub fn retire(&self, id: u32) {
        self.slots.write()[(id - 1) as usize] = None;
    }
}

/// Where the hash index (or a forward) landed for a record.
pub(crate) enum RecordHead {
    /// A log-resident record; the CAS point is the insert's link.
    Insert(EntryRef),
    /// A main-resident record; the CAS point is the run head's `newest`.
    Main(Arc<ColumnMapMainPage>, usize),
}

impl RecordHead {
    fn observed(&self) -> TaggedPtr {
        match self {
            Self::Insert(e) => e.entry().link(),
            Self::Main(p, i) => p.entry(*i).newest(),
        }
    }

    /// The newest version stored at the head itself (the update-chain walk
    /// bound: chain entries are strictly newer).
    fn base_version(&self) -> Version {
        match self {
            Self::Insert(e) => e.entry().version(),
            Self::Main(p, i) => p.entry(*i).version(),
        }
    }
}

pub(crate) enum Locate {
    Head(RecordHead),
    /// The record was logically deleted by compaction.
    Dead,
    /// A pointer could not be resolved; restart from the hash index.
    Dangling,
}

/// A table with a columnar main area and per-record update logs.
pub struct DeltaMainTable {
    schema: Arc<Schema>,
    pool: PagePool,
    pub(crate) hash: HashIndex,
    pub(crate) insert_log: Log,
    pub(crate) update_log: Log,
    pub(crate) pages: RwLock<Vec<Arc<ColumnMapMainPage>>>,
    pub(crate) registry: PageRegistry,
    pub(crate) gc_lock: Mutex<()>,
}

impl DeltaMainTable {
    #[must_use]
    pub fn new(pool: PagePool, schema: Arc<Schema>, hash_capacity: usize) -> Self {
        Self {
            schema,
            hash: HashIndex::new(hash_capacity),
            insert_log: Log::new(pool.clone(), ContainerKind::Log),
            update_log: Log::new(pool.clone(), ContainerKind::UpdateLog),
            pages: RwLock::new(Vec::new()),
            registry: PageRegistry::new(),
            pool,
            gc_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    #[must_use]
    pub(crate) fn pool(&self) -> &PagePool {
        &self.pool
    }

    /// Resolve a hash value or forward to the record head, following
    /// MAIN-tagged forwards.
    pub(crate) fn locate(&self, ptr: TaggedPtr) -> Locate {
        if ptr.is_null() || ptr.is_invalid() {
            return Locate::Dangling;
        }
        let mut cursor = ptr;
        loop {
            match cursor.tag() {
                PtrTag::Update => match cursor.loc().kind {
                    ContainerKind::Log => match self.insert_log.resolve(cursor.loc()) {
                        Some(e) => {
                            let link = e.entry().link();
                            if link.is_invalid() {
                                return Locate::Dead;
                            }
                            if !link.is_null() && link.tag() == PtrTag::Main {
                                cursor = link;
                                continue;
                            }
                            return Locate::Head(RecordHead::Insert(e));
                        }
                        None => return Locate::Dangling,
                    },
                    _ => return Locate::Dangling,
                },
                PtrTag::Main => {
                    debug_assert_eq!(cursor.loc().kind, ContainerKind::Page);
                    let Some(page) = self.registry.resolve(cursor.loc().container) else {
                        return Locate::Dangling;
                    };
                    let idx = cursor.loc().slot as usize;
                    let newest = page.entry(idx).newest();
                    if newest.is_invalid() {
                        return Locate::Dead;
                    }
                    if !newest.is_null() && newest.tag() == PtrTag::Main {
                        cursor = newest;
                        continue;
                    }
                    return Locate::Head(RecordHead::Main(page, idx));
                }
                PtrTag::Invalid => return Locate::Dangling,
            }
        }
    }

    /// Walk the update chain from `observed` down to (exclusive) the head's
    /// base version. `None` when a link dangles.
    pub(crate) fn collect_updates(
        &self,
        observed: TaggedPtr,
        bound: Version,
    ) -> Option<SmallVec<[EntryRef; 8]>> {
        let mut chain = SmallVec::new();
        let mut cursor = observed;
        while !cursor.is_null() {
            if cursor.is_invalid() || cursor.tag() != PtrTag::Update {
                return None;
            }
            let entry = self.update_log.resolve(cursor.loc())?;
            if entry.entry().version() <= bound {
                break;
            }
            let next = entry.entry().link();
            chain.push(entry);
            cursor = next;
        }
        Some(chain)
    }

    /// Resolve the record under the snapshot. `None` means restart.
    fn read_record(&self, head: &RecordHead, snapshot: &SnapshotDescriptor) -> Option<ReadOutcome> {
        let observed = head.observed();
        if observed.is_invalid() {
            return Some(ReadOutcome::Absent);
        }
        if !observed.is_null() && observed.tag() == PtrTag::Main {
            // Forwarded between locate and here.
            return None;
        }
        let updates = self.collect_updates(observed, head.base_version())?;
        let mut newest_seen = false;
        for entry in &updates {
            let e = entry.entry();
            if e.is_reverted() {
                continue;
            }
            let is_newest = !newest_seen;
            newest_seen = true;
            if snapshot.visible(e.version()) {
                return Some(if e.is_delete() {
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
                });
            }
        }
        match head {
            RecordHead::Insert(e) => {
                let e = e.entry();
                if !e.is_reverted() {
                    let is_newest = !newest_seen;
                    if snapshot.visible(e.version()) {
                        return Some(ReadOutcome::Found {
                            version: e.version(),
                            is_newest,
                            payload: e.payload().to_vec(),
                        });
                    }
                }
            }
            RecordHead::Main(page, start) => {
                let end = page.run_end(*start);
                for i in *start..end {
                    let entry = page.entry(i);
                    if entry.is_reverted() {
                        continue;
                    }
                    let is_newest = !newest_seen;
                    newest_seen = true;
                    if snapshot.visible(entry.version()) {
                        return Some(if page.is_tombstone(i) {
                            ReadOutcome::Deleted {
                                version: entry.version(),
                                is_newest,
                            }
                        } else {
                            ReadOutcome::Found {
                                version: entry.version(),
                                is_newest,
                                payload: page.reconstruct_tuple(i),
                            }
                        });
                    }
                }
            }
        }
        Some(ReadOutcome::Absent)
    }

    pub fn get(&self, key: Key, snapshot: &SnapshotDescriptor) -> ReadOutcome {
        loop {
            let Some(ptr) = self.hash.get(key) else {
                return ReadOutcome::Absent;
            };
            let head = match self.locate(ptr) {
                Locate::Head(head) => head,
                Locate::Dead => return ReadOutcome::Absent,
                Locate::Dangling => continue,
            };
            if let Some(outcome) = self.read_record(&head, snapshot) {
                return outcome;
            }
        }
    }

    /// The newest non-reverted logical entry: `(version, is_delete)`, or
    /// `None` when every version is reverted. Also returns the newest
    /// physical version on the chain (for write ordering) and the observed
    /// CAS expectation. `Err(())` means restart.
    #[allow(clippy::type_complexity)]
    fn observe_for_write(
        &self,
        head: &RecordHead,
    ) -> std::result::Result<(TaggedPtr, Version, Option<(Version, bool)>), ()> {
        let observed = head.observed();
        if observed.is_invalid() || (!observed.is_null() && observed.tag() == PtrTag::Main) {
            return Err(());
        }
        let updates = self.collect_updates(observed, head.base_version()).ok_or(())?;
        let newest_physical = updates
            .first()
            .map_or(head.base_version(), |e| e.entry().version());
        for entry in &updates {
            let e = entry.entry();
            if !e.is_reverted() {
                return Ok((observed, newest_physical, Some((e.version(), e.is_delete()))));
            }
        }
        let newest = match head {
            RecordHead::Insert(e) => {
                let e = e.entry();
                (!e.is_reverted()).then(|| (e.version(), false))
            }
            RecordHead::Main(page, start) => {
                let end = page.run_end(*start);
                (*start..end)
                    .find(|&i| !page.entry(i).is_reverted())
                    .map(|i| (page.entry(i).version(), page.is_tombstone(i)))
            }
        };
        Ok((observed, newest_physical, newest))
    }

    /// Append an update-log entry and CAS it onto the record. `false` on a
    /// benign CAS loss.
    fn chain_write(
        &self,
        key: Key,
        kind: EntryKind,
        payload: &[u8],
        version: Version,
        head: &RecordHead,
        observed: TaggedPtr,
    ) -> Result<bool> {
        let previous = if observed.is_null() {
            TaggedPtr::NULL
        } else {
            observed
        };
        let entry = self
            .update_log
            .append(kind, key, version, previous, payload.into())?;
        let ptr = TaggedPtr::new(entry.loc(), PtrTag::Update);
        let installed = match head {
            RecordHead::Insert(e) => e.entry().cas_link(observed, ptr).is_ok(),
            RecordHead::Main(page, i) => page.entry(*i).cas_newest(observed, ptr).is_ok(),
        };
        if installed {
            tracing::trace!(key = %key, version = version.get(), kind = ?kind, "update chained");
            Ok(true)
        } else {
            entry.entry().set_reverted();
            entry.retire();
            Ok(false)
        }
    }

    pub fn insert(&self, key: Key, payload: &[u8], snapshot: &SnapshotDescriptor) -> Result<()> {
        loop {
            let Some(ptr) = self.hash.get(key) else {
                let entry = self.insert_log.append(
                    EntryKind::Insert,
                    key,
                    snapshot.version(),
                    TaggedPtr::NULL,
                    payload.into(),
                )?;
                let new = TaggedPtr::new(entry.loc(), PtrTag::Update);
                if self.hash.insert(key, new) {
                    return Ok(());
                }
                entry.entry().set_reverted();
                entry.retire();
                continue;
            };
            match self.locate(ptr) {
                Locate::Dead => {
                    // Replace the logically deleted record.
                    let entry = self.insert_log.append(
                        EntryKind::Insert,
                        key,
                        snapshot.version(),
                        TaggedPtr::NULL,
                        payload.into(),
                    )?;
                    let new = TaggedPtr::new(entry.loc(), PtrTag::Update);
                    if self.hash.update_if_equal(key, ptr, new) {
                        return Ok(());
                    }
                    entry.entry().set_reverted();
                    entry.retire();
                    continue;
                }
                Locate::Dangling => continue,
                Locate::Head(head) => {
                    let Ok((observed, newest_physical, newest)) = self.observe_for_write(&head)
                    else {
                        continue;
                    };
                    let Some((newest_version, newest_is_delete)) = newest else {
                        // Only reverted versions: revive through the
                        // existing record's chain.
                        if snapshot.version() <= newest_physical {
                            return Err(VersoError::WriteConflict { key: key.get() });
                        }
                        if self.chain_write(
                            key,
                            EntryKind::Update,
                            payload,
                            snapshot.version(),
                            &head,
                            observed,
                        )? {
                            return Ok(());
                        }
                        continue;
                    };
                    if !snapshot.visible(newest_version) {
                        return Err(VersoError::WriteConflict { key: key.get() });
                    }
                    if !newest_is_delete {
                        return Err(VersoError::WriteConflict { key: key.get() });
                    }
                    if snapshot.version() <= newest_physical {
                        return Err(VersoError::WriteConflict { key: key.get() });
                    }
                    if self.chain_write(
                        key,
                        EntryKind::Update,
                        payload,
                        snapshot.version(),
                        &head,
                        observed,
                    )? {
                        return Ok(());
                    }
                }
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
            let Some(ptr) = self.hash.get(key) else {
                return Err(VersoError::NotFound);
            };
            let head = match self.locate(ptr) {
                Locate::Head(head) => head,
                Locate::Dead => return Err(VersoError::NotFound),
                Locate::Dangling => continue,
            };
            let Ok((observed, newest_physical, newest)) = self.observe_for_write(&head) else {
                continue;
            };
            let Some((newest_version, newest_is_delete)) = newest else {
                return Err(VersoError::NotFound);
            };
            if !snapshot.visible(newest_version) {
                return Err(VersoError::WriteConflict { key: key.get() });
            }
            if newest_is_delete {
                return Err(VersoError::NotFound);
            }
            if snapshot.version() <= newest_physical {
                return Err(VersoError::WriteConflict { key: key.get() });
            }
            if self.chain_write(key, kind, payload, snapshot.version(), &head, observed)? {
                return Ok(());
            }
        }
    }

    /// Mark the entry at the snapshot's own version reverted, wherever it
    /// lives (update log, insert log, or main). No-op when absent.
    pub fn revert(&self, key: Key, snapshot: &SnapshotDescriptor) -> Result<()> {
        let target = snapshot.version();
        loop {
            let Some(ptr) = self.hash.get(key) else {
                return Ok(());
            };
            let head = match self.locate(ptr) {
                Locate::Head(head) => head,
                Locate::Dead => return Ok(()),
                Locate::Dangling => continue,
            };
            let observed = head.observed();
            if observed.is_invalid() || (!observed.is_null() && observed.tag() == PtrTag::Main) {
                continue;
            }
            let Some(updates) = self.collect_updates(observed, head.base_version()) else {
                continue;
            };
            for entry in &updates {
                let e = entry.entry();
                if e.version() == target {
                    e.set_reverted();
                    return Ok(());
                }
                if e.version() < target {
                    return Ok(());
                }
            }
            match &head {
                RecordHead::Insert(e) => {
                    if e.entry().version() == target {
                        e.entry().set_reverted();
                    }
                }
                RecordHead::Main(page, start) => {
                    let end = page.run_end(*start);
                    for i in *start..end {
                        let entry = page.entry(i);
                        if entry.version() == target {
                            entry.set_reverted();
                            break;
                        }
                        if entry.version() < target {
                            break;
                        }
                    }
                }
            }
            return Ok(());
        }
    }

    /// Deliver each live record's newest snapshot-visible version. Main
    /// pages are iterated columnar-run by columnar-run, then the insert
    /// log contributes records not yet folded into main.
    pub fn scan(&self, snapshot: &SnapshotDescriptor, sink: &mut dyn FnMut(Key, Version, &[u8])) {
        let pages = self.pages.read().clone();
        let page_ids: HashSet<u32> = pages.iter().map(|p| p.id()).collect();

        let mut emit = |key: Key, mut head: RecordHead| loop {
            match self.read_record(&head, snapshot) {
                Some(ReadOutcome::Found {
                    version, payload, ..
                }) => {
                    sink(key, version, &payload);
                    return;
                }
                Some(_) => return,
                None => {
                    // Forwarded mid-read: restart through the hash index.
                    match self.hash.get(key).map(|p| self.locate(p)) {
                        Some(Locate::Head(h)) => head = h,
                        _ => return,
                    }
                }
            }
        };

        for page in &pages {
            for (key, run) in page.runs() {
                let newest = page.entry(run.start).newest();
                if newest.is_invalid() {
                    continue;
                }
                if !newest.is_null() && newest.tag() == PtrTag::Main {
                    // Relocated; skip when the target page is in this scan's
                    // set, otherwise follow the forward.
                    if page_ids.contains(&newest.loc().container) {
                        continue;
                    }
                    if let Locate::Head(head) = self.locate(newest) {
                        emit(key, head);
                    }
                    continue;
                }
                emit(key, RecordHead::Main(Arc::clone(page), run.start));
            }
        }

        for chunk in self.insert_log.chunks() {
            for (slot, entry) in chunk.published() {
                if entry.kind() != EntryKind::Insert {
                    continue;
                }
                let link = entry.link();
                if link.is_invalid() {
                    continue;
                }
                let key = entry.key();
                if !link.is_null() && link.tag() == PtrTag::Main {
                    if page_ids.contains(&link.loc().container) {
                        continue;
                    }
                    if let Locate::Head(head) = self.locate(link) {
                        emit(key, head);
                    }
                    continue;
                }
                let loc = Loc::new(ContainerKind::Log, chunk.id(), slot);
                if let Some(e) = self.insert_log.resolve(loc) {
                    emit(key, RecordHead::Insert(e));
                }
            }
        }
    }

    /// Compact every page and fold log-resident inserts into main, then
    /// recycle dead log chunks.
    pub fn run_gc(&self, min_version: Version) -> GcStats {
        let _guard = self.gc_lock.lock();
        let update_boundary = self.update_log.tail_id().saturating_sub(1);
        let outcome = match crate::compactor::Sweeper::new(self, min_version).sweep() {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(error = %err, "compaction sweep aborted");
                return GcStats::default();
            }
        };
        let mut stats = outcome.stats;
        stats.chunks_recycled +=
            self.insert_log.truncate_while(|c| c.is_fully_retired()) as u64;
        if outcome.fully_folded {
            // Every update sealed before the sweep started has been folded
            // or discarded; chains re-published onto new locations are
            // bounded by the new main version, so they never walk into
            // these chunks.
            stats.chunks_recycled += self
                .update_log
                .truncate_while(|c| c.is_sealed() && c.id() < update_boundary)
                as u64;
        }
        stats
    }
}

impl std::fmt::Debug for DeltaMainTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaMainTable")
            .field("pages", &self.pages.read().len())
            .finish_non_exhaustive()
    }
}
