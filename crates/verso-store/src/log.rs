//! Chunked append-only log of version entries.
//!
//! A log is a list of fixed-budget chunks; each chunk holds typed entry
//! slots published through `OnceLock`, so an entry becomes visible to
//! readers exactly when its slot is set (a release store) and is immutable
//! afterwards except for the `reverted` flag and the atomic chain link.
//! Chunk ids are 1-based and monotonic; a packed [`Loc`] addresses an entry
//! as (chunk id, slot).
//!
//! Appends are multi-producer: a slot index is claimed with `fetch_add`,
//! the byte budget is charged, and the entry is published into the claimed
//! slot. A chunk whose slot or byte budget overflows is sealed and the
//! append moves to a fresh chunk. Claims that overflow leave a permanently
//! unpublished hole; scans skip holes.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use verso_error::Result;
use verso_types::{Key, Version};

use crate::pool::{PagePool, PageReservation, PAGE_SIZE};
use crate::tagged::{ContainerKind, Loc, TaggedPtr};

/// Entry slots per chunk.
pub const CHUNK_SLOTS: usize = 4096;

/// Byte budget per chunk (accounted, not laid out).
pub const CHUNK_BYTES: usize = PAGE_SIZE;

/// Accounted header cost of one entry: kind, key, version, link, flags,
/// rounded to alignment.
pub const ENTRY_HEADER_COST: usize = 32;

/// Accounted cost of an entry with the given payload length, 8-byte
/// aligned like the wire layout it models.
#[inline]
#[must_use]
pub const fn entry_cost(payload_len: usize) -> usize {
    (ENTRY_HEADER_COST + payload_len + 7) & !7
}

/// The variant of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    /// Birth of a record; the link is the `newest` update-chain head.
    Insert = 1,
    /// A newer payload; the link is the `previous` chain pointer.
    Update = 2,
    /// A deletion marker; the link is the `previous` chain pointer.
    Delete = 3,
}

/// One published log entry.
///
/// Immutable after publication except for `reverted` (flipped once, never
/// cleared) and `link` (CAS-mutated: the update-chain head on inserts, the
/// garbage collector's splice target on updates and deletes).
pub struct LogEntry {
    kind: EntryKind,
    key: Key,
    version: Version,
    reverted: AtomicBool,
    /// A [`TaggedPtr`] word: the update-chain head on inserts, the
    /// `previous` pointer on updates and deletes.
    link: AtomicU64,
    payload: Box<[u8]>,
}

impl LogEntry {
    fn new(kind: EntryKind, key: Key, version: Version, link: TaggedPtr, payload: Box<[u8]>) -> Self {
        Self {
            kind,
            key,
            version,
            reverted: AtomicBool::new(false),
            link: AtomicU64::new(link.raw()),
            payload,
        }
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub fn key(&self) -> Key {
        self.key
    }

    #[inline]
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.kind == EntryKind::Delete
    }

    #[inline]
    #[must_use]
    pub fn is_reverted(&self) -> bool {
        self.reverted.load(Ordering::Acquire)
    }

    /// Flip the reverted flag. Idempotent; readers skip reverted entries.
    pub fn set_reverted(&self) {
        self.reverted.store(true, Ordering::Release);
    }

    /// Current chain link (acquire).
    #[inline]
    #[must_use]
    pub fn link(&self) -> TaggedPtr {
        TaggedPtr::from_raw(self.link.load(Ordering::Acquire))
    }

    /// CAS the chain link. Returns the observed value on failure.
    pub fn cas_link(&self, expected: TaggedPtr, new: TaggedPtr) -> std::result::Result<(), TaggedPtr> {
        self.link
            .compare_exchange(expected.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(TaggedPtr::from_raw)
    }

    /// Unconditionally retarget the chain link (release). Used by the
    /// compactor's pointer-swing retry protocol and the chain splicer.
    pub fn store_link(&self, new: TaggedPtr) {
        self.link.store(new.raw(), Ordering::Release);
    }
}

impl std::fmt::Debug for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogEntry")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("version", &self.version)
            .field("reverted", &self.is_reverted())
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// One fixed-budget chunk of the log.
pub struct LogChunk {
    id: u32,
    slots: Box<[OnceLock<LogEntry>]>,
    next_slot: AtomicU32,
    bytes: AtomicUsize,
    sealed: AtomicBool,
    /// Appends claimed but not yet published or abandoned.
    pending: AtomicU32,
    /// Entries retired by garbage collection.
    retired: AtomicU32,
    _reservation: PageReservation,
}

impl LogChunk {
    fn new(id: u32, reservation: PageReservation) -> Self {
        let slots = (0..CHUNK_SLOTS)
            .map(|_| OnceLock::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            id,
            slots,
            next_slot: AtomicU32::new(0),
            bytes: AtomicUsize::new(0),
            sealed: AtomicBool::new(false),
            pending: AtomicU32::new(0),
            retired: AtomicU32::new(0),
            _reservation: reservation,
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    fn try_append(&self, entry: LogEntry) -> std::result::Result<u32, LogEntry> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let result = self.try_append_inner(entry);
        if result.is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        result
    }

    fn try_append_inner(&self, entry: LogEntry) -> std::result::Result<u32, LogEntry> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(entry);
        }
        let slot = self.next_slot.fetch_add(1, Ordering::AcqRel);
        if slot as usize >= CHUNK_SLOTS {
            self.sealed.store(true, Ordering::Release);
            return Err(entry);
        }
        let cost = entry_cost(entry.payload.len());
        let used = self.bytes.fetch_add(cost, Ordering::AcqRel) + cost;
        if used > CHUNK_BYTES {
            // The claimed slot stays an unpublished hole.
            self.sealed.store(true, Ordering::Release);
            return Err(entry);
        }
        self.slots[slot as usize]
            .set(entry)
            .unwrap_or_else(|_| unreachable!("slot claimed twice"));
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Ok(slot)
    }

    /// The entry in `slot`, if published.
    #[inline]
    #[must_use]
    pub fn get(&self, slot: u32) -> Option<&LogEntry> {
        self.slots.get(slot as usize)?.get()
    }

    /// Iterate published entries in slot order, skipping holes.
    pub fn published(&self) -> impl Iterator<Item = (u32, &LogEntry)> {
        let claimed = (self.next_slot.load(Ordering::Acquire) as usize).min(CHUNK_SLOTS);
        (0..claimed as u32).filter_map(move |slot| self.get(slot).map(|e| (slot, e)))
    }

    #[inline]
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Count one entry of this chunk as retired by GC.
    pub fn retire_one(&self) {
        self.retired.fetch_add(1, Ordering::AcqRel);
    }

    /// Whether the chunk is sealed, quiescent, and every published entry
    /// has been retired.
    #[must_use]
    pub fn is_fully_retired(&self) -> bool {
        self.is_sealed()
            && self.pending.load(Ordering::Acquire) == 0
            && self.retired.load(Ordering::Acquire) as usize >= self.published().count()
    }
}

impl std::fmt::Debug for LogChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogChunk")
            .field("id", &self.id)
            .field("claimed", &self.next_slot.load(Ordering::Relaxed))
            .field("bytes", &self.bytes.load(Ordering::Relaxed))
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

/// A resolved reference to a published log entry. Holds the chunk alive,
/// so the entry stays readable even if the log recycles the chunk.
#[derive(Clone)]
pub struct EntryRef {
    chunk: Arc<LogChunk>,
    slot: u32,
    kind: ContainerKind,
}

impl EntryRef {
    #[inline]
    #[must_use]
    pub fn entry(&self) -> &LogEntry {
        self.chunk.get(self.slot).expect("EntryRef to published entry")
    }

    #[inline]
    #[must_use]
    pub fn loc(&self) -> Loc {
        Loc::new(self.kind, self.chunk.id(), self.slot)
    }

    /// Count this entry as retired in its chunk.
    pub fn retire(&self) {
        self.chunk.retire_one();
    }
}

impl std::fmt::Debug for EntryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryRef")
            .field("loc", &self.loc())
            .field("entry", self.entry())
            .finish()
    }
}

struct ChunkList {
    /// Id of `chunks[0]`; ids below it have been recycled.
    base: u32,
    chunks: Vec<Arc<LogChunk>>,
}

/// A single-producer-per-slot, multi-consumer chunked log.
pub struct Log {
    pool: PagePool,
    kind: ContainerKind,
    inner: RwLock<ChunkList>,
    next_id: AtomicU32,
}

impl Log {
    #[must_use]
    pub fn new(pool: PagePool, kind: ContainerKind) -> Self {
        Self {
            pool,
            kind,
            inner: RwLock::new(ChunkList {
                base: 1,
                chunks: Vec::new(),
            }),
            next_id: AtomicU32::new(1),
        }
    }

    /// Append an entry, growing the log by a chunk when the tail is full.
    pub fn append(
        &self,
        kind: EntryKind,
        key: Key,
        version: Version,
        link: TaggedPtr,
        payload: Box<[u8]>,
    ) -> Result<EntryRef> {
        let mut entry = LogEntry::new(kind, key, version, link, payload);
        loop {
            let tail = self.inner.read().chunks.last().cloned();
            if let Some(chunk) = tail {
                match chunk.try_append(entry) {
                    Ok(slot) => {
                        return Ok(EntryRef {
                            chunk,
                            slot,
                            kind: self.kind,
                        })
                    }
                    Err(back) => entry = back,
                }
            }
            self.grow()?;
        }
    }

    fn grow(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(tail) = inner.chunks.last() {
            if !tail.is_sealed() {
                // Another thread already grew the log.
                return Ok(());
            }
        }
        let reservation = self.pool.reserve()?;
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        inner.chunks.push(Arc::new(LogChunk::new(id, reservation)));
        Ok(())
    }

    /// Resolve a packed location to an entry reference. `None` when the
    /// chunk was recycled or the slot is unpublished; callers restart from
    /// the hash index.
    #[must_use]
    pub fn resolve(&self, loc: Loc) -> Option<EntryRef> {
        debug_assert_eq!(loc.kind, self.kind);
        let inner = self.inner.read();
        let idx = loc.container.checked_sub(inner.base)? as usize;
        let chunk = inner.chunks.get(idx)?.clone();
        drop(inner);
        chunk.get(loc.slot)?;
        Some(EntryRef {
            chunk,
            slot: loc.slot,
            kind: self.kind,
        })
    }

    /// Stable snapshot of the current chunks, oldest first.
    #[must_use]
    pub fn chunks(&self) -> Vec<Arc<LogChunk>> {
        self.inner.read().chunks.clone()
    }

    /// Id the next appended chunk would get; chunks with smaller ids are
    /// already allocated (or recycled).
    #[must_use]
    pub fn tail_id(&self) -> u32 {
        self.next_id.load(Ordering::Acquire)
    }

    /// Drop leading chunks while `pred` holds. Returns how many were
    /// recycled.
    pub fn truncate_while(&self, pred: impl Fn(&LogChunk) -> bool) -> usize {
        let mut inner = self.inner.write();
        let mut recycled = 0;
        while let Some(first) = inner.chunks.first() {
            if !pred(first) {
                break;
            }
            inner.chunks.remove(0);
            inner.base += 1;
            recycled += 1;
        }
        recycled
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Log")
            .field("kind", &self.kind)
            .field("base", &inner.base)
            .field("chunks", &inner.chunks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_log() -> Log {
        Log::new(PagePool::new(64), ContainerKind::Log)
    }

    fn key(raw: u64) -> Key {
        Key::new(raw).unwrap()
    }

    #[test]
    fn append_publish_resolve() {
        let log = test_log();
        let entry = log
            .append(
                EntryKind::Insert,
                key(42),
                Version::new(10),
                TaggedPtr::NULL,
                b"hello".to_vec().into_boxed_slice(),
            )
            .unwrap();
        assert_eq!(entry.entry().kind(), EntryKind::Insert);
        assert_eq!(entry.entry().payload(), b"hello");

        let resolved = log.resolve(entry.loc()).unwrap();
        assert_eq!(resolved.entry().version(), Version::new(10));
    }

    #[test]
    fn entries_scan_in_append_order() {
        let log = test_log();
        for v in 1..=5u64 {
            log.append(
                EntryKind::Update,
                key(1),
                Version::new(v),
                TaggedPtr::NULL,
                Box::default(),
            )
            .unwrap();
        }
        let chunks = log.chunks();
        assert_eq!(chunks.len(), 1);
        let versions: Vec<u64> = chunks[0]
            .published()
            .map(|(_, e)| e.version().get())
            .collect();
        assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn revert_is_idempotent() {
        let log = test_log();
        let e = log
            .append(
                EntryKind::Update,
                key(1),
                Version::new(2),
                TaggedPtr::NULL,
                Box::default(),
            )
            .unwrap();
        assert!(!e.entry().is_reverted());
        e.entry().set_reverted();
        e.entry().set_reverted();
        assert!(e.entry().is_reverted());
    }

    #[test]
    fn grows_past_slot_capacity() {
        let log = test_log();
        let mut last = None;
        for v in 0..(CHUNK_SLOTS as u64 + 10) {
            last = Some(
                log.append(
                    EntryKind::Update,
                    key(1),
                    Version::new(v),
                    TaggedPtr::NULL,
                    Box::default(),
                )
                .unwrap(),
            );
        }
        assert!(log.chunks().len() >= 2);
        let last = last.unwrap();
        assert_eq!(last.loc().container, 2);
        assert!(log.resolve(last.loc()).is_some());
    }

    #[test]
    fn truncation_invalidates_resolution_but_not_refs() {
        let log = test_log();
        let mut first = None;
        for v in 0..(CHUNK_SLOTS as u64 + 1) {
            let e = log
                .append(
                    EntryKind::Update,
                    key(1),
                    Version::new(v),
                    TaggedPtr::NULL,
                    Box::default(),
                )
                .unwrap();
            if v == 0 {
                first = Some(e);
            }
        }
        let first = first.unwrap();
        let loc = first.loc();
        assert_eq!(log.truncate_while(LogChunk::is_sealed), 1);
        assert!(log.resolve(loc).is_none());
        // The held reference keeps the chunk alive.
        assert_eq!(first.entry().version(), Version::ZERO);
    }

    #[test]
    fn cas_link_reports_observed_value() {
        let log = test_log();
        let e = log
            .append(
                EntryKind::Insert,
                key(9),
                Version::new(1),
                TaggedPtr::NULL,
                Box::default(),
            )
            .unwrap();
        let target = TaggedPtr::new(
            Loc::new(ContainerKind::Log, 1, 5),
            crate::tagged::PtrTag::Update,
        );
        e.entry().cas_link(TaggedPtr::NULL, target).unwrap();
        let observed = e.entry().cas_link(TaggedPtr::NULL, target).unwrap_err();
        assert_eq!(observed, target);
    }
}
