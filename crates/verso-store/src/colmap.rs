//! Column-map main pages.
//!
//! A main page stores a contiguous run of `(key, version)` entries sorted
//! by (key ascending, version descending), a parallel size column where
//! `0` marks a deletion tombstone, a columnar fixed-field area (one
//! contiguous column per fixed-size field), per-variable-field heap-entry
//! columns of `(offset, 4-byte prefix)` records, and a variable-size heap
//! growing downward from the page end with offsets measured from the end.
//!
//! Pages are constructed only by the compactor through [`PageBuilder`] and
//! are immutable after publication except for each entry's `newest` atomic
//! tagged pointer and its reverted flag.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use verso_error::Result;
use verso_types::{schema::align_up, Key, Schema, Version};

use crate::pool::{PageBuf, PagePool, PAGE_SIZE};
use crate::tagged::TaggedPtr;

/// Bytes of a page usable for record data; the rest covers the page
/// header bookkeeping.
pub const MAX_DATA_SIZE: usize = PAGE_SIZE - 128;

/// Accounted overhead of one entry beyond its tuple bytes: the entry
/// header, the size column, and one heap-entry record per variable field.
#[inline]
#[must_use]
pub const fn entry_overhead(var_field_count: usize) -> usize {
    36 + 8 * var_field_count
}

/// One fixed-width column entry: key, version, and the mutable record
/// state shared with writers.
pub struct MainEntry {
    key: Key,
    version: Version,
    /// Tagged pointer: the update-chain head, a MAIN forward to the
    /// relocated entry, or INVALID when the run is logically deleted.
    newest: AtomicU64,
    reverted: AtomicBool,
}

impl MainEntry {
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
    pub fn newest(&self) -> TaggedPtr {
        TaggedPtr::from_raw(self.newest.load(Ordering::Acquire))
    }

    pub fn cas_newest(&self, expected: TaggedPtr, new: TaggedPtr) -> std::result::Result<(), TaggedPtr> {
        self.newest
            .compare_exchange(expected.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(TaggedPtr::from_raw)
    }

    /// Unconditional publish, used by the compactor's pointer-swing retry
    /// protocol to hand a racing writer's chain to the new location.
    pub fn store_newest(&self, new: TaggedPtr) {
        self.newest.store(new.raw(), Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub fn is_reverted(&self) -> bool {
        self.reverted.load(Ordering::Acquire)
    }

    pub fn set_reverted(&self) {
        self.reverted.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for MainEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainEntry")
            .field("key", &self.key)
            .field("version", &self.version)
            .field("newest", &self.newest.load(Ordering::Relaxed))
            .field("reverted", &self.is_reverted())
            .finish()
    }
}

/// Heap-entry record: offset from the page end to the field's length
/// prefix, plus the first bytes of the value for cheap prefix filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapEntry {
    pub offset: u32,
    pub prefix: [u8; 4],
}

/// A published column-map main page.
pub struct ColumnMapMainPage {
    id: u32,
    schema: Arc<Schema>,
    entries: Box<[MainEntry]>,
    sizes: Box<[u32]>,
    /// `var_field_count * count` records, field-major: field `f` of entry
    /// `i` lives at `f * count + i`.
    heap_entries: Box<[HeapEntry]>,
    /// Fixed columns at the front, variable heap at the tail.
    data: PageBuf,
}

impl ColumnMapMainPage {
    /// Registry id, 1-based.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn entry(&self, i: usize) -> &MainEntry {
        &self.entries[i]
    }

    /// Serialized tuple length of entry `i`; `0` marks a tombstone.
    #[inline]
    #[must_use]
    pub fn size(&self, i: usize) -> u32 {
        self.sizes[i]
    }

    #[inline]
    #[must_use]
    pub fn is_tombstone(&self, i: usize) -> bool {
        self.sizes[i] == 0
    }

    /// End (exclusive) of the run starting at `start`.
    #[must_use]
    pub fn run_end(&self, start: usize) -> usize {
        let key = self.entries[start].key();
        let mut end = start + 1;
        while end < self.entries.len() && self.entries[end].key() == key {
            end += 1;
        }
        end
    }

    /// Locate the run for `key` by binary search.
    #[must_use]
    pub fn find_run(&self, key: Key) -> Option<std::ops::Range<usize>> {
        let start = self.entries.partition_point(|e| e.key() < key);
        if start >= self.entries.len() || self.entries[start].key() != key {
            return None;
        }
        Some(start..self.run_end(start))
    }

    /// Iterate runs as `(key, start..end)`.
    pub fn runs(&self) -> impl Iterator<Item = (Key, std::ops::Range<usize>)> + '_ {
        let mut start = 0;
        std::iter::from_fn(move || {
            if start >= self.entries.len() {
                return None;
            }
            let key = self.entries[start].key();
            let end = self.run_end(start);
            let range = start..end;
            start = end;
            Some((key, range))
        })
    }

    /// Rebuild the serialized tuple of entry `i` from the columns.
    ///
    /// # Panics
    ///
    /// Panics if `i` is a tombstone.
    #[must_use]
    pub fn reconstruct_tuple(&self, i: usize) -> Vec<u8> {
        assert!(!self.is_tombstone(i), "reconstructing a tombstone");
        let count = self.count();
        let data = self.data.as_slice();
        let mut out = Vec::with_capacity(self.sizes[i] as usize);
        let mut column_base = 0usize;
        for len in self.schema.fixed_field_lens() {
            let at = column_base + i * len;
            out.extend_from_slice(&data[at..at + len]);
            column_base += count * len;
        }
        out.resize(align_up(out.len(), 4), 0);
        for f in 0..self.schema.var_field_count() {
            let he = self.heap_entries[f * count + i];
            let pos = PAGE_SIZE - he.offset as usize;
            let len = u32::from_le_bytes(data[pos..pos + 4].try_into().expect("4-byte slice"))
                as usize;
            out.extend_from_slice(&data[pos..pos + 4 + len]);
            out.resize(align_up(out.len(), 4), 0);
        }
        out.resize(align_up(out.len(), 8), 0);
        out
    }

    /// The heap-entry record of field `f` for entry `i`.
    #[must_use]
    pub fn heap_entry(&self, f: usize, i: usize) -> HeapEntry {
        self.heap_entries[f * self.count() + i]
    }
}

impl std::fmt::Debug for ColumnMapMainPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnMapMainPage")
            .field("id", &self.id)
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}

struct StagedEntry {
    key: Key,
    version: Version,
    /// Serialized tuple length; `0` for tombstones.
    size: u32,
    fixed: Vec<u8>,
    var: Vec<u8>,
}

/// Staging area for one fill page.
///
/// Entries for the key currently being processed are staged and either
/// committed as a unit or rolled back when the page overflows, so a key's
/// run is never split across pages. Keys must be committed in ascending
/// order; versions within a key in descending order.
pub struct PageBuilder {
    schema: Arc<Schema>,
    staged: Vec<StagedEntry>,
    committed: usize,
    fill_size: usize,
    committed_fill_size: usize,
}

impl PageBuilder {
    #[must_use]
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            staged: Vec::new(),
            committed: 0,
            fill_size: 0,
            committed_fill_size: 0,
        }
    }

    #[inline]
    fn overhead(&self) -> usize {
        entry_overhead(self.schema.var_field_count())
    }

    /// Stage a data version. Returns `false` when the page would overflow;
    /// the caller flushes committed entries and restarts the key.
    #[must_use]
    pub fn stage_tuple(&mut self, key: Key, version: Version, data: &[u8]) -> bool {
        let fixed = self.schema.fixed_region(data).to_vec();
        let var = self.schema.var_region(data).to_vec();
        let cost = self.overhead() + fixed.len() + var.len();
        if self.fill_size + cost > MAX_DATA_SIZE {
            return false;
        }
        self.fill_size += cost;
        self.staged.push(StagedEntry {
            key,
            version,
            size: data.len() as u32,
            fixed,
            var,
        });
        true
    }

    /// Stage a deletion tombstone.
    #[must_use]
    pub fn stage_delete(&mut self, key: Key, version: Version) -> bool {
        let cost = self.overhead() + self.schema.fixed_len();
        if self.fill_size + cost > MAX_DATA_SIZE {
            return false;
        }
        self.fill_size += cost;
        self.staged.push(StagedEntry {
            key,
            version,
            size: 0,
            fixed: vec![0; self.schema.fixed_len()],
            var: Vec::new(),
        });
        true
    }

    /// Whether the current key staged anything.
    #[must_use]
    pub fn has_staged(&self) -> bool {
        self.staged.len() > self.committed
    }

    /// Commit the staged entries of the current key; returns the index of
    /// the run's first entry in the page under construction.
    pub fn commit_key(&mut self) -> u32 {
        debug_assert!(self.has_staged());
        let first = self.committed as u32;
        debug_assert!(self.staged[self.committed..]
            .windows(2)
            .all(|w| w[0].key == w[1].key && w[0].version > w[1].version));
        if self.committed > 0 {
            debug_assert!(self.staged[self.committed - 1].key < self.staged[self.committed].key);
        }
        self.committed = self.staged.len();
        self.committed_fill_size = self.fill_size;
        first
    }

    /// Drop the staged entries of the current key.
    pub fn rollback_key(&mut self) {
        self.staged.truncate(self.committed);
        self.fill_size = self.committed_fill_size;
    }

    #[must_use]
    pub fn committed_len(&self) -> usize {
        self.committed
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.committed == 0
    }

    /// Materialize the committed entries into a page. Staged-but-uncommitted
    /// entries are discarded. The builder is reset for the next fill page.
    pub fn build(&mut self, pool: &PagePool, id: u32) -> Result<ColumnMapMainPage> {
        debug_assert!(self.committed > 0, "building an empty page");
        self.staged.truncate(self.committed);
        let count = self.staged.len();
        let var_fields = self.schema.var_field_count();

        let mut data = pool.alloc()?;
        let buf = data.as_mut_slice();

        // Fixed columns, field-major.
        let mut column_base = 0usize;
        for (field_offset, len) in self.schema.fixed_field_layout() {
            for (i, e) in self.staged.iter().enumerate() {
                let src = &e.fixed[field_offset..field_offset + len];
                buf[column_base + i * len..column_base + (i + 1) * len].copy_from_slice(src);
            }
            column_base += count * len;
        }

        // Variable heap, growing downward; entry 0 sits nearest the end.
        let mut heap_entries = vec![
            HeapEntry {
                offset: 0,
                prefix: [0; 4]
            };
            var_fields * count
        ]
        .into_boxed_slice();
        let mut heap_cursor = PAGE_SIZE;
        for (i, e) in self.staged.iter().enumerate() {
            if e.size == 0 {
                // Tombstones carry no heap data but their offsets must
                // still be monotone.
                let offset = (PAGE_SIZE - heap_cursor) as u32;
                for f in 0..var_fields {
                    heap_entries[f * count + i] = HeapEntry {
                        offset,
                        prefix: [0; 4],
                    };
                }
                continue;
            }
            heap_cursor -= e.var.len();
            buf[heap_cursor..heap_cursor + e.var.len()].copy_from_slice(&e.var);
            let mut field_pos = 0usize;
            for f in 0..var_fields {
                let len = u32::from_le_bytes(
                    e.var[field_pos..field_pos + 4].try_into().expect("4-byte slice"),
                ) as usize;
                let value = &e.var[field_pos + 4..field_pos + 4 + len];
                let mut prefix = [0u8; 4];
                prefix[..len.min(4)].copy_from_slice(&value[..len.min(4)]);
                heap_entries[f * count + i] = HeapEntry {
                    offset: (PAGE_SIZE - (heap_cursor + field_pos)) as u32,
                    prefix,
                };
                field_pos += 4 + align_up(len, 4);
            }
        }

        let entries = self
            .staged
            .iter()
            .map(|e| MainEntry {
                key: e.key,
                version: e.version,
                newest: AtomicU64::new(TaggedPtr::NULL.raw()),
                reverted: AtomicBool::new(false),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let sizes = self
            .staged
            .iter()
            .map(|e| e.size)
            .collect::<Vec<_>>()
            .into_boxed_slice();

        self.staged.clear();
        self.committed = 0;
        self.fill_size = 0;
        self.committed_fill_size = 0;

        Ok(ColumnMapMainPage {
            id,
            schema: Arc::clone(&self.schema),
            entries,
            sizes,
            heap_entries,
            data,
        })
    }
}
