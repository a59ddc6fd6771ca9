//! The cooperative page modifier.
//!
//! A sweep rewrites the main pages that need work, folds update chains and
//! log-resident inserts into fresh fill pages, discards versions per the
//! keep rule, and then atomically hands each record over:
//!
//! 1. Records are processed in global key order so fill pages keep the
//!    (key ascending, version descending) invariant. A key's survivors are
//!    staged as a unit; when the fill page would overflow, the committed
//!    part is flushed and the key restarts from a fresh observation.
//! 2. A record with no survivors has its `newest` CASed to INVALID and its
//!    key conditionally removed from the hash index.
//! 3. Relocated records get a pointer action: after the fill page is
//!    published, the old `newest` is CASed to a MAIN-tagged forward. When
//!    the CAS loses to a concurrent writer, the writer's freshly appended
//!    chain head is first published as the new entry's `newest` (so the
//!    new location sees the same chain), then the swing retries.
//! 4. Hash-index changes accumulate in a batch and apply conditionally at
//!    the end; a failed apply means a writer superseded the record and the
//!    newer state wins.
//!
//! The sweep's failures are confined to retries; if it aborts, the old
//! pages remain authoritative and already-swung records stay readable
//! through their forwards.

use std::collections::HashSet;
use std::sync::Arc;

use smallvec::SmallVec;

use verso_error::Result;
use verso_types::{Key, Version};

use crate::colmap::{ColumnMapMainPage, PageBuilder};
use crate::deltamain::{DeltaMainTable, Locate, RecordHead};
use crate::gc::{keep_plan, GcStats, KeepPlan};
use crate::log::{EntryKind, EntryRef};
use crate::tagged::{ContainerKind, Loc, PtrTag, TaggedPtr};

enum Source {
    /// One key's run in a page being rewritten.
    Run(Arc<ColumnMapMainPage>, std::ops::Range<usize>),
    /// A log-resident insert record.
    Insert(EntryRef),
}

impl Source {
    fn hash_ptr(&self) -> TaggedPtr {
        match self {
            Self::Run(page, run) => TaggedPtr::new(
                Loc::new(ContainerKind::Page, page.id(), run.start as u32),
                PtrTag::Main,
            ),
            Self::Insert(e) => TaggedPtr::new(e.loc(), PtrTag::Update),
        }
    }

    fn cas_newest(&self, expected: TaggedPtr, new: TaggedPtr) -> std::result::Result<(), TaggedPtr> {
        match self {
            Self::Run(page, run) => page.entry(run.start).cas_newest(expected, new),
            Self::Insert(e) => e.entry().cas_link(expected, new),
        }
    }
}

enum MergedSrc {
    Update(usize),
    MainEntry(usize),
    InsertBase,
}

struct PointerAction {
    source: Source,
    expected: TaggedPtr,
    fill_idx: u32,
    /// Log entries whose content was folded (or discarded); retired once
    /// the swing lands.
    retire: SmallVec<[EntryRef; 8]>,
}

struct PendingIndexOp {
    key: Key,
    old: TaggedPtr,
    fill_idx: u32,
}

enum ReadyIndexOp {
    Update {
        key: Key,
        old: TaggedPtr,
        new: TaggedPtr,
    },
    Remove {
        key: Key,
        expected: TaggedPtr,
    },
}

enum Processed {
    Done,
    /// The record's survivors alone exceed a page; the source page must
    /// stay in the table's page list.
    TooLarge,
}

/// What a sweep accomplished.
pub(crate) struct SweepOutcome {
    pub(crate) stats: GcStats,
    /// Every record reachable at sweep start was folded, invalidated, or
    /// already forwarded. Only then may pre-sweep update-log chunks be
    /// recycled; a record left in place keeps its chain alive in them.
    pub(crate) fully_folded: bool,
}

pub(crate) struct Sweeper<'a> {
    table: &'a DeltaMainTable,
    min: Version,
    builder: PageBuilder,
    new_pages: Vec<Arc<ColumnMapMainPage>>,
    kept_pages: Vec<Arc<ColumnMapMainPage>>,
    pending_actions: Vec<PointerAction>,
    pending_index: Vec<PendingIndexOp>,
    ready_index: Vec<ReadyIndexOp>,
    stats: GcStats,
    fully_folded: bool,
}

impl<'a> Sweeper<'a> {
    pub(crate) fn new(table: &'a DeltaMainTable, min: Version) -> Self {
        Self {
            table,
            min,
            builder: PageBuilder::new(Arc::clone(table.schema())),
            new_pages: Vec::new(),
            kept_pages: Vec::new(),
            pending_actions: Vec::new(),
            pending_index: Vec::new(),
            ready_index: Vec::new(),
            stats: GcStats::default(),
            fully_folded: true,
        }
    }

    pub(crate) fn sweep(mut self) -> Result<SweepOutcome> {
        let pages = self.table.pages.read().clone();
        let mut work: Vec<(Key, Source)> = Vec::new();
        let mut rewritten: Vec<Arc<ColumnMapMainPage>> = Vec::new();

        for page in &pages {
            self.stats.pages_examined += 1;
            if self.page_needs_cleaning(page) {
                self.stats.pages_rewritten += 1;
                for (key, run) in page.runs() {
                    work.push((key, Source::Run(Arc::clone(page), run)));
                }
                rewritten.push(Arc::clone(page));
            } else {
                self.kept_pages.push(Arc::clone(page));
            }
        }
        for chunk in self.table.insert_log.chunks() {
            for (slot, entry) in chunk.published() {
                debug_assert_eq!(entry.kind(), EntryKind::Insert);
                let loc = Loc::new(ContainerKind::Log, chunk.id(), slot);
                if let Some(e) = self.table.insert_log.resolve(loc) {
                    work.push((entry.key(), Source::Insert(e)));
                }
            }
        }
        work.sort_by_key(|(key, _)| key.get());

        let mut too_large: HashSet<u32> = HashSet::new();
        for (key, src) in work {
            let page_id = match &src {
                Source::Run(page, _) => Some(page.id()),
                Source::Insert(_) => None,
            };
            if let Processed::TooLarge = self.process(key, src)? {
                self.fully_folded = false;
                if let Some(id) = page_id {
                    too_large.insert(id);
                }
            }
        }
        self.flush()?;

        for op in std::mem::take(&mut self.ready_index) {
            match op {
                ReadyIndexOp::Update { key, old, new } => {
                    if !self.table.hash.update_if_equal(key, old, new) {
                        tracing::debug!(key = %key, "index update superseded by writer");
                    }
                }
                ReadyIndexOp::Remove { key, expected } => {
                    if !self.table.hash.remove_if_equal(key, expected) {
                        tracing::debug!(key = %key, "index removal superseded by writer");
                    }
                }
            }
        }

        // Publish the new page list, then retire replaced pages so stale
        // pointers dangle into a restart instead of stale data.
        let mut list = std::mem::take(&mut self.kept_pages);
        for page in &rewritten {
            if too_large.contains(&page.id()) {
                list.push(Arc::clone(page));
            }
        }
        list.extend(self.new_pages.iter().cloned());
        *self.table.pages.write() = list;
        for page in &rewritten {
            if !too_large.contains(&page.id()) {
                self.table.registry.retire(page.id());
            }
        }

        tracing::debug!(
            pages_examined = self.stats.pages_examined,
            pages_rewritten = self.stats.pages_rewritten,
            relocated = self.stats.entries_relocated,
            discarded = self.stats.entries_discarded,
            removed = self.stats.records_removed,
            fully_folded = self.fully_folded,
            "compaction sweep finished"
        );
        Ok(SweepOutcome {
            stats: self.stats,
            fully_folded: self.fully_folded,
        })
    }

    /// Whether any record on the page has pending updates, reverted
    /// entries, or purgeable versions.
    fn page_needs_cleaning(&self, page: &ColumnMapMainPage) -> bool {
        for (_, run) in page.runs() {
            if !page.entry(run.start).newest().is_null() {
                return true;
            }
            if run.clone().any(|j| page.entry(j).is_reverted()) {
                return true;
            }
            if page.is_tombstone(run.start) && page.entry(run.start).version() <= self.min {
                return true;
            }
            if run
                .clone()
                .skip(1)
                .any(|j| page.entry(j).version() < self.min)
            {
                return true;
            }
        }
        false
    }

    fn process(&mut self, key: Key, src: Source) -> Result<Processed> {
        loop {
            debug_assert!(!self.builder.has_staged());
            let observed = match &src {
                Source::Run(page, run) => page.entry(run.start).newest(),
                Source::Insert(e) => e.entry().link(),
            };
            if observed.is_invalid() {
                // Already dead; make sure the key is unhooked.
                self.ready_index.push(ReadyIndexOp::Remove {
                    key,
                    expected: src.hash_ptr(),
                });
                return Ok(Processed::Done);
            }
            if !observed.is_null() && observed.tag() == PtrTag::Main {
                // Relocated by an earlier sweep that aborted before its
                // bookkeeping finished; re-point the index and keep the
                // forward target alive in the page list.
                self.recover_forward(key, &src, observed);
                return Ok(Processed::Done);
            }

            let base_version = match &src {
                Source::Run(page, run) => page.entry(run.start).version(),
                Source::Insert(e) => e.entry().version(),
            };
            let Some(updates) = self.table.collect_updates(observed, base_version) else {
                tracing::warn!(key = %key, "update chain dangled during sweep");
                self.fully_folded = false;
                return Ok(Processed::Done);
            };

            let mut merged: SmallVec<[(Version, bool, MergedSrc); 8]> = SmallVec::new();
            for (i, u) in updates.iter().enumerate() {
                let e = u.entry();
                if !e.is_reverted() {
                    merged.push((e.version(), e.is_delete(), MergedSrc::Update(i)));
                }
            }
            let base_count = match &src {
                Source::Run(page, run) => {
                    for j in run.clone() {
                        if !page.entry(j).is_reverted() {
                            merged.push((
                                page.entry(j).version(),
                                page.is_tombstone(j),
                                MergedSrc::MainEntry(j),
                            ));
                        }
                    }
                    run.len()
                }
                Source::Insert(e) => {
                    if !e.entry().is_reverted() {
                        merged.push((e.entry().version(), false, MergedSrc::InsertBase));
                    }
                    1
                }
            };
            let versions: SmallVec<[(Version, bool); 8]> =
                merged.iter().map(|&(v, d, _)| (v, d)).collect();

            match keep_plan(&versions, self.min) {
                KeepPlan::Dead => {
                    if src.cas_newest(observed, TaggedPtr::INVALID).is_err() {
                        // A writer appended; re-observe the record.
                        continue;
                    }
                    self.ready_index.push(ReadyIndexOp::Remove {
                        key,
                        expected: src.hash_ptr(),
                    });
                    for u in &updates {
                        u.retire();
                    }
                    if let Source::Insert(e) = &src {
                        e.retire();
                    }
                    self.stats.records_removed += 1;
                    self.stats.entries_discarded += (updates.len() + base_count) as u64;
                    return Ok(Processed::Done);
                }
                KeepPlan::Keep {
                    prefix,
                    keep_one_below,
                } => {
                    let keep_count = prefix + usize::from(keep_one_below);
                    let mut staged_ok = true;
                    for &(version, _, ref msrc) in merged.iter().take(keep_count) {
                        let ok = match (msrc, &src) {
                            (MergedSrc::Update(i), _) => {
                                let e = updates[*i].entry();
                                if e.is_delete() {
                                    self.builder.stage_delete(key, version)
                                } else {
                                    self.builder.stage_tuple(key, version, e.payload())
                                }
                            }
                            (MergedSrc::MainEntry(j), Source::Run(page, _)) => {
                                if page.is_tombstone(*j) {
                                    self.builder.stage_delete(key, version)
                                } else {
                                    self.builder
                                        .stage_tuple(key, version, &page.reconstruct_tuple(*j))
                                }
                            }
                            (MergedSrc::InsertBase, Source::Insert(e)) => {
                                self.builder.stage_tuple(key, version, e.entry().payload())
                            }
                            _ => unreachable!("merged source does not match record source"),
                        };
                        if !ok {
                            staged_ok = false;
                            break;
                        }
                    }
                    if !staged_ok {
                        self.builder.rollback_key();
                        if self.builder.is_empty() {
                            tracing::warn!(
                                key = %key,
                                survivors = keep_count,
                                "record exceeds a page; left in place this sweep"
                            );
                            return Ok(Processed::TooLarge);
                        }
                        self.flush()?;
                        continue;
                    }
                    let fill_idx = self.builder.commit_key();
                    let mut retire: SmallVec<[EntryRef; 8]> =
                        updates.iter().cloned().collect();
                    if let Source::Insert(e) = &src {
                        retire.push(e.clone());
                    }
                    self.pending_index.push(PendingIndexOp {
                        key,
                        old: src.hash_ptr(),
                        fill_idx,
                    });
                    self.pending_actions.push(PointerAction {
                        source: src,
                        expected: observed,
                        fill_idx,
                        retire,
                    });
                    self.stats.entries_relocated += keep_count as u64;
                    self.stats.entries_discarded +=
                        (updates.len() + base_count - keep_count) as u64;
                    return Ok(Processed::Done);
                }
            }
        }
    }

    fn recover_forward(&mut self, key: Key, src: &Source, forward: TaggedPtr) {
        match self.table.locate(forward) {
            Locate::Head(RecordHead::Main(page, _)) => {
                if !self.kept_pages.iter().any(|p| p.id() == page.id())
                    && !self.new_pages.iter().any(|p| p.id() == page.id())
                {
                    self.kept_pages.push(page);
                }
                self.ready_index.push(ReadyIndexOp::Update {
                    key,
                    old: src.hash_ptr(),
                    new: forward,
                });
            }
            Locate::Dead => {
                self.ready_index.push(ReadyIndexOp::Remove {
                    key,
                    expected: src.hash_ptr(),
                });
            }
            _ => {
                tracing::warn!(key = %key, "unresolvable forward during sweep");
            }
        }
        // The sweep that installed the forward already retired the source
        // log entry at its flush; nothing more to count here.
    }

    /// Publish the fill page and run the pointer-swing protocol for every
    /// record staged into it.
    fn flush(&mut self) -> Result<()> {
        if self.builder.is_empty() {
            debug_assert!(self.pending_actions.is_empty());
            return Ok(());
        }
        let id = self.table.registry.reserve_id();
        let page = Arc::new(self.builder.build(self.table.pool(), id)?);
        self.table.registry.install(Arc::clone(&page));
        self.new_pages.push(Arc::clone(&page));

        for op in self.pending_index.drain(..) {
            self.ready_index.push(ReadyIndexOp::Update {
                key: op.key,
                old: op.old,
                new: TaggedPtr::new(
                    Loc::new(ContainerKind::Page, id, op.fill_idx),
                    PtrTag::Main,
                ),
            });
        }

        for action in self.pending_actions.drain(..) {
            let desired = TaggedPtr::new(
                Loc::new(ContainerKind::Page, id, action.fill_idx),
                PtrTag::Main,
            );
            let mut expected = action.expected;
            loop {
                match action.source.cas_newest(expected, desired) {
                    Ok(()) => break,
                    Err(current) => {
                        // A writer appended meanwhile: hand its chain to
                        // the new location, then retry the swing.
                        page.entry(action.fill_idx as usize).store_newest(current);
                        expected = current;
                    }
                }
            }
            for e in &action.retire {
                e.retire();
            }
        }
        Ok(())
    }
}
