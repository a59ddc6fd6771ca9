//! The per-table storage facade.
//!
//! `Storage` owns the page pool and the table registry and dispatches
//! operations to the table's physical layout. A table uses exactly one
//! layout, chosen at creation, so dispatch is a plain tagged match.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use verso_error::{Result, VersoError};
use verso_types::{Key, Schema, SnapshotDescriptor, TableId, Version};

use crate::config::StorageConfig;
use crate::deltamain::DeltaMainTable;
use crate::gc::GcStats;
use crate::logstructured::LogTable;
use crate::pool::PagePool;

/// Result of resolving a record under a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Found {
        version: Version,
        /// No non-reverted version newer than the winner exists.
        is_newest: bool,
        payload: Vec<u8>,
    },
    Deleted {
        version: Version,
        is_newest: bool,
    },
    Absent,
}

/// A successful point read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    pub version: Version,
    pub is_newest: bool,
    pub data: Vec<u8>,
}

/// The physical layout backing a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// Every version lives in the log; chains are spliced in place.
    LogStructured,
    /// Columnar main area plus per-record update logs, reconciled by the
    /// compactor.
    DeltaMain,
}

enum TableLayout {
    Log(LogTable),
    DeltaMain(DeltaMainTable),
}

/// One table: identity, schema, and its layout.
pub struct Table {
    id: TableId,
    name: String,
    schema: Arc<Schema>,
    layout: TableLayout,
}

impl Table {
    #[must_use]
    pub fn id(&self) -> TableId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }
}

#[derive(Default)]
struct TableRegistry {
    by_name: HashMap<String, TableId>,
    tables: Vec<Arc<Table>>,
}

/// The storage engine facade.
pub struct Storage {
    config: StorageConfig,
    pool: PagePool,
    registry: RwLock<TableRegistry>,
}

impl Storage {
    #[must_use]
    pub fn new(config: StorageConfig) -> Self {
        let pool = PagePool::new(config.max_pages);
        Self {
            config,
            pool,
            registry: RwLock::new(TableRegistry::default()),
        }
    }

    /// Create a table, or return the existing one of the same name.
    pub fn create_table(
        &self,
        name: &str,
        schema: Schema,
        kind: TableKind,
    ) -> Result<(TableId, bool)> {
        let mut registry = self.registry.write();
        if let Some(&id) = registry.by_name.get(name) {
            return Ok((id, false));
        }
        let id = TableId::new(registry.tables.len() as u64 + 1);
        let schema = Arc::new(schema);
        let layout = match kind {
            TableKind::LogStructured => {
                TableLayout::Log(LogTable::new(self.pool.clone(), self.config.hash_capacity))
            }
            TableKind::DeltaMain => TableLayout::DeltaMain(DeltaMainTable::new(
                self.pool.clone(),
                Arc::clone(&schema),
                self.config.hash_capacity,
            )),
        };
        registry.tables.push(Arc::new(Table {
            id,
            name: name.to_owned(),
            schema,
            layout,
        }));
        registry.by_name.insert(name.to_owned(), id);
        tracing::debug!(table = name, id = id.get(), ?kind, "table created");
        Ok((id, true))
    }

    /// Look a table up by name.
    pub fn get_table(&self, name: &str) -> Result<(TableId, Arc<Schema>)> {
        let registry = self.registry.read();
        let id = registry
            .by_name
            .get(name)
            .copied()
            .ok_or_else(|| VersoError::NoSuchTable {
                name: name.to_owned(),
            })?;
        let table = &registry.tables[(id.get() - 1) as usize];
        Ok((id, Arc::clone(&table.schema)))
    }

    fn table(&self, id: TableId) -> Result<Arc<Table>> {
        let registry = self.registry.read();
        let idx = id.get().checked_sub(1).ok_or(VersoError::InvalidTable { id: id.get() })?;
        registry
            .tables
            .get(idx as usize)
            .cloned()
            .ok_or(VersoError::InvalidTable { id: id.get() })
    }

    pub fn get(
        &self,
        table: TableId,
        key: Key,
        snapshot: &SnapshotDescriptor,
    ) -> Result<GetResult> {
        snapshot.validate()?;
        let table = self.table(table)?;
        let outcome = match &table.layout {
            TableLayout::Log(t) => t.get(key, snapshot),
            TableLayout::DeltaMain(t) => t.get(key, snapshot),
        };
        match outcome {
            ReadOutcome::Found {
                version,
                is_newest,
                payload,
            } => Ok(GetResult {
                version,
                is_newest,
                data: payload,
            }),
            ReadOutcome::Deleted { .. } | ReadOutcome::Absent => Err(VersoError::NotFound),
        }
    }

    pub fn insert(
        &self,
        table: TableId,
        key: Key,
        data: &[u8],
        snapshot: &SnapshotDescriptor,
    ) -> Result<()> {
        snapshot.validate()?;
        let table = self.table(table)?;
        table.schema.validate(data)?;
        match &table.layout {
            TableLayout::Log(t) => t.insert(key, data, snapshot),
            TableLayout::DeltaMain(t) => t.insert(key, data, snapshot),
        }
    }

    pub fn update(
        &self,
        table: TableId,
        key: Key,
        data: &[u8],
        snapshot: &SnapshotDescriptor,
    ) -> Result<()> {
        snapshot.validate()?;
        let table = self.table(table)?;
        table.schema.validate(data)?;
        match &table.layout {
            TableLayout::Log(t) => t.update(key, data, snapshot),
            TableLayout::DeltaMain(t) => t.update(key, data, snapshot),
        }
    }

    pub fn remove(&self, table: TableId, key: Key, snapshot: &SnapshotDescriptor) -> Result<()> {
        snapshot.validate()?;
        let table = self.table(table)?;
        match &table.layout {
            TableLayout::Log(t) => t.remove(key, snapshot),
            TableLayout::DeltaMain(t) => t.remove(key, snapshot),
        }
    }

    /// Revert the key's version written by this snapshot's transaction.
    pub fn revert(&self, table: TableId, key: Key, snapshot: &SnapshotDescriptor) -> Result<()> {
        snapshot.validate()?;
        let table = self.table(table)?;
        match &table.layout {
            TableLayout::Log(t) => t.revert(key, snapshot),
            TableLayout::DeltaMain(t) => t.revert(key, snapshot),
        }
    }

    /// Scan the table under a fixed snapshot, delivering each live key's
    /// newest visible version to `sink`. Returns the tuple count.
    pub fn scan(
        &self,
        table: TableId,
        snapshot: &SnapshotDescriptor,
        sink: &mut dyn FnMut(Key, Version, &[u8]),
    ) -> Result<u64> {
        if snapshot.validate().is_err() {
            return Err(VersoError::InvalidScan {
                reason: "malformed snapshot descriptor",
            });
        }
        let table = self.table(table)?;
        let mut count = 0u64;
        let mut counting = |key: Key, version: Version, data: &[u8]| {
            count += 1;
            sink(key, version, data);
        };
        match &table.layout {
            TableLayout::Log(t) => t.scan(snapshot, &mut counting),
            TableLayout::DeltaMain(t) => t.scan(snapshot, &mut counting),
        }
        Ok(count)
    }

    /// Run garbage collection over every table with the given floor.
    pub fn run_gc(&self, min_version: Version) -> GcStats {
        let started = Instant::now();
        let tables: Vec<Arc<Table>> = self.registry.read().tables.clone();
        let mut stats = GcStats::default();
        for table in &tables {
            let table_stats = match &table.layout {
                TableLayout::Log(t) => t.run_gc(min_version),
                TableLayout::DeltaMain(t) => t.run_gc(min_version),
            };
            stats.merge(&table_stats);
        }
        tracing::info!(
            min_version = min_version.get(),
            tables = tables.len(),
            relocated = stats.entries_relocated,
            discarded = stats.entries_discarded,
            removed = stats.records_removed,
            recycled_chunks = stats.chunks_recycled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "garbage collection finished"
        );
        stats
    }

    /// Pages currently charged against the pool budget.
    #[must_use]
    pub fn pages_in_use(&self) -> usize {
        self.pool.charged()
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("tables", &self.registry.read().tables.len())
            .field("pages_in_use", &self.pages_in_use())
            .finish()
    }
}
