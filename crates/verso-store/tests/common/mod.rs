//! Shared helpers for the engine integration tests.
#![allow(dead_code)]

use verso_store::{Storage, StorageConfig, TableKind};
use verso_types::{Field, FieldType, Key, Schema, SnapshotDescriptor, TableId, Value, Version};

pub fn schema() -> Schema {
    Schema::new(vec![
        Field::new("number", FieldType::Bigint),
        Field::new("text", FieldType::Text),
    ])
    .unwrap()
}

pub fn tuple(n: i64, s: &str) -> Vec<u8> {
    schema()
        .serialize(&[Value::Bigint(n), Value::Text(s.into())])
        .unwrap()
}

pub fn key(raw: u64) -> Key {
    Key::new(raw).unwrap()
}

pub fn v(raw: u64) -> Version {
    Version::new(raw)
}

/// A snapshot at `version` that sees exactly the listed versions (plus its
/// own writes).
pub fn snap(version: u64, visible: &[u64]) -> SnapshotDescriptor {
    SnapshotDescriptor::with_committed(v(version), visible.iter().copied().map(v))
}

/// A snapshot at `version` that sees everything at or below it.
pub fn snap_all(version: u64) -> SnapshotDescriptor {
    SnapshotDescriptor::from_parts(Version::ZERO, v(version), v(version), [])
}

pub fn fresh_table(kind: TableKind) -> (Storage, TableId) {
    let storage = Storage::new(StorageConfig::default());
    let (id, created) = storage.create_table("records", schema(), kind).unwrap();
    assert!(created);
    (storage, id)
}

pub const BOTH_KINDS: [TableKind; 2] = [TableKind::LogStructured, TableKind::DeltaMain];
