//! Foundation types for the verso storage engine.
//!
//! Everything here is shared vocabulary between the storage core and its
//! callers: key/version newtypes, the snapshot descriptor that carries
//! visibility decisions, and the table schema with its tuple wire format.
//! Runtime machinery (logs, pages, chains) lives in `verso-store`.

pub mod ids;
pub mod schema;
pub mod snapshot;

pub use ids::{Key, TableId, Version};
pub use schema::{Field, FieldType, Schema, Value};
pub use snapshot::SnapshotDescriptor;
