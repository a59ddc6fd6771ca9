use thiserror::Error;

/// Primary error type for verso storage operations.
///
/// Structured variants for the error kinds the engine surfaces to clients.
/// Internal CAS losses are retried inside the store and never escape as
/// errors; `WriteConflict` is raised only after a writer has re-validated a
/// genuine snapshot conflict.
#[derive(Error, Debug)]
pub enum VersoError {
    // === Table registry ===
    /// Operation referenced a table id that does not exist.
    #[error("invalid table: {id}")]
    InvalidTable { id: u64 },

    /// Lookup of a table by name failed.
    #[error("no such table: '{name}'")]
    NoSuchTable { name: String },

    // === Snapshots and scans ===
    /// The snapshot descriptor is malformed (e.g. base version above the
    /// snapshot version).
    #[error("invalid snapshot: {reason}")]
    InvalidSnapshot { reason: &'static str },

    /// The scan request could not be validated against the table.
    #[error("invalid scan: {reason}")]
    InvalidScan { reason: &'static str },

    // === Write path ===
    /// The write lost against a conflicting version of the same key.
    #[error("write conflict on key {key}")]
    WriteConflict { key: u64 },

    /// The key has no version visible to the snapshot (or does not exist).
    #[error("not found")]
    NotFound,

    /// A tuple did not match the table schema.
    #[error("malformed tuple: {reason}")]
    InvalidTuple { reason: &'static str },

    // === Resources ===
    /// The page pool budget or the hash index capacity is exhausted.
    #[error("out of memory: {resource}")]
    OutOfMemory { resource: &'static str },

    /// The engine shed the request due to overload.
    #[error("server overload")]
    ServerOverload,
}

/// Convenience alias used across the verso crates.
pub type Result<T> = std::result::Result<T, VersoError>;

impl VersoError {
    /// Whether the client may retry the operation verbatim with a fresh
    /// snapshot and reasonably expect success.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WriteConflict { .. } | Self::ServerOverload
        )
    }
}
