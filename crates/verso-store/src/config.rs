//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Tunables for one [`Storage`](crate::store::Storage) instance.
///
/// The page size itself is a build-time constant
/// ([`PAGE_SIZE`](crate::pool::PAGE_SIZE)); everything here scales counts,
/// not layouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Upper bound on pages the pool will hand out, across data pages and
    /// log chunks. Exceeding it fails operations with out-of-memory.
    pub max_pages: usize,
    /// Slot count of each table's hash index, rounded up to a power of two.
    pub hash_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_pages: 1024,
            hash_capacity: 1 << 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_serializable() {
        let config = StorageConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: StorageConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
