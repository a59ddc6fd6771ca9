//! Snapshot descriptors and the visibility predicate.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use verso_error::{Result, VersoError};

use crate::ids::Version;

/// The visibility filter attached to every read and write.
///
/// A descriptor is an immutable tuple of the version floor below which no
/// live reader exists (`lowest_active`), the highest version known to be
/// committed with everything at or below it (`base`), the descriptor's own
/// transaction version, and a bitmap of committed versions in the open
/// interval above `base`. Bit `i` of the bitmap corresponds to version
/// `base + 1 + i`.
///
/// Visibility is a pure function of the descriptor and a version; a later
/// descriptor taken by the same reader sees at least the versions an
/// earlier overlapping one did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    lowest_active: Version,
    base: Version,
    version: Version,
    committed: SmallVec<[u64; 4]>,
}

impl SnapshotDescriptor {
    /// Build a descriptor from its raw parts. The bitmap covers versions
    /// `base + 1 ..= base + 64 * words.len()`.
    #[must_use]
    pub fn from_parts(
        lowest_active: Version,
        base: Version,
        version: Version,
        committed: impl IntoIterator<Item = u64>,
    ) -> Self {
        Self {
            lowest_active,
            base,
            version,
            committed: committed.into_iter().collect(),
        }
    }

    /// Build a descriptor at `version` that sees exactly the given committed
    /// versions (plus its own writes). Base and floor are zero, so nothing
    /// is visible implicitly. Mostly useful for tests and tooling.
    #[must_use]
    pub fn with_committed(version: Version, visible: impl IntoIterator<Item = Version>) -> Self {
        let mut committed: SmallVec<[u64; 4]> = SmallVec::new();
        for v in visible {
            let raw = v.get();
            if raw == 0 {
                continue;
            }
            let bit = raw - 1;
            let word = (bit / 64) as usize;
            if committed.len() <= word {
                committed.resize(word + 1, 0);
            }
            committed[word] |= 1 << (bit % 64);
        }
        Self {
            lowest_active: Version::ZERO,
            base: Version::ZERO,
            version,
            committed,
        }
    }

    /// The floor below which versions may be garbage collected.
    #[inline]
    #[must_use]
    pub fn lowest_active_version(&self) -> Version {
        self.lowest_active
    }

    #[inline]
    #[must_use]
    pub fn base_version(&self) -> Version {
        self.base
    }

    /// The descriptor's own transaction version; writes are stamped with it.
    #[inline]
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// The core visibility predicate.
    ///
    /// `v` is visible iff it is at or below `base`, it is the descriptor's
    /// own version, or the committed bit for `v` is set.
    #[inline]
    #[must_use]
    pub fn visible(&self, v: Version) -> bool {
        if v <= self.base {
            return true;
        }
        if v == self.version {
            return true;
        }
        let bit = v.get() - self.base.get() - 1;
        let word = (bit / 64) as usize;
        match self.committed.get(word) {
            Some(w) => (w >> (bit % 64)) & 1 == 1,
            None => false,
        }
    }

    /// Alias for [`visible`](Self::visible).
    #[inline]
    #[must_use]
    pub fn can_read(&self, v: Version) -> bool {
        self.visible(v)
    }

    /// Check internal consistency; the facade rejects descriptors that fail
    /// before any storage work happens.
    pub fn validate(&self) -> Result<()> {
        if self.base > self.version {
            return Err(VersoError::InvalidSnapshot {
                reason: "base version above snapshot version",
            });
        }
        if self.lowest_active > self.version {
            return Err(VersoError::InvalidSnapshot {
                reason: "lowest active version above snapshot version",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_versions_are_implicitly_visible() {
        let snap = SnapshotDescriptor::from_parts(
            Version::new(3),
            Version::new(10),
            Version::new(20),
            [0b1],
        );
        assert!(snap.visible(Version::new(1)));
        assert!(snap.visible(Version::new(10)));
        // Bit 0 of the bitmap is version 11.
        assert!(snap.visible(Version::new(11)));
        assert!(!snap.visible(Version::new(12)));
    }

    #[test]
    fn own_version_always_visible() {
        let snap = SnapshotDescriptor::with_committed(Version::new(20), []);
        assert!(snap.visible(Version::new(20)));
        assert!(!snap.visible(Version::new(19)));
    }

    #[test]
    fn with_committed_sets_exact_bits() {
        let snap =
            SnapshotDescriptor::with_committed(Version::new(20), [Version::new(10), Version::new(12)]);
        assert!(snap.visible(Version::new(10)));
        assert!(!snap.visible(Version::new(11)));
        assert!(snap.visible(Version::new(12)));
        assert!(!snap.visible(Version::new(13)));
        // Beyond the bitmap.
        assert!(!snap.visible(Version::new(640)));
    }

    #[test]
    fn validate_rejects_inverted_bounds() {
        let snap = SnapshotDescriptor::from_parts(
            Version::ZERO,
            Version::new(30),
            Version::new(20),
            [],
        );
        assert!(snap.validate().is_err());
    }

    #[test]
    fn serde_round_trip() {
        let snap =
            SnapshotDescriptor::with_committed(Version::new(7), [Version::new(3), Version::new(5)]);
        let json = serde_json::to_string(&snap).unwrap();
        let back: SnapshotDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(snap, back);
    }
}
