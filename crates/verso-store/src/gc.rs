//! Garbage-collection policy shared by both layouts.
//!
//! The keep rule decides, per key, which versions of a chain survive a
//! sweep with floor `V` (the lowest active version):
//!
//! - A record whose newest non-reverted version is a DELETE at or below
//!   `V` is dead; the tombstone is discarded together with everything it
//!   shadows and the key leaves the hash index.
//! - Every version at or above `V` survives.
//! - Of the versions below `V`, the greatest survives only when it is the
//!   record's sole state, or when the next newer survivor is a DELETE (so
//!   readers that do not see the delete still resolve a payload). All
//!   others are shadowed and discarded.

use verso_types::Version;

/// Outcome of the keep rule for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepPlan {
    /// Discard every version and remove the key.
    Dead,
    /// Keep the newest `prefix` versions, plus the next older one when
    /// `keep_one_below` is set.
    Keep {
        prefix: usize,
        keep_one_below: bool,
    },
}

impl KeepPlan {
    /// Total surviving versions.
    #[must_use]
    pub fn survivors(&self) -> usize {
        match *self {
            Self::Dead => 0,
            Self::Keep {
                prefix,
                keep_one_below,
            } => prefix + usize::from(keep_one_below),
        }
    }
}

/// Apply the keep rule to the non-reverted versions of one key, newest
/// first, strictly decreasing. `is_delete` marks tombstones.
#[must_use]
pub fn keep_plan(versions: &[(Version, bool)], floor: Version) -> KeepPlan {
    debug_assert!(versions.windows(2).all(|w| w[0].0 > w[1].0));
    let Some(&(newest, newest_is_delete)) = versions.first() else {
        return KeepPlan::Dead;
    };
    if newest_is_delete && newest <= floor {
        return KeepPlan::Dead;
    }
    let prefix = versions.iter().take_while(|&&(v, _)| v >= floor).count();
    if prefix == versions.len() {
        return KeepPlan::Keep {
            prefix,
            keep_one_below: false,
        };
    }
    if prefix == 0 {
        // Sole surviving state: the greatest sub-floor version (a data
        // entry; a dead tombstone was handled above).
        return KeepPlan::Keep {
            prefix: 0,
            keep_one_below: true,
        };
    }
    KeepPlan::Keep {
        prefix,
        keep_one_below: versions[prefix - 1].1,
    }
}

/// Summary of one garbage-collection sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Main pages inspected.
    pub pages_examined: u64,
    /// Main pages rewritten into fresh fill pages.
    pub pages_rewritten: u64,
    /// Versions copied forward (into fill pages or surviving chains).
    pub entries_relocated: u64,
    /// Versions discarded as shadowed, reverted, or dead.
    pub entries_discarded: u64,
    /// Keys removed from the hash index.
    pub records_removed: u64,
    /// Log chunks returned to the pool.
    pub chunks_recycled: u64,
}

impl GcStats {
    pub fn merge(&mut self, other: &GcStats) {
        self.pages_examined += other.pages_examined;
        self.pages_rewritten += other.pages_rewritten;
        self.entries_relocated += other.entries_relocated;
        self.entries_discarded += other.entries_discarded;
        self.records_removed += other.records_removed;
        self.chunks_recycled += other.chunks_recycled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(raw: u64) -> Version {
        Version::new(raw)
    }

    #[test]
    fn keeps_everything_above_floor() {
        let plan = keep_plan(&[(v(20), false), (v(18), false)], v(15));
        assert_eq!(
            plan,
            KeepPlan::Keep {
                prefix: 2,
                keep_one_below: false
            }
        );
    }

    #[test]
    fn shadowed_sub_floor_data_is_discarded() {
        // insert v10, update v20, floor 15: v10 is below the floor and
        // shadowed by newer data.
        let plan = keep_plan(&[(v(20), false), (v(10), false)], v(15));
        assert_eq!(
            plan,
            KeepPlan::Keep {
                prefix: 1,
                keep_one_below: false
            }
        );
        assert_eq!(plan.survivors(), 1);
    }

    #[test]
    fn sole_sub_floor_data_survives() {
        let plan = keep_plan(&[(v(10), false)], v(15));
        assert_eq!(
            plan,
            KeepPlan::Keep {
                prefix: 0,
                keep_one_below: true
            }
        );
    }

    #[test]
    fn delete_keeps_its_read_through_version() {
        // delete v20 over data v10: readers that do not see the delete
        // still need v10.
        let plan = keep_plan(&[(v(20), true), (v(10), false)], v(15));
        assert_eq!(
            plan,
            KeepPlan::Keep {
                prefix: 1,
                keep_one_below: true
            }
        );
    }

    #[test]
    fn old_tombstone_kills_the_record() {
        assert_eq!(keep_plan(&[(v(12), true), (v(10), false)], v(15)), KeepPlan::Dead);
        assert_eq!(keep_plan(&[(v(15), true)], v(15)), KeepPlan::Dead);
        assert_eq!(keep_plan(&[], v(15)), KeepPlan::Dead);
    }

    #[test]
    fn mid_chain_delete_above_floor_is_kept() {
        let plan = keep_plan(
            &[(v(30), false), (v(20), true), (v(10), false), (v(8), false)],
            v(15),
        );
        assert_eq!(
            plan,
            KeepPlan::Keep {
                prefix: 2,
                keep_one_below: true
            }
        );
        assert_eq!(plan.survivors(), 3);
    }

    #[test]
    fn stats_merge() {
        let mut a = GcStats {
            pages_examined: 1,
            entries_discarded: 2,
            ..GcStats::default()
        };
        a.merge(&GcStats {
            pages_examined: 3,
            records_removed: 1,
            ..GcStats::default()
        });
        assert_eq!(a.pages_examined, 4);
        assert_eq!(a.entries_discarded, 2);
        assert_eq!(a.records_removed, 1);
    }
}
