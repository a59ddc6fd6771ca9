//! Tagged pointer words.
//!
//! Every chain pointer in the engine is a single 64-bit word: a packed
//! location plus a 2-bit tag discriminating what the location means.
//! Containers (log chunks, main pages) are identified by 1-based ids, so a
//! word with any real location is never zero and `0` can serve as null.
//!
//! Bit layout, low to high: tag (2), slot (20), container (32),
//! container kind (2).

pub const TAG_BITS: u32 = 2;
pub const SLOT_BITS: u32 = 20;
pub const CONTAINER_BITS: u32 = 32;

const TAG_MASK: u64 = (1 << TAG_BITS) - 1;
const SLOT_MASK: u64 = (1 << SLOT_BITS) - 1;
const CONTAINER_MASK: u64 = (1 << CONTAINER_BITS) - 1;

/// Maximum slot index a container may use.
pub const MAX_SLOT: u32 = (1 << SLOT_BITS) - 1;

/// What a non-null, non-invalid pointer word points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PtrTag {
    /// A log entry: the head (or a member) of an update chain.
    Update = 0,
    /// A main page entry: a relocation left behind by compaction.
    Main = 1,
    /// No location: the record was logically deleted by compaction.
    Invalid = 2,
}

/// Which container family a location's id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContainerKind {
    /// The (insert) log of a table.
    Log = 0,
    /// The update log of a delta-main table.
    UpdateLog = 1,
    /// A column-map main page.
    Page = 2,
}

impl ContainerKind {
    #[inline]
    fn from_bits(bits: u64) -> Self {
        match bits {
            0 => Self::Log,
            1 => Self::UpdateLog,
            2 => Self::Page,
            _ => unreachable!("unused container kind bits"),
        }
    }
}

/// A packed location: container family, 1-based container id, slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loc {
    pub kind: ContainerKind,
    pub container: u32,
    pub slot: u32,
}

impl Loc {
    #[inline]
    #[must_use]
    pub const fn new(kind: ContainerKind, container: u32, slot: u32) -> Self {
        debug_assert!(container != 0, "container ids are 1-based");
        debug_assert!(slot <= MAX_SLOT);
        Self {
            kind,
            container,
            slot,
        }
    }
}

/// A tagged pointer word. `0` is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct TaggedPtr(u64);

impl TaggedPtr {
    pub const NULL: Self = Self(0);
    /// The "logically deleted" marker: tag [`PtrTag::Invalid`], no location.
    pub const INVALID: Self = Self(PtrTag::Invalid as u64);

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Point at `loc` with the given tag.
    #[inline]
    #[must_use]
    pub fn new(loc: Loc, tag: PtrTag) -> Self {
        let word = ((loc.kind as u64) << (TAG_BITS + SLOT_BITS + CONTAINER_BITS))
            | ((loc.container as u64) << (TAG_BITS + SLOT_BITS))
            | ((loc.slot as u64) << TAG_BITS)
            | tag as u64;
        Self(word)
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub fn is_invalid(self) -> bool {
        !self.is_null() && self.tag() == PtrTag::Invalid
    }

    #[inline]
    #[must_use]
    pub fn tag(self) -> PtrTag {
        debug_assert!(!self.is_null(), "tag of null pointer");
        match self.0 & TAG_MASK {
            0 => PtrTag::Update,
            1 => PtrTag::Main,
            2 => PtrTag::Invalid,
            _ => unreachable!("unused tag bits"),
        }
    }

    /// The packed location. Meaningless for null and invalid words.
    #[inline]
    #[must_use]
    pub fn loc(self) -> Loc {
        debug_assert!(!self.is_null() && !self.is_invalid());
        Loc {
            kind: ContainerKind::from_bits(self.0 >> (TAG_BITS + SLOT_BITS + CONTAINER_BITS)),
            container: ((self.0 >> (TAG_BITS + SLOT_BITS)) & CONTAINER_MASK) as u32,
            slot: ((self.0 >> TAG_BITS) & SLOT_MASK) as u32,
        }
    }

}
