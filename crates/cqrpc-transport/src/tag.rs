//! Completion tags.
//!
//! A tag is one `u64` handed to the transport with every batch and handed
//! back with its completion:
//!
//! ```text
//!   63            36 35          4 3     0
//!   ┌──────────────┬─────────────┬───────┐
//!   │  generation  │    slot     │ flags │
//!   └──────────────┴─────────────┴───────┘
//!    └──────── HandlerId ────────┘
//! ```
//!
//! The slot indexes the engine's handler table; the generation rejects
//! completions aimed at a slot that has since been reused.

use std::fmt;
use std::ops::BitOr;

/// Identity of a live completion handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct HandlerId(u64);

impl HandlerId {
    pub const SLOT_BITS: u32 = 32;
    pub const GENERATION_BITS: u32 = 28;
    pub const GENERATION_MASK: u32 = (1 << Self::GENERATION_BITS) - 1;

    #[inline]
    pub fn new(slot: u32, generation: u32) -> Self {
        let gen = (generation & Self::GENERATION_MASK) as u64;
        Self((gen << Self::SLOT_BITS) | slot as u64)
    }

    #[inline]
    pub fn slot(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> Self::SLOT_BITS) as u32
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.slot(), self.generation())
    }
}

/// Up to four flag bits distinguishing concurrently outstanding batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct TagFlags(u8);

impl TagFlags {
    pub const BITS: u32 = 4;
    pub const MASK: u8 = (1 << Self::BITS) - 1;
    pub const NONE: Self = Self(0);

    /// Flag with only bit `n` set. `n` must be below [`Self::BITS`].
    #[inline]
    pub const fn bit(n: u32) -> Self {
        assert!(n < Self::BITS, "tag flag bit out of range");
        Self(1 << n)
    }

    #[inline]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::MASK == 0 {
            Some(Self(bits))
        } else {
            None
        }
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for TagFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Opaque correlation token carried through the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CompletionTag(u64);

impl CompletionTag {
    #[inline]
    pub fn new(handler: HandlerId, flags: TagFlags) -> Self {
        Self((handler.0 << TagFlags::BITS) | flags.0 as u64)
    }

    #[inline]
    pub fn handler(self) -> HandlerId {
        HandlerId(self.0 >> TagFlags::BITS)
    }

    #[inline]
    pub fn flags(self) -> TagFlags {
        TagFlags(self.0 as u8 & TagFlags::MASK)
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}
