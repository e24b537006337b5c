#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of a managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

/// Byte offset in the backing file.
///
/// This is a unit-carrying wrapper to prevent mixing offsets and lengths.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

/// A contiguous unused byte range in the backing file.
///
/// Invariant (maintained by the allocator, not by this type): no two free
/// blocks tracked at the same time overlap or touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FreeBlock {
    pub offset: ByteOffset,
    pub length: u64,
}

impl FreeBlock {
    #[must_use]
    pub fn new(offset: ByteOffset, length: u64) -> Self {
        Self { offset, length }
    }

    /// One past the last byte of the block, saturating at `u64::MAX`.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset.0.saturating_add(self.length)
    }

    /// Whether `self` ends exactly where `other` starts.
    #[must_use]
    pub fn abuts(&self, other: &Self) -> bool {
        self.end() == other.offset.0
    }

    /// Whether the two ranges share at least one byte.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.offset.0 < other.end() && other.offset.0 < self.end()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FreeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.offset.0, self.end())
    }
}
