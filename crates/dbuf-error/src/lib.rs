#![forbid(unsafe_code)]
//! Error types for the disk buffer.
//!
//! # Error Taxonomy
//!
//! The disk buffer distinguishes four classes of failure. A busy object is
//! *not* one of them: eviction and flush simply skip it and retry later.
//!
//! | Category | Variants | Raised by |
//! |----------|----------|-----------|
//! | I/O | `Io`, `Save`, `FlushFailed` | `ManagedObject::save` / `load` / `flush_data`, surfaced through `touch`, `flush_cache`, `teardown_flush` |
//! | Misuse | `ZeroSizedSlot`, `DoubleRelease`, `ReleaseBeyondEnd`, `OffsetOverflow` | free-space allocator entry points |
//! | Config | `InvalidConfig` | `CacheConfig::validate`, `CacheConfig::from_json_str` |
//! | Corruption | `CorruptFreeSpace` | restoring a persisted free-space vector |
//!
//! ## Flush failure policy
//!
//! A write-back flush never stops at the first failing object. Every
//! non-busy pending object gets its `save()` attempt; the ones that fail stay
//! pending and are reported together in [`DbufError::FlushFailed`].
//!
//! ## Design Constraints
//!
//! - `dbuf-error` MUST NOT depend on any other `dbuf-*` crate.
//! - All payloads are owned so errors can move between caller threads.

use thiserror::Error;

/// One object that could not be persisted during a write-back flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushFailure {
    /// Raw id of the object whose `save()` failed.
    pub id: u64,
    /// Rendered error returned by `save()`.
    pub detail: String,
}

/// Unified error type for all disk-buffer operations.
#[derive(Debug, Error)]
pub enum DbufError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A managed object failed to persist itself.
    #[error("failed to save object {id}: {detail}")]
    Save { id: u64, detail: String },

    /// One or more pending objects failed to save during a flush.
    ///
    /// The failed objects remain pending; everything else in the batch was
    /// persisted.
    #[error("write-back flush failed for {} object(s)", failures.len())]
    FlushFailed { failures: Vec<FlushFailure> },

    /// `acquire`/`relocate` was asked for an empty slot.
    #[error("cannot allocate a zero-sized slot")]
    ZeroSizedSlot,

    /// A released range overlaps a range that is already free.
    #[error("range at offset {offset} (length {length}) is already free")]
    DoubleRelease { offset: u64, length: u64 },

    /// A released range ends past the current file length.
    #[error("range at offset {offset} (length {length}) ends past file length {file_length}")]
    ReleaseBeyondEnd {
        offset: u64,
        length: u64,
        file_length: u64,
    },

    /// Growing the file would overflow the 64-bit offset space.
    #[error("file offset overflow")]
    OffsetOverflow,

    /// Invalid cache configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A persisted free-space vector could not be restored.
    #[error("corrupt free-space map: {0}")]
    CorruptFreeSpace(String),
}

/// Coarse classification of a [`DbufError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Io,
    Misuse,
    Config,
    Corruption,
}

impl DbufError {
    /// Classify this error.
    ///
    /// The mapping is exhaustive so adding a variant forces a decision here.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Io(_) | Self::Save { .. } | Self::FlushFailed { .. } => ErrorCategory::Io,
            Self::ZeroSizedSlot
            | Self::DoubleRelease { .. }
            | Self::ReleaseBeyondEnd { .. }
            | Self::OffsetOverflow => ErrorCategory::Misuse,
            Self::InvalidConfig(_) => ErrorCategory::Config,
            Self::CorruptFreeSpace(_) => ErrorCategory::Corruption,
        }
    }

    /// Ids of the objects left pending by a failed flush; empty otherwise.
    #[must_use]
    pub fn failed_ids(&self) -> Vec<u64> {
        match self {
            Self::FlushFailed { failures } => failures.iter().map(|f| f.id).collect(),
            _ => Vec::new(),
        }
    }
}

/// Result alias using `DbufError`.
pub type Result<T> = std::result::Result<T, DbufError>;
