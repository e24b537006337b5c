#![forbid(unsafe_code)]
//! Disk-backed object buffer public API facade.
//!
//! Re-exports the cache, the slot allocator and the shared vocabulary types
//! so that downstream consumers depend on a single crate.

pub use dbuf_alloc::{FreeSpace, FreeSpaceMap, FreeSpaceSnapshot};
pub use dbuf_core::*;
pub use dbuf_error::{DbufError, ErrorCategory, FlushFailure, Result};
pub use dbuf_types::{ByteOffset, FreeBlock, ObjectId};
