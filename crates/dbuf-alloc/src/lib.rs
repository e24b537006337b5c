#![forbid(unsafe_code)]
//! Free-space allocation over a single backing file.
//!
//! Tracks unused byte ranges ("free blocks") and hands out slots for objects
//! that need a place on disk.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **FreeSpaceMap** — plain bookkeeping: two ordered indexes over the same
//!    set of free blocks (by offset for coalescing, by `(length, offset)` for
//!    best-fit lookup) plus the file-length high-water mark.
//! 2. **FreeSpace** — the map behind its own lock, shared by the cache and by
//!    managed objects that relocate themselves while saving.
//!
//! Every release coalesces with its neighbours, so no two free blocks are ever
//! adjacent or overlapping. Acquisition is best-fit: the smallest block that
//! is large enough wins, ties broken by lowest offset. When nothing fits the
//! file grows at its end.

use dbuf_error::{DbufError, Result};
use dbuf_types::{ByteOffset, FreeBlock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

// ── Snapshot ────────────────────────────────────────────────────────────────

/// Point-in-time copy of the free-space map, for diagnostics and export.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FreeSpaceSnapshot {
    pub file_length: u64,
    /// Free blocks in ascending offset order.
    pub blocks: Vec<FreeBlock>,
}

impl FreeSpaceSnapshot {
    /// Total number of free bytes.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.length).sum()
    }
}

// ── Free-space map ──────────────────────────────────────────────────────────

/// Unlocked free-space bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct FreeSpaceMap {
    /// offset -> length
    by_offset: BTreeMap<u64, u64>,
    /// (length, offset), ascending: first entry >= (size, 0) is the best fit.
    by_length: BTreeSet<(u64, u64)>,
    file_length: u64,
}

impl FreeSpaceMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing file whose contents are fully allocated.
    #[must_use]
    pub fn with_file_length(file_length: u64) -> Self {
        Self {
            file_length,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn file_length(&self) -> u64 {
        self.file_length
    }

    /// Raise the high-water mark to `len`. The mark never moves down.
    pub fn set_file_length(&mut self, len: u64) -> u64 {
        self.file_length = self.file_length.max(len);
        self.file_length
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.by_offset.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_offset.is_empty()
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.by_offset.values().sum()
    }

    /// Free blocks in ascending offset order.
    #[must_use]
    pub fn blocks(&self) -> Vec<FreeBlock> {
        self.by_offset
            .iter()
            .map(|(&off, &len)| FreeBlock::new(ByteOffset(off), len))
            .collect()
    }

    #[must_use]
    pub fn snapshot(&self) -> FreeSpaceSnapshot {
        FreeSpaceSnapshot {
            file_length: self.file_length,
            blocks: self.blocks(),
        }
    }

    fn insert_block(&mut self, offset: u64, length: u64) {
        self.by_offset.insert(offset, length);
        self.by_length.insert((length, offset));
    }

    fn remove_block(&mut self, offset: u64, length: u64) {
        self.by_offset.remove(&offset);
        self.by_length.remove(&(length, offset));
    }

    /// Return `[offset, offset + length)` to the pool, merging with the block
    /// immediately before and/or after it.
    ///
    /// Releasing an empty range is a no-op. A range that overlaps space that is
    /// already free is rejected with [`DbufError::DoubleRelease`] and leaves the
    /// map untouched.
    pub fn release(&mut self, offset: ByteOffset, length: u64) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        let start = offset.0;
        let end = offset.checked_add(length).ok_or(DbufError::OffsetOverflow)?.0;
        if end > self.file_length {
            return Err(DbufError::ReleaseBeyondEnd {
                offset: start,
                length,
                file_length: self.file_length,
            });
        }

        let incoming = FreeBlock::new(offset, length);
        let before = self
            .by_offset
            .range(..=start)
            .next_back()
            .map(|(&o, &l)| FreeBlock::new(ByteOffset(o), l));
        let after = self
            .by_offset
            .range(start..)
            .next()
            .map(|(&o, &l)| FreeBlock::new(ByteOffset(o), l));

        if before.is_some_and(|b| b.overlaps(&incoming))
            || after.is_some_and(|a| a.overlaps(&incoming))
        {
            return Err(DbufError::DoubleRelease { offset: start, length });
        }

        let mut merged_start = start;
        let mut merged_len = length;
        if let Some(b) = before.filter(|b| b.abuts(&incoming)) {
            self.remove_block(b.offset.0, b.length);
            merged_start = b.offset.0;
            merged_len += b.length;
        }
        if let Some(a) = after.filter(|a| incoming.abuts(a)) {
            self.remove_block(a.offset.0, a.length);
            merged_len += a.length;
        }
        self.insert_block(merged_start, merged_len);

        trace!(
            target: "dbuf::alloc",
            event = "release",
            offset = start,
            length,
            merged_offset = merged_start,
            merged_length = merged_len
        );
        Ok(())
    }

    /// Find a slot of `size` bytes.
    ///
    /// Takes the smallest free block that fits; any surplus goes back through
    /// [`Self::release`]. Falls back to growing the file.
    pub fn acquire(&mut self, size: u64) -> Result<ByteOffset> {
        if size == 0 {
            return Err(DbufError::ZeroSizedSlot);
        }

        if let Some(&(len, off)) = self.by_length.range((size, 0)..).next() {
            self.remove_block(off, len);
            if len > size {
                self.release(ByteOffset(off + size), len - size)?;
            }
            trace!(
                target: "dbuf::alloc",
                event = "acquire_reuse",
                offset = off,
                size,
                block_length = len
            );
            return Ok(ByteOffset(off));
        }

        let off = self.file_length;
        self.file_length = ByteOffset(off)
            .checked_add(size)
            .ok_or(DbufError::OffsetOverflow)?
            .0;
        trace!(
            target: "dbuf::alloc",
            event = "acquire_append",
            offset = off,
            size,
            file_length = self.file_length
        );
        Ok(ByteOffset(off))
    }

    /// Release an object's old slot and acquire one of `new_size` bytes.
    ///
    /// The old range is released first, so a grown object may land on its own
    /// former position if the merged block now fits. Both steps run on a
    /// staged copy: on error the map, including the old range, is unchanged.
    pub fn relocate(
        &mut self,
        old_offset: ByteOffset,
        old_length: u64,
        new_size: u64,
    ) -> Result<ByteOffset> {
        if new_size == 0 {
            return Err(DbufError::ZeroSizedSlot);
        }
        let mut staged = self.clone();
        staged.release(old_offset, old_length)?;
        let new_offset = staged.acquire(new_size)?;
        *self = staged;
        debug!(
            target: "dbuf::alloc",
            event = "relocate",
            old_offset = old_offset.0,
            old_length,
            new_offset = new_offset.0,
            new_size
        );
        Ok(new_offset)
    }

    /// Full coalescing sweep. Returns the number of merges performed.
    ///
    /// `release` already coalesces, so on a healthy map this returns 0.
    pub fn defragment(&mut self) -> usize {
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.by_offset.len());
        let mut merges = 0_usize;
        for (&off, &len) in &self.by_offset {
            match merged.last_mut() {
                Some((prev_off, prev_len)) if *prev_off + *prev_len == off => {
                    *prev_len += len;
                    merges += 1;
                }
                _ => merged.push((off, len)),
            }
        }
        if merges > 0 {
            self.by_offset = merged.iter().copied().collect();
            self.by_length = merged.iter().map(|&(o, l)| (l, o)).collect();
        }
        debug!(
            target: "dbuf::alloc",
            event = "defragment",
            merges,
            blocks = self.by_offset.len()
        );
        merges
    }

    /// Check the structural invariants: the two indexes agree, no block is
    /// empty, no two blocks touch or overlap, and every block lies below the
    /// file length.
    pub fn verify(&self) -> Result<()> {
        if self.by_offset.len() != self.by_length.len() {
            return Err(DbufError::CorruptFreeSpace(format!(
                "index size mismatch: {} by offset, {} by length",
                self.by_offset.len(),
                self.by_length.len()
            )));
        }
        let mut prev: Option<FreeBlock> = None;
        for (&off, &len) in &self.by_offset {
            if len == 0 {
                return Err(DbufError::CorruptFreeSpace(format!(
                    "empty block at {off}"
                )));
            }
            if !self.by_length.contains(&(len, off)) {
                return Err(DbufError::CorruptFreeSpace(format!(
                    "block at {off} missing from length index"
                )));
            }
            let block = FreeBlock::new(ByteOffset(off), len);
            if let Some(p) = prev.filter(|p| p.abuts(&block) || p.overlaps(&block)) {
                return Err(DbufError::CorruptFreeSpace(format!(
                    "block at {off} touches or overlaps its predecessor ending at {}",
                    p.end()
                )));
            }
            let end = block.end();
            if end > self.file_length {
                return Err(DbufError::CorruptFreeSpace(format!(
                    "block at {off} ends at {end}, past file length {}",
                    self.file_length
                )));
            }
            prev = Some(block);
        }
        Ok(())
    }

    /// Flatten as `[offset0, len0, offset1, len1, ...]` in offset order.
    #[must_use]
    pub fn to_vector(&self) -> Vec<u64> {
        self.by_offset
            .iter()
            .flat_map(|(&off, &len)| [off, len])
            .collect()
    }

    /// Replace the free blocks with the pairs in `vector`.
    ///
    /// The file length is raised to cover every restored block. On error the
    /// map is left as it was.
    pub fn restore_from_vector(&mut self, vector: &[u64]) -> Result<()> {
        if vector.len() % 2 != 0 {
            return Err(DbufError::CorruptFreeSpace(format!(
                "odd number of entries: {}",
                vector.len()
            )));
        }

        let mut rebuilt = Self::with_file_length(self.file_length);
        for pair in vector.chunks_exact(2) {
            let (off, len) = (pair[0], pair[1]);
            if len == 0 {
                return Err(DbufError::CorruptFreeSpace(format!(
                    "zero-length block at {off}"
                )));
            }
            let end = off.checked_add(len).ok_or_else(|| {
                DbufError::CorruptFreeSpace(format!("block at {off} overflows"))
            })?;
            rebuilt.set_file_length(end);
            rebuilt
                .release(ByteOffset(off), len)
                .map_err(|err| DbufError::CorruptFreeSpace(err.to_string()))?;
        }

        debug!(
            target: "dbuf::alloc",
            event = "restore",
            blocks = rebuilt.block_count(),
            file_length = rebuilt.file_length
        );
        *self = rebuilt;
        Ok(())
    }
}

// ── Shared allocator ────────────────────────────────────────────────────────

/// [`FreeSpaceMap`] behind its own lock.
///
/// The lock is held only for bookkeeping, never across I/O.
#[derive(Debug, Default)]
pub struct FreeSpace {
    map: Mutex<FreeSpaceMap>,
}

impl FreeSpace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_file_length(file_length: u64) -> Self {
        Self {
            map: Mutex::new(FreeSpaceMap::with_file_length(file_length)),
        }
    }

    pub fn release(&self, offset: ByteOffset, length: u64) -> Result<()> {
        self.map.lock().release(offset, length)
    }

    pub fn acquire(&self, size: u64) -> Result<ByteOffset> {
        self.map.lock().acquire(size)
    }

    pub fn relocate(
        &self,
        old_offset: ByteOffset,
        old_length: u64,
        new_size: u64,
    ) -> Result<ByteOffset> {
        self.map.lock().relocate(old_offset, old_length, new_size)
    }

    pub fn defragment(&self) -> usize {
        self.map.lock().defragment()
    }

    pub fn verify(&self) -> Result<()> {
        self.map.lock().verify()
    }

    #[must_use]
    pub fn file_length(&self) -> u64 {
        self.map.lock().file_length()
    }

    pub fn set_file_length(&self, len: u64) -> u64 {
        self.map.lock().set_file_length(len)
    }

    #[must_use]
    pub fn blocks(&self) -> Vec<FreeBlock> {
        self.map.lock().blocks()
    }

    #[must_use]
    pub fn snapshot(&self) -> FreeSpaceSnapshot {
        self.map.lock().snapshot()
    }

    #[must_use]
    pub fn to_vector(&self) -> Vec<u64> {
        self.map.lock().to_vector()
    }

    pub fn restore_from_vector(&self, vector: &[u64]) -> Result<()> {
        self.map.lock().restore_from_vector(vector)
    }
}
