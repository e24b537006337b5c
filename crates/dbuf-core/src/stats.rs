//! Point-in-time usage figures.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Snapshot of every budget and its current usage.
///
/// The three sections are read under their own locks one after another, so
/// the snapshot is not atomic across subsystems.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub resident_objects: usize,
    pub resident_bytes: u64,
    pub resident_budget: u64,
    pub pending_objects: usize,
    pub pending_bytes: u64,
    pub write_buffer_budget: u64,
    pub small_objects: usize,
    pub small_object_bytes: u64,
    pub small_object_budget: u64,
    pub small_object_threshold: u64,
    pub free_blocks: usize,
    pub free_bytes: u64,
    pub file_length: u64,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "resident: {} objects, {}/{} bytes; write buffer: {} pending, {}/{} bytes; \
             small objects: {} pinned, {}/{} bytes (threshold {}); \
             free space: {} blocks, {} bytes; file length: {} bytes",
            self.resident_objects,
            self.resident_bytes,
            self.resident_budget,
            self.pending_objects,
            self.pending_bytes,
            self.write_buffer_budget,
            self.small_objects,
            self.small_object_bytes,
            self.small_object_budget,
            self.small_object_threshold,
            self.free_blocks,
            self.free_bytes,
            self.file_length,
        )
    }
}
