#![forbid(unsafe_code)]
//! Residency bookkeeping for disk-backed objects.
//!
//! Provides the [`ManagedObject`] contract plus the three in-memory
//! structures the disk buffer orchestrates:
//!
//! - [`mru::MruList`] — resident objects in recency order, evicting from the
//!   least-recently-used end under a byte budget.
//! - [`write_buffer::WriteBuffer`] — evicted objects waiting to be saved in one
//!   batch.
//! - [`small_objects::SmallObjectTracker`] — tiny objects pinned in memory
//!   because a disk round-trip would cost more than their payload.
//!
//! None of these structures lock or perform I/O on their own. The facade in
//! `dbuf-core` owns the locks and drives `save()` through
//! [`write_buffer::persist_batch`] with no cache lock held.

pub mod mru;
pub mod small_objects;
pub mod write_buffer;

use dbuf_alloc::FreeSpace;
use dbuf_error::Result;
use dbuf_types::{ByteOffset, ObjectId};

pub use mru::MruList;
pub use small_objects::SmallObjectTracker;
pub use write_buffer::{BatchOutcome, WriteBuffer, persist_batch};

/// The capability set the cache requires from the objects it manages.
///
/// Objects are owned by an external store. The cache only keeps `Arc`
/// handles it was given through `touch()`; it never creates objects and never
/// touches their payload bytes.
pub trait ManagedObject: Send + Sync {
    /// Stable identity.
    fn id(&self) -> ObjectId;

    /// Bytes of payload currently held in memory.
    fn memory_size(&self) -> u64;

    /// Start of the object's slot in the backing file.
    fn file_position(&self) -> ByteOffset;

    /// Length of the object's slot in the backing file (0 if never saved).
    fn on_file_size(&self) -> u64;

    /// True while some other part of the system is mutating the object.
    ///
    /// Busy objects are skipped by eviction and flush and retried later.
    fn is_busy(&self) -> bool;

    /// Persist the in-memory payload.
    ///
    /// `space` is the allocator for the backing file; an object that outgrew
    /// its slot relocates itself through it.
    fn save(&self, space: &FreeSpace) -> Result<()>;

    /// Bring the payload back into memory.
    fn load(&self) -> Result<()>;

    /// Batch finalize hook, called once after a group of saves.
    fn flush_data(&self) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use dbuf_error::DbufError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    /// In-memory object that counts calls and can be told to fail.
    #[derive(Debug)]
    pub struct MemObject {
        pub id: ObjectId,
        pub size: AtomicU64,
        pub position: AtomicU64,
        pub busy: AtomicBool,
        pub fail_save: AtomicBool,
        pub saves: AtomicUsize,
        pub flushes: AtomicUsize,
    }

    impl MemObject {
        pub fn new(id: u64, size: u64) -> Arc<Self> {
            Arc::new(Self {
                id: ObjectId(id),
                size: AtomicU64::new(size),
                position: AtomicU64::new(0),
                busy: AtomicBool::new(false),
                fail_save: AtomicBool::new(false),
                saves: AtomicUsize::new(0),
                flushes: AtomicUsize::new(0),
            })
        }

        pub fn at(id: u64, size: u64, position: u64) -> Arc<Self> {
            let obj = Self::new(id, size);
            obj.position.store(position, Ordering::SeqCst);
            obj
        }

        pub fn set_busy(&self, busy: bool) {
            self.busy.store(busy, Ordering::SeqCst);
        }

        pub fn save_count(&self) -> usize {
            self.saves.load(Ordering::SeqCst)
        }

        pub fn flush_count(&self) -> usize {
            self.flushes.load(Ordering::SeqCst)
        }
    }

    impl ManagedObject for MemObject {
        fn id(&self) -> ObjectId {
            self.id
        }

        fn memory_size(&self) -> u64 {
            self.size.load(Ordering::SeqCst)
        }

        fn file_position(&self) -> ByteOffset {
            ByteOffset(self.position.load(Ordering::SeqCst))
        }

        fn on_file_size(&self) -> u64 {
            self.memory_size()
        }

        fn is_busy(&self) -> bool {
            self.busy.load(Ordering::SeqCst)
        }

        fn save(&self, _space: &FreeSpace) -> Result<()> {
            if self.fail_save.load(Ordering::SeqCst) {
                return Err(DbufError::Save {
                    id: self.id.0,
                    detail: "injected failure".into(),
                });
            }
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn load(&self) -> Result<()> {
            Ok(())
        }

        fn flush_data(&self) -> Result<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
