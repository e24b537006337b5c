#![forbid(unsafe_code)]
//! Disk-backed object cache with integrated free-space allocation.
//!
//! [`DiskBuffer`] keeps large, growable objects mostly out of memory while
//! callers keep using them as if they were resident. It coordinates four
//! pieces, each behind its own lock or none:
//!
//! | Piece | Lock | Role |
//! |-------|------|------|
//! | `MruList` + `WriteBuffer` | cache lock | recency order, eviction, pending writes |
//! | `FreeSpace` | allocator lock | unused byte ranges of the backing file |
//! | `SmallObjectTracker` | small-object lock | tiny objects pinned in memory |
//!
//! No two of these locks are ever held at the same time.
//!
//! ## Object lifecycle
//!
//! ```text
//! Unmanaged --touch--> Resident(head) --ages--> Resident(tail)
//!     ^                     ^                        |
//!     |                     +-------- touch ---------+ evict
//!     |                                              v
//!     +------------- flush succeeds ------------ PendingWrite (busy: stays)
//!
//! notify_deleted: any state --> Gone (slot released to the allocator)
//! ```
//!
//! ## I/O outside the cache lock
//!
//! Eviction and flush detach their victims while holding the cache lock, drop
//! it, call `save()`, and take the lock again only to put failed objects back.
//! `touch` may still block on storage, but other threads can keep touching
//! while it does. Objects in flight are counted per id: `notify_deleted` waits
//! on a condition variable until no batch holds the object, so the slot a
//! concurrent save acquires is the one that gets released.

pub mod config;
pub mod stats;

pub use config::CacheConfig;
pub use stats::CacheStats;

use dbuf_alloc::{FreeSpace, FreeSpaceSnapshot};
use dbuf_cache::mru::EvictionMode;
use dbuf_cache::{BatchOutcome, MruList, SmallObjectTracker, WriteBuffer};
use dbuf_error::Result;
use dbuf_types::{ByteOffset, FreeBlock, ObjectId};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use dbuf_cache::{ManagedObject, persist_batch};

#[derive(Debug)]
struct CacheState<O> {
    mru: MruList<O>,
    writes: WriteBuffer<O>,
    /// Detached for saving, by id; counts concurrent batches holding the id.
    in_flight: HashMap<ObjectId, u32>,
}

impl<O: ManagedObject> CacheState<O> {
    fn mark_in_flight(&mut self, batch: &[(Arc<O>, u64)]) {
        for (obj, _) in batch {
            *self.in_flight.entry(obj.id()).or_insert(0) += 1;
        }
    }

    /// Drop one in-flight mark; `true` once no batch holds the id any more.
    fn settle(&mut self, id: ObjectId) -> bool {
        match self.in_flight.get_mut(&id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.in_flight.remove(&id);
                true
            }
            None => true,
        }
    }
}

/// Where a failed save goes back to.
#[derive(Debug, Clone, Copy)]
enum Reinstate {
    LruTail,
    Pending,
}

/// Disk-backed object cache facade.
///
/// Generic over the concrete object type the owning store manages. The cache
/// holds `Arc` handles it receives through [`DiskBuffer::touch`] and drops
/// them once an object is saved or deleted; it never creates objects.
#[derive(Debug)]
pub struct DiskBuffer<O> {
    state: Mutex<CacheState<O>>,
    /// Signalled whenever a batch settles its in-flight marks.
    settled: Condvar,
    space: FreeSpace,
    small: Mutex<SmallObjectTracker>,
}

impl<O: ManagedObject> DiskBuffer<O> {
    /// Build a cache for a fresh, empty backing file.
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::with_file_length(config, 0)
    }

    /// Build a cache for an existing backing file of `file_length` bytes, all
    /// of which is considered allocated until told otherwise.
    pub fn with_file_length(config: CacheConfig, file_length: u64) -> Result<Self> {
        config.validate()?;
        info!(
            target: "dbuf::core",
            event = "open",
            resident_budget = config.resident_budget,
            write_buffer_budget = config.write_buffer_budget,
            small_object_budget = config.small_object_budget,
            file_length
        );
        Ok(Self {
            state: Mutex::new(CacheState {
                mru: MruList::new(config.resident_budget),
                writes: WriteBuffer::new(config.write_buffer_budget),
                in_flight: HashMap::new(),
            }),
            settled: Condvar::new(),
            space: FreeSpace::with_file_length(file_length),
            small: Mutex::new(SmallObjectTracker::new(config.small_object_budget)),
        })
    }

    /// The allocator for the backing file.
    #[must_use]
    pub fn space(&self) -> &FreeSpace {
        &self.space
    }

    // ── Residency ───────────────────────────────────────────────────────────

    /// Record a use of `obj`.
    ///
    /// Moves it to the most-recently-used position (pulling it out of the
    /// write-back buffer if it was pending) and evicts from the
    /// least-recently-used end if the resident budget is exceeded. Without a
    /// write-back buffer the victims are saved right away; with one they are
    /// queued and the queue is flushed once it reaches its budget.
    ///
    /// Errors are the save failures this call triggered. Failed objects stay
    /// managed and are retried later.
    pub fn touch(&self, obj: &Arc<O>) -> Result<()> {
        let id = obj.id();
        if self.should_stay_resident(id, obj.memory_size()) {
            let mut state = self.state.lock();
            let _ = state.mru.remove(id);
            let _ = state.writes.remove(id);
            return Ok(());
        }

        let mut state = self.state.lock();
        let _ = state.writes.remove(id);
        if !state.mru.is_enabled() {
            return Ok(());
        }
        state.mru.touch(obj);
        if !state.mru.over_budget() {
            return Ok(());
        }

        if state.writes.is_enabled() {
            for (victim, size) in state.mru.evict(EvictionMode::TakeAll) {
                state.writes.absorb(victim, size);
            }
            if !state.writes.is_due() {
                return Ok(());
            }
            let batch = state.writes.take_flushable();
            state.mark_in_flight(&batch);
            drop(state);
            self.persist(batch, true, Reinstate::Pending)
        } else {
            let batch = state.mru.evict(EvictionMode::SkipBusy);
            state.mark_in_flight(&batch);
            drop(state);
            self.persist(batch, false, Reinstate::LruTail)
        }
    }

    fn persist(
        &self,
        batch: Vec<(Arc<O>, u64)>,
        finalize: bool,
        target: Reinstate,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let outcome: BatchOutcome<O> = persist_batch(batch, &self.space, finalize);

        let mut state = self.state.lock();
        for id in &outcome.saved {
            let _ = state.settle(*id);
        }
        for (obj, size, _) in &outcome.failed {
            // A later batch still holding the id decides for itself.
            if !state.settle(obj.id()) || state.mru.contains(obj.id()) {
                continue;
            }
            match target {
                Reinstate::LruTail => {
                    let _ = state.mru.reinstate_tail(Arc::clone(obj), *size);
                }
                Reinstate::Pending => {
                    let _ = state.writes.reinstate(Arc::clone(obj), *size);
                }
            }
        }
        drop(state);
        self.settled.notify_all();

        outcome.into_result()
    }

    /// Save every non-busy pending object now.
    pub fn flush_cache(&self) -> Result<()> {
        let mut state = self.state.lock();
        let batch = state.writes.take_flushable();
        state.mark_in_flight(&batch);
        drop(state);
        self.persist(batch, true, Reinstate::Pending)
    }

    /// Move every resident object into the write-back buffer and flush it.
    ///
    /// Call before shutting down so no resident change is silently dropped.
    /// Objects still busy stay pending and are logged.
    pub fn teardown_flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        let resident = state.mru.drain();
        let moved = resident.len();
        for (obj, size) in resident {
            state.writes.absorb(obj, size);
        }
        let batch = state.writes.take_flushable();
        let left_busy = state.writes.len();
        state.mark_in_flight(&batch);
        drop(state);

        info!(
            target: "dbuf::core",
            event = "teardown_flush",
            moved,
            flushing = batch.len(),
            left_busy
        );
        if left_busy > 0 {
            warn!(
                target: "dbuf::core",
                event = "teardown_busy",
                left_busy,
                "busy objects left pending at teardown"
            );
        }
        self.persist(batch, true, Reinstate::Pending)
    }

    /// Forget a deleted object and return its file slot to the allocator.
    ///
    /// Valid from any state. `on_file_size` is the length of the slot the
    /// object occupied (0 if it was never saved). If a save of the object is
    /// in flight, this blocks until it finishes and then releases the slot
    /// the save left behind, as reported by the object itself.
    pub fn notify_deleted(&self, obj: &O, on_file_size: u64) -> Result<()> {
        let id = obj.id();
        let mut waited = false;
        {
            let mut state = self.state.lock();
            while state.in_flight.contains_key(&id) {
                waited = true;
                self.settled.wait(&mut state);
            }
            let _ = state.mru.remove(id);
            let _ = state.writes.remove(id);
        }
        self.small.lock().on_delete(id);

        let length = if waited { obj.on_file_size() } else { on_file_size };
        let offset = obj.file_position();
        debug!(
            target: "dbuf::core",
            event = "deleted",
            id = id.0,
            offset = offset.0,
            length,
            waited
        );
        self.space.release(offset, length)
    }

    // ── Small objects ───────────────────────────────────────────────────────

    /// Size the small-object table for ids `0..count`.
    pub fn configure_residency_budget_for_count(&self, count: usize) {
        self.small.lock().configure(count);
    }

    /// Whether `id` with `size` bytes is small enough to stay pinned.
    pub fn should_stay_resident(&self, id: ObjectId, size: u64) -> bool {
        self.small.lock().should_stay_resident(id, size)
    }

    #[must_use]
    pub fn small_object_usage(&self) -> u64 {
        self.small.lock().used()
    }

    // ── Slots ───────────────────────────────────────────────────────────────

    pub fn acquire_slot(&self, size: u64) -> Result<ByteOffset> {
        self.space.acquire(size)
    }

    pub fn relocate_slot(
        &self,
        old_offset: ByteOffset,
        old_size: u64,
        new_size: u64,
    ) -> Result<ByteOffset> {
        self.space.relocate(old_offset, old_size, new_size)
    }

    pub fn release_slot(&self, offset: ByteOffset, size: u64) -> Result<()> {
        self.space.release(offset, size)
    }

    #[must_use]
    pub fn file_length(&self) -> u64 {
        self.space.file_length()
    }

    /// Raise the file-length high-water mark; it never moves down.
    pub fn set_file_length(&self, len: u64) -> u64 {
        self.space.set_file_length(len)
    }

    pub fn defragment(&self) -> usize {
        self.space.defragment()
    }

    /// Free blocks in ascending offset order.
    #[must_use]
    pub fn free_list_snapshot(&self) -> Vec<FreeBlock> {
        self.space.blocks()
    }

    #[must_use]
    pub fn free_space_snapshot(&self) -> FreeSpaceSnapshot {
        self.space.snapshot()
    }

    /// Free space flattened as `[offset0, len0, offset1, len1, ...]` for
    /// storing alongside the backing file.
    #[must_use]
    pub fn free_space_vector(&self) -> Vec<u64> {
        self.space.to_vector()
    }

    /// Rebuild the free space from a vector written by
    /// [`Self::free_space_vector`].
    pub fn restore_free_space(&self, vector: &[u64]) -> Result<()> {
        self.space.restore_from_vector(vector)
    }

    // ── Budgets and diagnostics ─────────────────────────────────────────────

    /// Change the resident budget. A lower budget takes effect on the next
    /// `touch`.
    pub fn set_resident_budget(&self, bytes: u64) {
        self.state.lock().mru.set_budget(bytes);
    }

    pub fn set_write_buffer_budget(&self, bytes: u64) {
        self.state.lock().writes.set_budget(bytes);
    }

    pub fn set_small_object_budget(&self, bytes: u64) {
        self.small.lock().set_budget(bytes);
    }

    #[must_use]
    pub fn resident_usage(&self) -> u64 {
        self.state.lock().mru.used()
    }

    #[must_use]
    pub fn pending_usage(&self) -> u64 {
        self.state.lock().writes.used()
    }

    #[must_use]
    pub fn is_resident(&self, id: ObjectId) -> bool {
        self.state.lock().mru.contains(id)
    }

    #[must_use]
    pub fn is_pending(&self, id: ObjectId) -> bool {
        self.state.lock().writes.contains(id)
    }

    /// Resident ids from most to least recently used.
    #[must_use]
    pub fn resident_ids(&self) -> Vec<ObjectId> {
        self.state.lock().mru.ids()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let mut stats = {
            let state = self.state.lock();
            CacheStats {
                resident_objects: state.mru.len(),
                resident_bytes: state.mru.used(),
                resident_budget: state.mru.budget(),
                pending_objects: state.writes.len(),
                pending_bytes: state.writes.used(),
                write_buffer_budget: state.writes.budget(),
                ..CacheStats::default()
            }
        };
        {
            let small = self.small.lock();
            stats.small_objects = small.pinned();
            stats.small_object_bytes = small.used();
            stats.small_object_budget = small.budget();
            stats.small_object_threshold = small.threshold();
        }
        let snapshot = self.space.snapshot();
        stats.free_blocks = snapshot.blocks.len();
        stats.free_bytes = snapshot.free_bytes();
        stats.file_length = snapshot.file_length;
        stats
    }

    /// One-line human-readable usage summary.
    #[must_use]
    pub fn usage_summary(&self) -> String {
        self.stats().to_string()
    }
}

impl<O> Drop for DiskBuffer<O> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let resident = state.mru.len();
        let pending = state.writes.len();
        if resident + pending > 0 {
            warn!(
                target: "dbuf::core",
                event = "dropped_unflushed",
                resident,
                pending,
                "disk buffer dropped without teardown_flush"
            );
        }
    }
}
