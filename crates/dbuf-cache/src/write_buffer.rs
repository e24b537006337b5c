//! Deferred write-back of evicted objects.
//!
//! Evicted objects accumulate here until their combined size reaches the
//! buffer budget, then they are saved as one batch and the batch-finalize
//! hook runs once. Batching keeps repeated evictions of the same object from
//! turning into repeated writes.

use crate::ManagedObject;
use dbuf_alloc::FreeSpace;
use dbuf_error::{DbufError, FlushFailure};
use dbuf_types::ObjectId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[derive(Debug)]
pub struct WriteBuffer<O> {
    pending: HashMap<ObjectId, (Arc<O>, u64)>,
    used: u64,
    budget: u64,
}

impl<O> WriteBuffer<O> {
    #[must_use]
    pub fn new(budget: u64) -> Self {
        Self {
            pending: HashMap::new(),
            used: 0,
            budget,
        }
    }

    /// A budget of 0 disables the buffer; evictions are then saved directly.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.budget > 0
    }

    #[must_use]
    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn set_budget(&mut self, budget: u64) {
        self.budget = budget;
    }

    #[must_use]
    pub fn used(&self) -> u64 {
        self.used
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: ObjectId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Whether pending usage has reached the budget.
    #[must_use]
    pub fn is_due(&self) -> bool {
        self.is_enabled() && self.used >= self.budget
    }
}

impl<O: ManagedObject> WriteBuffer<O> {
    /// Add an object to the pending set.
    ///
    /// A stale entry for the same id is replaced and its size uncharged first.
    pub fn absorb(&mut self, obj: Arc<O>, size: u64) {
        let id = obj.id();
        if let Some((_, stale)) = self.pending.insert(id, (obj, size)) {
            self.used = self.used.saturating_sub(stale);
        }
        self.used = self.used.saturating_add(size);
        trace!(
            target: "dbuf::write_buffer",
            event = "absorb",
            id = id.0,
            size,
            used = self.used
        );
    }

    pub fn remove(&mut self, id: ObjectId) -> Option<(Arc<O>, u64)> {
        let entry = self.pending.remove(&id)?;
        self.used = self.used.saturating_sub(entry.1);
        Some(entry)
    }

    /// Detach every non-busy pending object for saving.
    ///
    /// Busy objects stay pending. Usage is recomputed from what remains. The
    /// batch is ordered by file position so the backing file is written front
    /// to back.
    pub fn take_flushable(&mut self) -> Vec<(Arc<O>, u64)> {
        let ready: Vec<ObjectId> = self
            .pending
            .iter()
            .filter(|(_, (obj, _))| !obj.is_busy())
            .map(|(id, _)| *id)
            .collect();
        let mut batch: Vec<(Arc<O>, u64)> = ready
            .iter()
            .filter_map(|id| self.pending.remove(id))
            .collect();
        batch.sort_by_key(|(obj, _)| (obj.file_position(), obj.id()));
        self.used = self.pending.values().map(|(_, size)| size).sum();
        trace!(
            target: "dbuf::write_buffer",
            event = "take_flushable",
            taken = batch.len(),
            left_busy = self.pending.len()
        );
        batch
    }

    /// Put back an object whose save failed.
    ///
    /// Returns `false` if a fresher entry for the same id was absorbed while
    /// the batch was in flight; the fresher entry wins.
    pub fn reinstate(&mut self, obj: Arc<O>, size: u64) -> bool {
        if self.pending.contains_key(&obj.id()) {
            return false;
        }
        self.absorb(obj, size);
        true
    }
}

/// Result of saving one batch.
#[derive(Debug)]
pub struct BatchOutcome<O> {
    /// Objects persisted successfully, in save order.
    pub saved: Vec<ObjectId>,
    /// Objects whose save failed, with their charged size and the error.
    pub failed: Vec<(Arc<O>, u64, DbufError)>,
    /// Error from the batch-finalize hook, if it ran and failed.
    pub finalize_error: Option<DbufError>,
}

impl<O: ManagedObject> BatchOutcome<O> {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.finalize_error.is_none()
    }

    /// Fold failures into a single error, or `Ok` if the batch was clean.
    ///
    /// Save failures take precedence over a finalize failure, which is then
    /// only logged.
    pub fn into_result(self) -> dbuf_error::Result<()> {
        if self.is_clean() {
            return Ok(());
        }
        let mut failures: Vec<FlushFailure> = self
            .failed
            .iter()
            .map(|(obj, _, err)| FlushFailure {
                id: obj.id().0,
                detail: err.to_string(),
            })
            .collect();
        if failures.is_empty() {
            return self.finalize_error.map_or(Ok(()), Err);
        }
        if let Some(err) = self.finalize_error {
            warn!(target: "dbuf::write_buffer", event = "finalize_failed", error = %err);
        }
        failures.sort_by_key(|f| f.id);
        Err(DbufError::FlushFailed { failures })
    }
}

/// Save every object in `batch`, continuing past failures.
///
/// When `finalize` is set and at least one save succeeded, `flush_data()` is
/// called once on the last object saved. Must be called without any cache
/// lock held.
pub fn persist_batch<O: ManagedObject>(
    batch: Vec<(Arc<O>, u64)>,
    space: &FreeSpace,
    finalize: bool,
) -> BatchOutcome<O> {
    let mut saved = Vec::with_capacity(batch.len());
    let mut failed = Vec::new();
    let mut last_saved: Option<Arc<O>> = None;

    for (obj, size) in batch {
        match obj.save(space) {
            Ok(()) => {
                saved.push(obj.id());
                last_saved = Some(obj);
            }
            Err(err) => {
                warn!(
                    target: "dbuf::write_buffer",
                    event = "save_failed",
                    id = obj.id().0,
                    category = ?err.category(),
                    error = %err
                );
                failed.push((obj, size, err));
            }
        }
    }

    let finalize_error = match (finalize, last_saved) {
        (true, Some(obj)) => obj.flush_data().err(),
        _ => None,
    };

    debug!(
        target: "dbuf::write_buffer",
        event = "persist_batch",
        saved = saved.len(),
        failed = failed.len(),
        finalized = finalize
    );
    BatchOutcome {
        saved,
        failed,
        finalize_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemObject;
    use std::sync::atomic::Ordering;

    #[test]
    fn absorb_replaces_stale_entry() {
        let mut buf = WriteBuffer::new(1000);
        let a = MemObject::new(1, 100);
        buf.absorb(Arc::clone(&a), 100);
        buf.absorb(Arc::clone(&a), 40);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.used(), 40);
    }

    #[test]
    fn due_only_when_enabled_and_full() {
        let mut buf = WriteBuffer::new(100);
        buf.absorb(MemObject::new(1, 60), 60);
        assert!(!buf.is_due());
        buf.absorb(MemObject::new(2, 40), 40);
        assert!(buf.is_due());

        let mut disabled = WriteBuffer::new(0);
        disabled.absorb(MemObject::new(1, 60), 60);
        assert!(!disabled.is_due());
    }

    #[test]
    fn take_flushable_leaves_busy_and_recomputes_usage() {
        let mut buf = WriteBuffer::new(10);
        let a = MemObject::new(1, 5);
        let b = MemObject::new(2, 7);
        b.set_busy(true);
        buf.absorb(Arc::clone(&a), 5);
        buf.absorb(Arc::clone(&b), 7);

        let batch = buf.take_flushable();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].0.id, ObjectId(1));
        assert!(buf.contains(ObjectId(2)));
        assert_eq!(buf.used(), 7);
    }

    #[test]
    fn take_flushable_orders_by_file_position() {
        let mut buf = WriteBuffer::new(10);
        buf.absorb(MemObject::at(1, 1, 900), 1);
        buf.absorb(MemObject::at(2, 1, 100), 1);
        buf.absorb(MemObject::at(3, 1, 500), 1);
        let order: Vec<u64> = buf
            .take_flushable()
            .iter()
            .map(|(o, _)| o.id.0)
            .collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn persist_batch_finalizes_once_on_last_saved() {
        let space = FreeSpace::new();
        let a = MemObject::at(1, 1, 0);
        let b = MemObject::at(2, 1, 10);
        let outcome = persist_batch(
            vec![(Arc::clone(&a), 1), (Arc::clone(&b), 1)],
            &space,
            true,
        );
        assert!(outcome.is_clean());
        assert_eq!(outcome.saved, vec![ObjectId(1), ObjectId(2)]);
        assert_eq!(a.flush_count(), 0);
        assert_eq!(b.flush_count(), 1);
    }

    #[test]
    fn persist_batch_continues_past_failures() {
        let space = FreeSpace::new();
        let a = MemObject::new(1, 1);
        let b = MemObject::new(2, 1);
        let c = MemObject::new(3, 1);
        b.fail_save.store(true, Ordering::SeqCst);

        let outcome = persist_batch(
            vec![
                (Arc::clone(&a), 1),
                (Arc::clone(&b), 1),
                (Arc::clone(&c), 1),
            ],
            &space,
            true,
        );
        assert_eq!(outcome.saved, vec![ObjectId(1), ObjectId(3)]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(c.flush_count(), 1);

        let err = outcome.into_result().unwrap_err();
        assert_eq!(err.failed_ids(), vec![2]);
    }

    #[test]
    fn persist_batch_skips_finalize_when_nothing_saved() {
        let space = FreeSpace::new();
        let a = MemObject::new(1, 1);
        a.fail_save.store(true, Ordering::SeqCst);
        let outcome = persist_batch(vec![(Arc::clone(&a), 1)], &space, true);
        assert!(outcome.saved.is_empty());
        assert_eq!(a.flush_count(), 0);
    }

    #[test]
    fn reinstate_yields_to_fresher_entry() {
        let mut buf = WriteBuffer::new(100);
        let a = MemObject::new(1, 10);
        buf.absorb(Arc::clone(&a), 30);
        assert!(!buf.reinstate(Arc::clone(&a), 10));
        assert_eq!(buf.used(), 30);

        let b = MemObject::new(2, 10);
        assert!(buf.reinstate(b, 10));
        assert_eq!(buf.used(), 40);
    }
}
