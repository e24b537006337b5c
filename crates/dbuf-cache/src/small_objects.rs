//! Residency policy for tiny objects.
//!
//! Objects below a per-slot size threshold are cheaper to keep in memory than
//! to round-trip through the backing file. The tracker records their sizes by
//! id so the aggregate pinned footprint stays visible, and tells the caller
//! which objects must bypass MRU and write-back eviction.

use dbuf_types::ObjectId;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct SmallObjectTracker {
    /// Recorded size per id. A pinned object may have size 0.
    sizes: Vec<Option<u64>>,
    used: u64,
    budget: u64,
    threshold: u64,
}

impl SmallObjectTracker {
    #[must_use]
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Aggregate size of all recorded small objects.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.used
    }

    /// Objects strictly smaller than this stay resident.
    #[must_use]
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Number of ids the table covers.
    #[must_use]
    pub fn slots(&self) -> usize {
        self.sizes.len()
    }

    /// Recorded count of pinned objects.
    #[must_use]
    pub fn pinned(&self) -> usize {
        self.sizes.iter().filter(|s| s.is_some()).count()
    }

    fn recompute_threshold(&mut self) {
        self.threshold = match u64::try_from(self.sizes.len()) {
            Ok(0) | Err(_) => 0,
            Ok(count) => self.budget / count,
        };
    }

    /// Size the table for `max_count` ids and recompute the threshold as
    /// `budget / max_count` (0 when `max_count` is 0).
    ///
    /// Records for ids beyond the new size are dropped from the aggregate.
    pub fn configure(&mut self, max_count: usize) {
        if max_count < self.sizes.len() {
            let dropped: u64 = self.sizes[max_count..].iter().flatten().sum();
            self.used = self.used.saturating_sub(dropped);
        }
        self.sizes.resize(max_count, None);
        self.recompute_threshold();
        debug!(
            target: "dbuf::small_objects",
            event = "configure",
            slots = max_count,
            threshold = self.threshold,
            budget = self.budget
        );
    }

    /// Change the budget and recompute the threshold for the current table.
    pub fn set_budget(&mut self, budget: u64) {
        self.budget = budget;
        self.recompute_threshold();
    }

    fn slot(&self, id: ObjectId) -> Option<usize> {
        usize::try_from(id.0).ok().filter(|&i| i < self.sizes.len())
    }

    /// Decide whether `id` with `size` bytes must stay resident.
    ///
    /// Ids outside the table never do. Below the threshold the size is
    /// recorded and `true` returned; otherwise any previous record is cleared.
    pub fn should_stay_resident(&mut self, id: ObjectId, size: u64) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        if let Some(previous) = self.sizes[slot].take() {
            self.used = self.used.saturating_sub(previous);
        }
        if size < self.threshold {
            self.sizes[slot] = Some(size);
            self.used = self.used.saturating_add(size);
            true
        } else {
            false
        }
    }

    /// Forget any record for `id`.
    pub fn on_delete(&mut self, id: ObjectId) {
        if let Some(size) = self.slot(id).and_then(|slot| self.sizes[slot].take()) {
            self.used = self.used.saturating_sub(size);
        }
    }
}
