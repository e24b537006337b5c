//! Most-recently-used list of resident objects.
//!
//! A doubly linked list stored in a slab and addressed by index, plus a map
//! from object id to slab index. Touching, removing and evicting are O(1)
//! per object with no intrusive pointers.
//!
//! The head is the most recently touched object and is never chosen for
//! eviction, so at least one object always stays resident.

use crate::ManagedObject;
use dbuf_types::ObjectId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node<O> {
    obj: Arc<O>,
    /// Size charged against the budget when the object was last touched.
    size: u64,
    prev: usize,
    next: usize,
}

/// Which objects an eviction pass may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionMode {
    /// Skip busy objects in place (they are saved synchronously).
    SkipBusy,
    /// Take busy objects too (the write-back buffer retries them).
    TakeAll,
}

#[derive(Debug)]
pub struct MruList<O> {
    slots: Vec<Option<Node<O>>>,
    vacant: Vec<usize>,
    index: HashMap<ObjectId, usize>,
    head: usize,
    tail: usize,
    used: u64,
    budget: u64,
}

impl<O> MruList<O> {
    #[must_use]
    pub fn new(budget: u64) -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            index: HashMap::new(),
            head: NIL,
            tail: NIL,
            used: 0,
            budget,
        }
    }

    /// A budget of 0 disables the list.
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
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: ObjectId) -> bool {
        self.index.contains_key(&id)
    }

    #[must_use]
    pub fn over_budget(&self) -> bool {
        self.used > self.budget
    }
}

impl<O: ManagedObject> MruList<O> {
    /// Ids from most to least recently used.
    #[must_use]
    pub fn ids(&self) -> Vec<ObjectId> {
        let mut out = Vec::with_capacity(self.len());
        let mut cur = self.head;
        while let Some(node) = self.node(cur) {
            out.push(node.obj.id());
            cur = node.next;
        }
        out
    }

    fn node(&self, idx: usize) -> Option<&Node<O>> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Node<O>> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn unlink(&mut self, idx: usize) {
        let Some((prev, next)) = self.node(idx).map(|n| (n.prev, n.next)) else {
            return;
        };
        match self.node_mut(prev) {
            Some(p) => p.next = next,
            None => self.head = next,
        }
        match self.node_mut(next) {
            Some(n) => n.prev = prev,
            None => self.tail = prev,
        }
    }

    fn link_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(node) = self.node_mut(idx) {
            node.prev = NIL;
            node.next = old_head;
        }
        match self.node_mut(old_head) {
            Some(h) => h.prev = idx,
            None => self.tail = idx,
        }
        self.head = idx;
    }

    fn link_back(&mut self, idx: usize) {
        let old_tail = self.tail;
        if let Some(node) = self.node_mut(idx) {
            node.prev = old_tail;
            node.next = NIL;
        }
        match self.node_mut(old_tail) {
            Some(t) => t.next = idx,
            None => self.head = idx,
        }
        self.tail = idx;
    }

    fn alloc_slot(&mut self, node: Node<O>) -> usize {
        if let Some(idx) = self.vacant.pop() {
            self.slots[idx] = Some(node);
            idx
        } else {
            self.slots.push(Some(node));
            self.slots.len() - 1
        }
    }

    fn take_slot(&mut self, idx: usize) -> Option<(Arc<O>, u64)> {
        self.unlink(idx);
        let node = self.slots.get_mut(idx)?.take()?;
        self.vacant.push(idx);
        let _ = self.index.remove(&node.obj.id());
        self.used = self.used.saturating_sub(node.size);
        Some((node.obj, node.size))
    }

    /// Move `obj` to the head, inserting it if absent.
    ///
    /// The charged size is refreshed from `memory_size()` on every touch.
    /// Returns `true` if the object was newly inserted.
    pub fn touch(&mut self, obj: &Arc<O>) -> bool {
        let id = obj.id();
        let size = obj.memory_size();
        if let Some(&idx) = self.index.get(&id) {
            let mut old_size = 0;
            if let Some(node) = self.node_mut(idx) {
                old_size = node.size;
                node.size = size;
                node.obj = Arc::clone(obj);
            }
            self.used = self.used.saturating_sub(old_size).saturating_add(size);
            if self.head != idx {
                self.unlink(idx);
                self.link_front(idx);
            }
            trace!(target: "dbuf::mru", event = "touch_hit", id = id.0, size);
            return false;
        }

        let idx = self.alloc_slot(Node {
            obj: Arc::clone(obj),
            size,
            prev: NIL,
            next: NIL,
        });
        self.link_front(idx);
        self.index.insert(id, idx);
        self.used = self.used.saturating_add(size);
        trace!(
            target: "dbuf::mru",
            event = "touch_insert",
            id = id.0,
            size,
            used = self.used
        );
        true
    }

    /// Remove an object by identity.
    pub fn remove(&mut self, id: ObjectId) -> Option<(Arc<O>, u64)> {
        let idx = *self.index.get(&id)?;
        self.take_slot(idx)
    }

    /// Detach objects from the tail until usage fits the budget.
    ///
    /// Walks from least to most recently used and never takes the head. In
    /// [`EvictionMode::SkipBusy`] busy objects are left where they are.
    /// Returns the detached objects with the sizes they were charged at, in
    /// eviction order.
    pub fn evict(&mut self, mode: EvictionMode) -> Vec<(Arc<O>, u64)> {
        let mut evicted = Vec::new();
        let mut cur = self.tail;
        while self.over_budget() && cur != self.head {
            let Some((prev, busy)) = self.node(cur).map(|n| (n.prev, n.obj.is_busy())) else {
                break;
            };
            if mode == EvictionMode::SkipBusy && busy {
                trace!(target: "dbuf::mru", event = "evict_skip_busy", slot = cur);
            } else if let Some(taken) = self.take_slot(cur) {
                evicted.push(taken);
            }
            cur = prev;
        }
        if !evicted.is_empty() {
            debug!(
                target: "dbuf::mru",
                event = "evict",
                count = evicted.len(),
                used = self.used,
                budget = self.budget
            );
        }
        evicted
    }

    /// Put an object back at the least-recently-used end.
    ///
    /// Used when a synchronous eviction failed to save it. Returns `false` and
    /// does nothing if the object was touched again in the meantime.
    pub fn reinstate_tail(&mut self, obj: Arc<O>, size: u64) -> bool {
        let id = obj.id();
        if self.index.contains_key(&id) {
            return false;
        }
        let idx = self.alloc_slot(Node {
            obj,
            size,
            prev: NIL,
            next: NIL,
        });
        self.link_back(idx);
        self.index.insert(id, idx);
        self.used = self.used.saturating_add(size);
        true
    }

    /// Detach every object, most recently used first, and zero the usage.
    pub fn drain(&mut self) -> Vec<(Arc<O>, u64)> {
        let mut out = Vec::with_capacity(self.len());
        let mut cur = self.head;
        while let Some(node) = self.slots.get_mut(cur).and_then(Option::take) {
            cur = node.next;
            out.push((node.obj, node.size));
        }
        self.slots.clear();
        self.vacant.clear();
        self.index.clear();
        self.head = NIL;
        self.tail = NIL;
        self.used = 0;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemObject;
    use proptest::prelude::*;

    fn ids(list: &MruList<MemObject>) -> Vec<u64> {
        list.ids().iter().map(|id| id.0).collect()
    }

    #[test]
    fn touch_orders_most_recent_first() {
        let mut list = MruList::new(1000);
        let a = MemObject::new(1, 10);
        let b = MemObject::new(2, 10);
        let c = MemObject::new(3, 10);
        assert!(list.touch(&a));
        assert!(list.touch(&b));
        assert!(list.touch(&c));
        assert_eq!(ids(&list), vec![3, 2, 1]);

        assert!(!list.touch(&a));
        assert_eq!(ids(&list), vec![1, 3, 2]);
        assert_eq!(list.used(), 30);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn retouch_refreshes_charged_size() {
        let mut list = MruList::new(1000);
        let a = MemObject::new(1, 10);
        list.touch(&a);
        a.size.store(25, std::sync::atomic::Ordering::SeqCst);
        list.touch(&a);
        assert_eq!(list.used(), 25);
    }

    #[test]
    fn remove_by_id_unlinks_anywhere() {
        let mut list = MruList::new(1000);
        let objs: Vec<_> = (1..=4).map(|i| MemObject::new(i, 5)).collect();
        for obj in &objs {
            list.touch(obj);
        }
        let (removed, size) = list.remove(ObjectId(3)).unwrap();
        assert_eq!(removed.id, ObjectId(3));
        assert_eq!(size, 5);
        assert_eq!(ids(&list), vec![4, 2, 1]);

        list.remove(ObjectId(1)).unwrap();
        list.remove(ObjectId(4)).unwrap();
        assert_eq!(ids(&list), vec![2]);
        assert!(list.remove(ObjectId(4)).is_none());
        assert_eq!(list.used(), 5);
    }

    #[test]
    fn evict_takes_from_tail_until_within_budget() {
        let mut list = MruList::new(25);
        let objs: Vec<_> = (1..=4).map(|i| MemObject::new(i, 10)).collect();
        for obj in &objs {
            list.touch(obj);
        }
        let evicted = list.evict(EvictionMode::SkipBusy);
        let evicted_ids: Vec<u64> = evicted.iter().map(|(o, _)| o.id.0).collect();
        assert_eq!(evicted_ids, vec![1, 2]);
        assert_eq!(ids(&list), vec![4, 3]);
        assert_eq!(list.used(), 20);
    }

    #[test]
    fn evict_skips_busy_in_place() {
        let mut list = MruList::new(15);
        let objs: Vec<_> = (1..=3).map(|i| MemObject::new(i, 10)).collect();
        for obj in &objs {
            list.touch(obj);
        }
        objs[0].set_busy(true);

        let evicted = list.evict(EvictionMode::SkipBusy);
        let evicted_ids: Vec<u64> = evicted.iter().map(|(o, _)| o.id.0).collect();
        assert_eq!(evicted_ids, vec![2]);
        // Still over budget: 1 is busy and 3 is the head.
        assert_eq!(ids(&list), vec![3, 1]);
        assert!(list.over_budget());
    }

    #[test]
    fn evict_take_all_ignores_busy() {
        let mut list = MruList::new(15);
        let objs: Vec<_> = (1..=3).map(|i| MemObject::new(i, 10)).collect();
        for obj in &objs {
            list.touch(obj);
        }
        objs[0].set_busy(true);
        let evicted = list.evict(EvictionMode::TakeAll);
        assert_eq!(evicted.len(), 2);
        assert_eq!(ids(&list), vec![3]);
    }

    #[test]
    fn evict_never_takes_the_head() {
        let mut list = MruList::new(10);
        let big = MemObject::new(1, 100);
        list.touch(&big);
        assert!(list.evict(EvictionMode::TakeAll).is_empty());
        assert_eq!(list.used(), 100);
    }

    #[test]
    fn reinstate_goes_to_tail_unless_present() {
        let mut list = MruList::new(1000);
        let a = MemObject::new(1, 10);
        let b = MemObject::new(2, 10);
        list.touch(&a);
        assert!(list.reinstate_tail(Arc::clone(&b), 10));
        assert_eq!(ids(&list), vec![1, 2]);
        assert!(!list.reinstate_tail(Arc::clone(&a), 10));
        assert_eq!(list.used(), 20);
    }

    #[test]
    fn drain_empties_and_reuses_cleanly() {
        let mut list = MruList::new(1000);
        for i in 1..=3 {
            list.touch(&MemObject::new(i, 7));
        }
        let drained: Vec<u64> = list.drain().iter().map(|(o, _)| o.id.0).collect();
        assert_eq!(drained, vec![3, 2, 1]);
        assert!(list.is_empty());
        assert_eq!(list.used(), 0);

        list.touch(&MemObject::new(9, 1));
        assert_eq!(ids(&list), vec![9]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn usage_stays_within_budget_after_eviction(
            budget in 50_u64..500,
            touches in proptest::collection::vec((0_u64..20, 1_u64..50), 1..200),
        ) {
            let mut list = MruList::new(budget);
            let objs: Vec<_> = (0..20).map(|i| MemObject::new(i, 1)).collect();
            for (id, size) in touches {
                let obj = &objs[usize::try_from(id).unwrap()];
                obj.size.store(size, std::sync::atomic::Ordering::SeqCst);
                list.touch(obj);
                let _ = list.evict(EvictionMode::SkipBusy);

                let charged: u64 = list
                    .ids()
                    .iter()
                    .map(|id| objs[usize::try_from(id.0).unwrap()].memory_size())
                    .sum();
                prop_assert_eq!(charged, list.used());
                // Sizes are below the smallest budget, so the head alone fits.
                prop_assert!(list.used() <= budget);
                prop_assert_eq!(list.ids().first().copied(), Some(ObjectId(id)));
            }
        }
    }
}
