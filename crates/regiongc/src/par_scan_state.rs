//! Per-worker evacuation state
//!
//! ## Design
//!
//! - Each worker owns a `ParScanThreadState`: its task queue, PLABs, age
//!   table and the cards it found that need remembered-set entries after the
//!   pause. Nothing in it is shared, so the copy path takes no locks.
//! - Copying installs the forwarding pointer with a CAS on the mark word.
//!   The loser of a race gives its copy back to the PLAB and uses the
//!   winner's address.
//! - An object that cannot be copied is marked `EvacFailed` in place and
//!   recorded in the heap's evacuation failure bitmap; it is restored after
//!   evacuation by the post-evacuate tasks.
//! - References into optional regions are remembered per region and
//!   processed only if a later increment evacuates that region.

use crossbeam_deque::Worker;
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;

use crate::address::Address;
use crate::age_table::AgeTable;
use crate::allocator::AllocDest;
use crate::heap::Heap;
use crate::object::{MarkWord, ObjectShape};
use crate::plab_allocator::PlabAllocator;
use crate::region::RegionAttr;
use crate::storage::HeapStorage;
use crate::task_queue::{Slot, TaskQueueSet};

/// Totals of all workers, collected after evacuation
#[derive(Debug, Default)]
pub struct PssTotals {
    /// Survivor ages of objects copied to survivor space
    pub age_table: AgeTable,
    /// Cards holding references that need remembered-set entries
    pub cards: Vec<usize>,
    /// Mark words of failed objects that must be restored
    pub preserved: Vec<(Address, MarkWord)>,
    /// Words copied to survivor regions
    pub copied_young_words: usize,
    /// Words copied to old regions
    pub copied_old_words: usize,
    /// Objects left in place
    pub failed_objects: usize,
    /// Words left in place
    pub failed_words: usize,
    /// Optional-region roots dropped because their region was abandoned
    pub dropped_optional_roots: usize,
}

/// Evacuation state of one worker
pub struct ParScanThreadState<'h> {
    heap: &'h Heap,
    worker_id: usize,
    node: u32,
    queue: Worker<Slot>,
    plab_allocator: PlabAllocator<'h>,
    age_table: AgeTable,
    tenuring_threshold: u8,
    cards: Vec<usize>,
    last_card: Option<usize>,
    preserved: Vec<(Address, MarkWord)>,
    optional_roots: FxHashMap<u32, Vec<Slot>>,
    copied_young_words: usize,
    copied_old_words: usize,
    failed_objects: usize,
    failed_words: usize,
}

impl<'h> ParScanThreadState<'h> {
    fn new(heap: &'h Heap, worker_id: usize, queue: Worker<Slot>, n_workers: usize, tenuring_threshold: u8) -> Self {
        Self {
            heap,
            worker_id,
            node: worker_id as u32 % heap.num_nodes(),
            queue,
            plab_allocator: PlabAllocator::new(heap, n_workers),
            age_table: AgeTable::new(),
            tenuring_threshold,
            cards: Vec::new(),
            last_card: None,
            preserved: Vec::new(),
            optional_roots: FxHashMap::default(),
            copied_young_words: 0,
            copied_old_words: 0,
            failed_objects: 0,
            failed_words: 0,
        }
    }

    /// Worker this state belongs to
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Survivor ages recorded so far
    pub fn age_table(&self) -> &AgeTable {
        &self.age_table
    }

    /// Cards enqueued so far
    pub fn cards(&self) -> &[usize] {
        &self.cards
    }

    /// Process the reference held in `slot`
    pub fn do_slot(&mut self, slot: Slot) {
        let heap = self.heap;
        let obj = self.load(slot);
        if obj.is_null() {
            return;
        }
        let region = heap.geometry().region_index(obj);
        match heap.region_attr(region) {
            RegionAttr::Young | RegionAttr::Old => {
                let new = self.copy_or_forwardee(obj, region);
                if new != obj {
                    self.store(slot, new);
                }
                self.enqueue_card_if_tracked(slot, new);
            }
            RegionAttr::Optional => {
                self.optional_roots.entry(region).or_default().push(slot);
                self.enqueue_card_if_tracked(slot, obj);
            }
            RegionAttr::HumongousCandidate => {
                if heap.region_attrs().clear_humongous_candidate(region) {
                    tracing::trace!(target: "regiongc::gc", region, "humongous candidate is referenced");
                }
                self.enqueue_card_if_tracked(slot, obj);
            }
            RegionAttr::NotInCset | RegionAttr::NewSurvivor => self.enqueue_card_if_tracked(slot, obj),
        }
    }

    fn load(&self, slot: Slot) -> Address {
        match slot {
            Slot::Heap(addr) => self.heap.storage().load_ref(addr),
            Slot::Root(index) => self.heap.roots().get(index),
        }
    }

    fn store(&self, slot: Slot, value: Address) {
        match slot {
            Slot::Heap(addr) => self.heap.storage().store_ref(addr, value),
            Slot::Root(index) => self.heap.roots().set(index, value),
        }
    }

    /// Remember the card of `slot` if the reference it holds needs a
    /// remembered-set entry after the pause
    fn enqueue_card_if_tracked(&mut self, slot: Slot, target: Address) {
        let Slot::Heap(addr) = slot else {
            return;
        };
        let heap = self.heap;
        let geometry = heap.geometry();
        let slot_region = geometry.region_index(addr);
        if slot_region == geometry.region_index(target) {
            return;
        }
        // Young regions are always collected; failed ones become old.
        if heap.region(slot_region).is_young() && !heap.evac_failure_regions().contains(slot_region) {
            return;
        }
        let card = geometry.card_index(addr);
        if self.last_card != Some(card) {
            self.cards.push(card);
            self.last_card = Some(card);
        }
    }

    fn copy_or_forwardee(&mut self, obj: Address, region: u32) -> Address {
        match self.heap.storage().mark(obj) {
            MarkWord::Forwarded(to) => to,
            MarkWord::EvacFailed => obj,
            mark @ MarkWord::Normal { .. } => self.copy_to_survivor_space(region, obj, mark),
        }
    }

    fn copy_to_survivor_space(&mut self, region: u32, obj: Address, old_mark: MarkWord) -> Address {
        let heap = self.heap;
        let hr = heap.region(region);
        if hr.has_pinned_objects() {
            return self.handle_evacuation_failure(region, obj, old_mark, true);
        }
        if heap.injector().should_inject(region) {
            return self.handle_evacuation_failure(region, obj, old_mark, false);
        }

        let storage = heap.storage();
        let shape = storage.shape(obj);
        let words = shape.size_words;
        let mut dest = if hr.is_young() && old_mark.age() < self.tenuring_threshold {
            AllocDest::Young
        } else {
            AllocDest::Old
        };
        let new = match self.plab_allocator.allocate(dest, words, self.node) {
            Some(new) => new,
            None if dest == AllocDest::Young => {
                dest = AllocDest::Old;
                match self.plab_allocator.allocate(dest, words, self.node) {
                    Some(new) => new,
                    None => return self.handle_evacuation_failure(region, obj, old_mark, false),
                }
            }
            None => return self.handle_evacuation_failure(region, obj, old_mark, false),
        };

        storage.copy_words(obj, new, words);
        let new_mark = match dest {
            AllocDest::Young => old_mark.incr_age(),
            AllocDest::Old => old_mark,
        };
        storage.set_mark(new, new_mark);

        match storage.cas_mark(obj, old_mark, MarkWord::Forwarded(new)) {
            Ok(()) => {
                match dest {
                    AllocDest::Young => {
                        self.age_table.add(new_mark.age(), words);
                        self.copied_young_words += words;
                    }
                    AllocDest::Old => {
                        heap.bot().update_for_block(new, new.offset(words));
                        self.copied_old_words += words;
                    }
                }
                self.push_contents(new, shape);
                new
            }
            Err(winner) => {
                self.plab_allocator.undo_allocation(dest, new, words, self.node);
                match winner {
                    MarkWord::Forwarded(to) => to,
                    MarkWord::EvacFailed => obj,
                    MarkWord::Normal { .. } => self.copy_or_forwardee(obj, region),
                }
            }
        }
    }

    fn handle_evacuation_failure(&mut self, region: u32, obj: Address, old_mark: MarkWord, pinned: bool) -> Address {
        let heap = self.heap;
        let storage = heap.storage();
        match storage.cas_mark(obj, old_mark, MarkWord::EvacFailed) {
            Ok(()) => {}
            Err(MarkWord::Forwarded(to)) => return to,
            Err(MarkWord::EvacFailed) => return obj,
            Err(MarkWord::Normal { .. }) => return self.copy_or_forwardee(obj, region),
        }
        if heap.evac_failure_regions().record(region, pinned) {
            tracing::debug!(
                target: "regiongc::gc",
                region,
                worker = self.worker_id,
                pinned,
                "evacuation failed"
            );
        }
        heap.evac_failure_bitmap()
            .par_set(obj.words_from(heap.geometry().base));
        if old_mark.must_be_preserved() {
            self.preserved.push((obj, old_mark));
        }
        if heap.in_concurrent_start() {
            heap.marking().mark_in_bitmap(self.worker_id, obj);
        }
        let shape = storage.shape(obj);
        self.failed_objects += 1;
        self.failed_words += shape.size_words;
        self.push_contents(obj, shape);
        obj
    }

    fn push_contents(&mut self, obj: Address, shape: ObjectShape) {
        for i in 0..shape.ref_fields {
            self.queue.push(Slot::Heap(HeapStorage::ref_slot(obj, i)));
        }
    }

    /// Drain the local queue
    pub fn trim_queue(&mut self) {
        while let Some(slot) = self.queue.pop() {
            self.do_slot(slot);
        }
    }

    /// Steal from other workers until nothing is left to steal
    pub fn steal_and_trim_queue(&mut self, queues: &TaskQueueSet) {
        while let Some(slot) = queues.steal(self.worker_id) {
            self.do_slot(slot);
            self.trim_queue();
        }
    }

    /// Take the references recorded into optional region `region`
    pub fn take_optional_roots(&mut self, region: u32) -> Vec<Slot> {
        self.optional_roots.remove(&region).unwrap_or_default()
    }

    /// Retire PLABs and move everything collected into `totals`
    pub fn flush(&mut self, totals: &mut PssTotals) {
        self.plab_allocator.flush_and_retire_stats();
        totals.age_table.merge(&self.age_table);
        totals.cards.append(&mut self.cards);
        totals.preserved.append(&mut self.preserved);
        totals.copied_young_words += self.copied_young_words;
        totals.copied_old_words += self.copied_old_words;
        totals.failed_objects += self.failed_objects;
        totals.failed_words += self.failed_words;
        totals.dropped_optional_roots += self.optional_roots.values().map(Vec::len).sum::<usize>();
        self.optional_roots.clear();
        self.age_table.clear();
        self.last_card = None;
        self.copied_young_words = 0;
        self.copied_old_words = 0;
        self.failed_objects = 0;
        self.failed_words = 0;
    }
}

/// Evacuation states of all workers of a pause
pub struct ParScanThreadStateSet<'h> {
    queues: TaskQueueSet,
    states: Vec<Mutex<ParScanThreadState<'h>>>,
}

impl<'h> ParScanThreadStateSet<'h> {
    /// States for `n_workers` workers promoting at `tenuring_threshold`
    pub fn new(heap: &'h Heap, n_workers: usize, tenuring_threshold: u8) -> Self {
        let n_workers = n_workers.max(1);
        let (queues, workers) = TaskQueueSet::new(n_workers);
        let states = workers
            .into_iter()
            .enumerate()
            .map(|(id, queue)| Mutex::new(ParScanThreadState::new(heap, id, queue, n_workers, tenuring_threshold)))
            .collect();
        Self { queues, states }
    }

    /// State of worker `worker_id`
    pub fn state(&self, worker_id: usize) -> MutexGuard<'_, ParScanThreadState<'h>> {
        self.states[worker_id].lock()
    }

    /// Stealing side of the workers' queues
    pub fn queues(&self) -> &TaskQueueSet {
        &self.queues
    }

    /// Number of workers
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether there are no workers
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Flush every worker into one total
    pub fn flush(&self) -> PssTotals {
        let mut totals = PssTotals::default();
        for state in &self.states {
            state.lock().flush(&mut totals);
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::object::ObjectShape;
    use std::sync::Arc;

    fn heap() -> Arc<Heap> {
        Heap::builder(GcConfig {
            region_size_bytes: 64 * 1024,
            initial_heap_bytes: 1024 * 1024,
            max_heap_bytes: 1024 * 1024,
            parallel_gc_threads: 1,
            ..Default::default()
        })
        .service_thread(false)
        .build()
        .unwrap()
    }

    /// Allocate an object in a fresh eden region and mark that region as
    /// collection set member, like a pause would.
    fn object_in_cset(heap: &Heap, shape: ObjectShape) -> (u32, Address) {
        let region = heap.new_mutator_alloc_region(0, false).unwrap();
        let (obj, _) = heap.region(region).par_allocate(shape.size_words, shape.size_words).unwrap();
        heap.init_object(obj, shape).unwrap();
        heap.region_attrs().set(region, RegionAttr::Young);
        (region, obj)
    }

    #[test]
    fn test_copy_installs_forwarding_and_updates_root() {
        let heap = heap();
        let (_, obj) = object_in_cset(&heap, ObjectShape::instance(1, 3));
        heap.storage().store(HeapStorage::ref_slot(obj, 0).offset(1), 77);
        let root = heap.roots().register(obj);
        heap.allocator().init_gc_alloc_regions(&heap);
        let set = ParScanThreadStateSet::new(&heap, 1, 15);
        {
            let mut pss = set.state(0);
            pss.do_slot(Slot::Root(root));
            pss.trim_queue();
        }
        let new = heap.roots().get(root);
        assert_ne!(new, obj);
        assert_eq!(heap.storage().mark(obj), MarkWord::Forwarded(new));
        assert_eq!(heap.storage().mark(new).age(), 1);
        assert_eq!(heap.storage().load(HeapStorage::ref_slot(new, 0).offset(1)), 77);
        let totals = set.flush();
        assert_eq!(totals.copied_young_words, ObjectShape::instance(1, 3).size_words);
        assert_eq!(totals.age_table.words(1), totals.copied_young_words);
        heap.allocator().release_gc_alloc_regions(&heap);
        heap.roots().unregister(root);
    }

    #[test]
    fn test_pinned_region_fails_in_place() {
        let heap = heap();
        let (region, obj) = object_in_cset(&heap, ObjectShape::instance(0, 2));
        heap.region(region).increment_pinned();
        let root = heap.roots().register(obj);
        heap.evac_failure_regions().pre_collection();
        heap.allocator().init_gc_alloc_regions(&heap);
        let set = ParScanThreadStateSet::new(&heap, 1, 15);
        set.state(0).do_slot(Slot::Root(root));
        assert_eq!(heap.roots().get(root), obj);
        assert_eq!(heap.storage().mark(obj), MarkWord::EvacFailed);
        assert!(heap.evac_failure_regions().contains_pinned(region));
        assert!(heap.evac_failure_bitmap().get(obj.words_from(heap.geometry().base)));
        let totals = set.flush();
        assert_eq!(totals.failed_objects, 1);
        heap.allocator().release_gc_alloc_regions(&heap);
        heap.evac_failure_regions().post_collection();
        heap.evac_failure_bitmap().clear(obj.words_from(heap.geometry().base));
        heap.storage().set_mark(obj, MarkWord::PROTOTYPE);
        heap.region(region).decrement_pinned();
        heap.roots().unregister(root);
    }

    #[test]
    fn test_reference_into_optional_region_is_deferred() {
        let heap = heap();
        let (region, obj) = object_in_cset(&heap, ObjectShape::instance(0, 2));
        heap.region_attrs().set(region, RegionAttr::Optional);
        let root = heap.roots().register(obj);
        let set = ParScanThreadStateSet::new(&heap, 1, 15);
        let mut pss = set.state(0);
        pss.do_slot(Slot::Root(root));
        assert_eq!(heap.roots().get(root), obj);
        assert_eq!(pss.take_optional_roots(region), vec![Slot::Root(root)]);
        assert!(pss.take_optional_roots(region).is_empty());
        drop(pss);
        heap.roots().unregister(root);
    }
}
