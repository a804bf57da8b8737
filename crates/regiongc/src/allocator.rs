//! Region-level allocator for mutators and GC workers
//!
//! ## Design
//!
//! - **Mutator side**: one eden alloc region per NUMA node. TLAB refills and
//!   direct allocations bump it lock-free; the heap lock is taken only to
//!   replace an exhausted region.
//! - **GC side**: one survivor alloc region per node and one old alloc
//!   region. Workers normally allocate through their PLABs; refills come
//!   here. On exhaustion a narrow lock is held just long enough to replace
//!   the region or to latch the destination as full for the rest of the pause.
//! - **Retained old region**: the old region in use at the end of a pause is
//!   remembered and reused by the next pause if it still has room.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::address::Address;
use crate::alloc_region::{AllocRegion, AllocRegionKind};
use crate::config::CARD_WORDS;
use crate::heap::Heap;
use crate::region::RegionAttr;

/// Destination of an evacuated object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocDest {
    /// Survivor space
    Young = 0,
    /// Old generation
    Old = 1,
}

impl AllocDest {
    /// Both destinations
    pub const ALL: [AllocDest; 2] = [AllocDest::Young, AllocDest::Old];

    /// Array index
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Mutator and GC alloc regions
pub struct Allocator {
    mutator_regions: Box<[AllocRegion]>,
    survivor_regions: Box<[AllocRegion]>,
    old_region: AllocRegion,
    retained_old_region: Mutex<Option<u32>>,
    survivor_is_full: AtomicBool,
    old_is_full: AtomicBool,
    gc_alloc_lock: Mutex<()>,
}

impl Allocator {
    /// Allocator for `num_nodes` NUMA nodes
    pub fn new(num_nodes: u32) -> Self {
        Self {
            mutator_regions: (0..num_nodes)
                .map(|n| AllocRegion::new(AllocRegionKind::Mutator, n))
                .collect(),
            survivor_regions: (0..num_nodes)
                .map(|n| AllocRegion::new(AllocRegionKind::Survivor, n))
                .collect(),
            old_region: AllocRegion::new(AllocRegionKind::Old, 0),
            retained_old_region: Mutex::new(None),
            survivor_is_full: AtomicBool::new(false),
            old_is_full: AtomicBool::new(false),
            gc_alloc_lock: Mutex::new(()),
        }
    }

    fn node(&self, node: u32) -> usize {
        node as usize % self.mutator_regions.len()
    }

    /// Current mutator region of `node`
    pub fn mutator_alloc_region(&self, node: u32) -> Option<u32> {
        self.mutator_regions[self.node(node)].get()
    }

    /// Lock-free mutator allocation of `min..=desired` words
    pub fn attempt_allocation(
        &self,
        heap: &Heap,
        node: u32,
        min_words: usize,
        desired_words: usize,
    ) -> Option<(Address, usize)> {
        self.mutator_regions[self.node(node)].attempt_allocation(heap, min_words, desired_words)
    }

    /// Mutator allocation with the heap lock held; may start a new eden region
    pub fn attempt_allocation_locked(
        &self,
        heap: &Heap,
        node: u32,
        min_words: usize,
        desired_words: usize,
    ) -> Option<(Address, usize)> {
        self.mutator_regions[self.node(node)].attempt_allocation_locked(heap, min_words, desired_words)
    }

    /// Start a new eden region past the young target; heap lock held
    pub fn attempt_allocation_force(
        &self,
        heap: &Heap,
        node: u32,
        min_words: usize,
        desired_words: usize,
    ) -> Option<(Address, usize)> {
        self.mutator_regions[self.node(node)].attempt_allocation_force(heap, min_words, desired_words)
    }

    /// Prepare the mutator regions after a pause
    pub fn init_mutator_alloc_regions(&self) {
        for region in self.mutator_regions.iter() {
            region.init();
        }
    }

    /// Retire the mutator regions before a pause so they can be collected
    pub fn release_mutator_alloc_regions(&self, heap: &Heap) {
        for region in self.mutator_regions.iter() {
            region.retire(heap, false);
        }
    }

    /// Bytes used in mutator regions and not yet accounted in the heap summary
    pub fn used_in_alloc_regions(&self, heap: &Heap) -> usize {
        self.mutator_regions
            .iter()
            .map(|r| r.used_in_alloc_region(heap))
            .sum()
    }

    /// Whether survivor space ran out during this pause
    pub fn survivor_is_full(&self) -> bool {
        self.survivor_is_full.load(Ordering::Acquire)
    }

    /// Whether old space ran out during this pause
    pub fn old_is_full(&self) -> bool {
        self.old_is_full.load(Ordering::Acquire)
    }

    /// Set up GC alloc regions at pause start.
    ///
    /// Returns bytes already used in a reused retained old region.
    pub fn init_gc_alloc_regions(&self, heap: &Heap) -> usize {
        self.survivor_is_full.store(false, Ordering::Release);
        self.old_is_full.store(false, Ordering::Release);
        for region in self.survivor_regions.iter() {
            region.init();
        }
        self.old_region.init();
        self.reuse_retained_old_region(heap)
    }

    fn reuse_retained_old_region(&self, heap: &Heap) -> usize {
        let Some(index) = self.retained_old_region.lock().take() else {
            return 0;
        };
        let region = heap.region(index);
        // The retained region may have been collected, freed or reused since.
        let usable = region.is_old()
            && heap.region_attr(index) == RegionAttr::NotInCset
            && region.top() != region.end()
            && !region.is_empty();
        if !usable {
            return 0;
        }
        heap.old_set_remove(index);
        self.old_region.set(heap, index);
        tracing::trace!(target: "regiongc::region", region = index, "reuse retained old region");
        region.used_bytes()
    }

    /// Retire the GC alloc regions at pause end, retaining the old region
    pub fn release_gc_alloc_regions(&self, heap: &Heap) {
        for region in self.survivor_regions.iter() {
            region.retire(heap, false);
        }
        if let Some(index) = self.old_region.get() {
            self.align_old_region_to_card(heap, index);
        }
        *self.retained_old_region.lock() = self.old_region.retire(heap, false);
    }

    /// Pad the old region's top to a card boundary so the next pause never
    /// scans a card that also receives new copies.
    fn align_old_region_to_card(&self, heap: &Heap, index: u32) {
        let region = heap.region(index);
        let offset = region.top().words_from(heap.geometry().base) % CARD_WORDS;
        if offset == 0 {
            return;
        }
        let words = (CARD_WORDS - offset).min(region.free_words());
        if words == 0 {
            return;
        }
        if let Some((addr, got)) = region.par_allocate(words, words) {
            heap.fill_with_dummy_object(addr, got);
        }
    }

    /// Forget GC alloc regions without reusing them
    pub fn abandon_gc_alloc_regions(&self) {
        debug_assert!(self.survivor_regions.iter().all(|r| r.get().is_none()));
        debug_assert!(self.old_region.get().is_none());
        *self.retained_old_region.lock() = None;
    }

    /// Survivor regions taken during this pause
    pub fn survivor_regions_used(&self) -> usize {
        self.survivor_regions.iter().map(|r| r.count()).sum()
    }

    /// GC-side allocation for a PLAB refill or direct copy
    pub fn par_allocate_during_gc(
        &self,
        heap: &Heap,
        dest: AllocDest,
        min_words: usize,
        desired_words: usize,
        node: u32,
    ) -> Option<(Address, usize)> {
        match dest {
            AllocDest::Young => self.survivor_attempt_allocation(heap, min_words, desired_words, node),
            AllocDest::Old => self.old_attempt_allocation(heap, min_words, desired_words),
        }
    }

    fn survivor_attempt_allocation(
        &self,
        heap: &Heap,
        min_words: usize,
        desired_words: usize,
        node: u32,
    ) -> Option<(Address, usize)> {
        let region = &self.survivor_regions[self.node(node)];
        if let Some(result) = region.attempt_allocation(heap, min_words, desired_words) {
            return Some(result);
        }
        if self.survivor_is_full() {
            return None;
        }
        let _guard = self.gc_alloc_lock.lock();
        // Threads queued on the lock may find the space already used up.
        if self.survivor_is_full() {
            return None;
        }
        let result = region.attempt_allocation_locked(heap, min_words, desired_words);
        if result.is_none() {
            self.survivor_is_full.store(true, Ordering::Release);
        }
        result
    }

    fn old_attempt_allocation(
        &self,
        heap: &Heap,
        min_words: usize,
        desired_words: usize,
    ) -> Option<(Address, usize)> {
        if let Some(result) = self.old_region.attempt_allocation(heap, min_words, desired_words) {
            return Some(result);
        }
        if self.old_is_full() {
            return None;
        }
        let _guard = self.gc_alloc_lock.lock();
        if self.old_is_full() {
            return None;
        }
        let result = self
            .old_region
            .attempt_allocation_locked(heap, min_words, desired_words);
        if result.is_none() {
            self.old_is_full.store(true, Ordering::Release);
        }
        result
    }
}
