//! Shared allocation regions
//!
//! An `AllocRegion` is the region many threads bump-allocate into without a
//! lock. Replacing it (retire + new region) happens under a lock chosen by
//! the owner: the heap lock for mutator regions, the allocator's GC lock for
//! survivor and old regions.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::address::Address;
use crate::heap::Heap;

const NONE: u32 = u32::MAX;

/// Who an alloc region allocates for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocRegionKind {
    /// Eden region for mutator TLABs and objects
    Mutator,
    /// Survivor destination during a pause
    Survivor,
    /// Old destination during a pause
    Old,
}

/// Current allocation region of one kind
pub(crate) struct AllocRegion {
    kind: AllocRegionKind,
    node_index: u32,
    current: AtomicU32,
    used_bytes_before: AtomicUsize,
    count: AtomicUsize,
}

impl AllocRegion {
    pub(crate) fn new(kind: AllocRegionKind, node_index: u32) -> Self {
        Self {
            kind,
            node_index,
            current: AtomicU32::new(NONE),
            used_bytes_before: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
        }
    }

    /// Current region index
    pub(crate) fn get(&self) -> Option<u32> {
        match self.current.load(Ordering::Acquire) {
            NONE => None,
            index => Some(index),
        }
    }

    /// Regions used since `init`
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub(crate) fn init(&self) {
        debug_assert!(self.get().is_none(), "{:?} alloc region still set", self.kind);
        self.count.store(0, Ordering::Relaxed);
    }

    /// Install an existing, partially used region (a retained old region)
    pub(crate) fn set(&self, heap: &Heap, index: u32) {
        let used = heap.region(index).used_bytes();
        self.used_bytes_before.store(used, Ordering::Relaxed);
        self.current.store(index, Ordering::Release);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Lock-free allocation in the current region
    pub(crate) fn attempt_allocation(
        &self,
        heap: &Heap,
        min_words: usize,
        desired_words: usize,
    ) -> Option<(Address, usize)> {
        let index = self.get()?;
        heap.region(index).par_allocate(min_words, desired_words)
    }

    /// Allocation with the owner's lock held: retry, then replace the region.
    pub(crate) fn attempt_allocation_locked(
        &self,
        heap: &Heap,
        min_words: usize,
        desired_words: usize,
    ) -> Option<(Address, usize)> {
        // Another thread may have replaced the region while we waited for the lock.
        if let Some(result) = self.attempt_allocation(heap, min_words, desired_words) {
            return Some(result);
        }
        self.retire(heap, true);
        self.new_alloc_region_and_allocate(heap, min_words, desired_words, false)
    }

    /// Replace the region even past the young target; mutator regions only.
    pub(crate) fn attempt_allocation_force(
        &self,
        heap: &Heap,
        min_words: usize,
        desired_words: usize,
    ) -> Option<(Address, usize)> {
        debug_assert_eq!(self.kind, AllocRegionKind::Mutator);
        self.retire(heap, true);
        self.new_alloc_region_and_allocate(heap, min_words, desired_words, true)
    }

    fn new_alloc_region_and_allocate(
        &self,
        heap: &Heap,
        min_words: usize,
        desired_words: usize,
        force: bool,
    ) -> Option<(Address, usize)> {
        let index = match self.kind {
            AllocRegionKind::Mutator => heap.new_mutator_alloc_region(self.node_index, force)?,
            AllocRegionKind::Survivor => {
                heap.new_gc_alloc_region(crate::allocator::AllocDest::Young, self.node_index)?
            }
            AllocRegionKind::Old => {
                heap.new_gc_alloc_region(crate::allocator::AllocDest::Old, self.node_index)?
            }
        };
        let region = heap.region(index);
        // Allocate before publishing so lock-free allocators cannot take the space first.
        let result = region.par_allocate(min_words, desired_words);
        self.used_bytes_before.store(0, Ordering::Relaxed);
        self.current.store(index, Ordering::Release);
        self.count.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Fill the rest of `index` so concurrent lock-free allocators fail on it.
    fn fill_up_remaining_space(heap: &Heap, index: u32) -> usize {
        let region = heap.region(index);
        let mut waste = 0;
        loop {
            let free = region.free_words();
            if free == 0 {
                return waste;
            }
            if let Some((addr, words)) = region.par_allocate(free, free) {
                heap.fill_with_dummy_object(addr, words);
                waste += words;
                return waste;
            }
        }
    }

    /// Give up the current region, handing its accounting to the heap.
    ///
    /// Returns the retired region index.
    pub(crate) fn retire(&self, heap: &Heap, fill_up: bool) -> Option<u32> {
        let index = self.get()?;
        let waste = if fill_up {
            Self::fill_up_remaining_space(heap, index)
        } else {
            0
        };
        let used = heap.region(index).used_bytes();
        let allocated = used - self.used_bytes_before.load(Ordering::Relaxed);
        self.current.store(NONE, Ordering::Release);
        match self.kind {
            AllocRegionKind::Mutator => heap.retire_mutator_alloc_region(index, allocated),
            AllocRegionKind::Survivor => {
                heap.retire_gc_alloc_region(index, allocated, crate::allocator::AllocDest::Young, waste)
            }
            AllocRegionKind::Old => {
                heap.retire_gc_alloc_region(index, allocated, crate::allocator::AllocDest::Old, waste)
            }
        }
        Some(index)
    }

    /// Bytes used in the current region and not yet handed to the heap
    pub(crate) fn used_in_alloc_region(&self, heap: &Heap) -> usize {
        match self.get() {
            Some(index) => {
                heap.region(index).used_bytes() - self.used_bytes_before.load(Ordering::Relaxed)
            }
            None => 0,
        }
    }
}
