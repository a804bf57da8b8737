//! Per-worker PLAB allocator used while copying objects
//!
//! ## Design
//!
//! - One PLAB per destination and NUMA node (survivor) or per destination
//!   (old). The fast path bumps the PLAB with no synchronization.
//! - On exhaustion a new PLAB is only taken if the object fits into it and
//!   throwing away the rest of the current PLAB wastes less than
//!   `parallel_gc_buffer_waste_pct` of a buffer. Otherwise the object is
//!   allocated directly in the destination alloc region.
//! - Refills are counted down from a tolerance; when it runs out the desired
//!   size of this worker's PLAB doubles (up to the maximum) for the rest of
//!   the pause.

use crate::address::Address;
use crate::allocator::AllocDest;
use crate::heap::Heap;
use crate::plab::Plab;

struct PlabData {
    plabs: Vec<Plab>,
    direct_allocated: usize,
    num_direct_allocations: usize,
    num_plab_fills: usize,
    plab_fill_counter: usize,
    cur_desired_plab_size: usize,
}

impl PlabData {
    fn new(num_plabs: usize, plab_size: usize, tolerated_refills: usize) -> Self {
        Self {
            plabs: (0..num_plabs).map(|_| Plab::new(plab_size)).collect(),
            direct_allocated: 0,
            num_direct_allocations: 0,
            num_plab_fills: 0,
            plab_fill_counter: tolerated_refills,
            cur_desired_plab_size: plab_size,
        }
    }

    fn plab(&mut self, node: u32) -> &mut Plab {
        let len = self.plabs.len();
        &mut self.plabs[node as usize % len]
    }

    fn should_boost(&self) -> bool {
        self.plab_fill_counter == 0
    }

    fn notify_plab_refill(&mut self, tolerated_refills: usize, next_plab_size: usize) {
        self.num_plab_fills += 1;
        if self.should_boost() {
            self.plab_fill_counter = tolerated_refills;
            self.cur_desired_plab_size = next_plab_size;
        } else {
            self.plab_fill_counter -= 1;
        }
    }
}

/// Counters of one destination for the current pause
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlabCounters {
    /// PLAB refills
    pub plab_fills: usize,
    /// Words allocated outside PLABs
    pub direct_allocated: usize,
    /// Allocations outside PLABs
    pub direct_allocations: usize,
    /// Current desired PLAB size in words
    pub desired_plab_size: usize,
}

/// PLABs of one GC worker
pub struct PlabAllocator<'h> {
    heap: &'h Heap,
    young: PlabData,
    old: PlabData,
    tolerated_refills: usize,
    buffer_waste_pct: usize,
}

impl<'h> PlabAllocator<'h> {
    /// PLABs sized for a pause with `num_workers` workers
    pub fn new(heap: &'h Heap, num_workers: usize) -> Self {
        let buffer_waste_pct = heap.config().parallel_gc_buffer_waste_pct;
        let tolerated_refills = if buffer_waste_pct == 0 {
            0
        } else {
            (100 / buffer_waste_pct).max(1) - 1
        };
        let young_size = heap.evac_stats(AllocDest::Young).desired_plab_size(num_workers);
        let old_size = heap.evac_stats(AllocDest::Old).desired_plab_size(num_workers);
        Self {
            heap,
            young: PlabData::new(heap.num_nodes() as usize, young_size, tolerated_refills),
            old: PlabData::new(1, old_size, tolerated_refills),
            tolerated_refills,
            buffer_waste_pct,
        }
    }

    fn data(&self, dest: AllocDest) -> &PlabData {
        match dest {
            AllocDest::Young => &self.young,
            AllocDest::Old => &self.old,
        }
    }

    fn data_mut(&mut self, dest: AllocDest) -> &mut PlabData {
        match dest {
            AllocDest::Young => &mut self.young,
            AllocDest::Old => &mut self.old,
        }
    }

    /// Desired PLAB size for `dest`
    pub fn plab_size(&self, dest: AllocDest) -> usize {
        self.data(dest).cur_desired_plab_size
    }

    /// Counters for `dest`
    pub fn counters(&self, dest: AllocDest) -> PlabCounters {
        let data = self.data(dest);
        PlabCounters {
            plab_fills: data.num_plab_fills,
            direct_allocated: data.direct_allocated,
            direct_allocations: data.num_direct_allocations,
            desired_plab_size: data.cur_desired_plab_size,
        }
    }

    /// Bump-allocate from the current PLAB only
    #[inline]
    pub fn plab_allocate(&mut self, dest: AllocDest, word_size: usize, node: u32) -> Option<Address> {
        self.data_mut(dest).plab(node).allocate(word_size)
    }

    /// Allocate `word_size` words in `dest`, refilling or bypassing the PLAB
    pub fn allocate(&mut self, dest: AllocDest, word_size: usize, node: u32) -> Option<Address> {
        if let Some(obj) = self.plab_allocate(dest, word_size, node) {
            return Some(obj);
        }
        self.allocate_direct_or_new_plab(dest, word_size, node)
    }

    fn may_throw_away_buffer(&self, allocation_words: usize, buffer_words: usize) -> bool {
        allocation_words * 100 < buffer_words * self.buffer_waste_pct
    }

    /// Slow path: retire and refill the PLAB, or allocate the object directly
    pub fn allocate_direct_or_new_plab(
        &mut self,
        dest: AllocDest,
        word_size: usize,
        node: u32,
    ) -> Option<Address> {
        let heap = self.heap;
        let stats = heap.evac_stats(dest);
        let tolerated_refills = self.tolerated_refills;
        let plab_size = self.data(dest).cur_desired_plab_size;
        let next_plab_size = if self.data(dest).should_boost() {
            (plab_size * 2).min(stats.max_size())
        } else {
            plab_size
        };

        if word_size <= next_plab_size && self.may_throw_away_buffer(word_size, plab_size) {
            let data = self.data_mut(dest);
            let plab = data.plab(node);
            if let Some((tail, words)) = plab.retire() {
                heap.fill_with_dummy_object(tail, words);
            }
            data.notify_plab_refill(tolerated_refills, next_plab_size);
            let refill = heap
                .allocator()
                .par_allocate_during_gc(heap, dest, word_size, next_plab_size, node);
            if let Some((buf, words)) = refill {
                let plab = data.plab(node);
                plab.set_word_size(next_plab_size);
                plab.set_buf(buf, words);
                return plab.allocate(word_size);
            }
        }

        let obj = heap
            .allocator()
            .par_allocate_during_gc(heap, dest, word_size, word_size, node)
            .map(|(obj, _)| obj)?;
        let data = self.data_mut(dest);
        data.direct_allocated += word_size;
        data.num_direct_allocations += 1;
        Some(obj)
    }

    /// Give back an allocation that lost a copy race
    pub fn undo_allocation(&mut self, dest: AllocDest, obj: Address, word_size: usize, node: u32) {
        let heap = self.heap;
        if !self.data_mut(dest).plab(node).undo_allocation(obj, word_size) {
            heap.fill_with_dummy_object(obj, word_size);
        }
    }

    /// Retire all PLABs and move their counters into the heap's PLAB statistics
    pub fn flush_and_retire_stats(&mut self) {
        let heap = self.heap;
        for dest in AllocDest::ALL {
            let stats = heap.evac_stats(dest);
            let data = self.data_mut(dest);
            for plab in data.plabs.iter_mut() {
                if let Some((tail, words)) = plab.flush_and_retire_stats(stats) {
                    heap.fill_with_dummy_object(tail, words);
                }
            }
            stats.add_direct_allocated(data.direct_allocated, data.num_direct_allocations);
            stats.add_plab_fills(data.num_plab_fills);
            data.direct_allocated = 0;
            data.num_direct_allocations = 0;
            data.num_plab_fills = 0;
        }
    }
}
