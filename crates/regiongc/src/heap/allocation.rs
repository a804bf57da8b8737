//! Mutator allocation slow paths and collection pauses
//!
//! ## Design
//!
//! - **Escalation**: lock-free attempt in the mutator alloc region, then a
//!   locked attempt that may start a new eden region, then a young pause,
//!   then allocation at the safepoint with heap expansion. When all of that
//!   fails the request ends in `AllocError::OutOfMemory`.
//! - **Pauses as VM operations**: `do_collection_pause` stops the world and
//!   is skipped when another pause ran since the caller sampled the
//!   collection count, or when the GC locker is active. Skipped pauses are
//!   not failures; the caller retries.
//! - **GC locker**: while critical sections hold off pauses, eden may grow a
//!   little past the young target. Past that the thread stalls until the
//!   locker clears and retries; contention never fails an allocation.
//! - **Humongous objects** are placed on contiguous free regions under the
//!   heap lock, committing regions if needed. Before that the policy may
//!   request that the next pause starts concurrent marking.

use std::sync::atomic::Ordering;

use crate::address::{Address, WORD_SIZE};
use crate::error::AllocError;
use crate::region::RegionType;
use crate::stats::PauseRecord;
use crate::young_collector::{GcCause, YoungCollector};

use super::Heap;

/// An allocation that escalated past the lock-free path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocRequest {
    /// TLAB refill or an object allocated outside a TLAB
    Small {
        /// Preferred NUMA node
        node: u32,
        /// Words that must be allocated
        min_words: usize,
        /// Words wanted
        desired_words: usize,
    },
    /// Object spanning whole regions
    Humongous {
        /// Object size in words
        word_size: usize,
    },
}

impl AllocRequest {
    /// Words that must be allocated
    pub fn word_size(&self) -> usize {
        match *self {
            AllocRequest::Small { min_words, .. } => min_words,
            AllocRequest::Humongous { word_size } => word_size,
        }
    }

    fn cause(&self) -> GcCause {
        match self {
            AllocRequest::Small { .. } => GcCause::AllocationFailure,
            AllocRequest::Humongous { .. } => GcCause::HumongousAllocation,
        }
    }
}

impl Heap {
    /// Allocate for a running mutator; may run a pause.
    ///
    /// Returns the start and size in words of the allocated block.
    pub(crate) fn mem_allocate(&self, request: AllocRequest) -> Result<(Address, usize), AllocError> {
        if let AllocRequest::Humongous { word_size } = request {
            let bytes = word_size * WORD_SIZE;
            if self
                .policy
                .need_to_start_conc_mark("concurrent humongous allocation", bytes, self.used())
            {
                self.request_concurrent_start();
            }
        }
        if let Some(result) = self.attempt_allocation(request) {
            return Ok(result);
        }
        self.attempt_allocation_slow(request)
    }

    fn attempt_allocation(&self, request: AllocRequest) -> Option<(Address, usize)> {
        match request {
            AllocRequest::Small {
                node,
                min_words,
                desired_words,
            } => self
                .allocator
                .attempt_allocation(self, node, min_words, desired_words),
            AllocRequest::Humongous { .. } => None,
        }
    }

    /// Allocation with the heap lock held
    fn attempt_allocation_locked(&self, request: AllocRequest) -> Option<(Address, usize)> {
        match request {
            AllocRequest::Small {
                node,
                min_words,
                desired_words,
            } => self
                .allocator
                .attempt_allocation_locked(self, node, min_words, desired_words),
            AllocRequest::Humongous { word_size } => self
                .humongous_obj_allocate(word_size)
                .map(|addr| (addr, word_size)),
        }
    }

    /// Grow eden past the young target while the GC locker holds off pauses
    fn attempt_allocation_force(&self, request: AllocRequest) -> Option<(Address, usize)> {
        match request {
            AllocRequest::Small {
                node,
                min_words,
                desired_words,
            } => self
                .allocator
                .attempt_allocation_force(self, node, min_words, desired_words),
            AllocRequest::Humongous { .. } => None,
        }
    }

    fn attempt_allocation_slow(&self, request: AllocRequest) -> Result<(Address, usize), AllocError> {
        let mut try_count = 0usize;
        loop {
            try_count += 1;
            let gc_count_before = {
                let _heap_lock = self.heap_lock.lock();
                if let Some(result) = self.attempt_allocation_locked(request) {
                    return Ok(result);
                }
                if self.gc_locker.is_active() {
                    if let Some(result) = self.attempt_allocation_force(request) {
                        return Ok(result);
                    }
                }
                if self.gc_locker.check_active_and_set_needs_gc() {
                    None
                } else {
                    Some(self.total_collections())
                }
            };

            match gc_count_before {
                Some(gc_count_before) => {
                    let (succeeded, result) = self.do_collection_pause(request, gc_count_before, request.cause());
                    if let Some(result) = result {
                        return Ok(result);
                    }
                    if succeeded {
                        return Err(self.out_of_memory(request));
                    }
                    tracing::debug!(
                        target: "regiongc::alloc",
                        words = request.word_size(),
                        "collection skipped, retrying allocation"
                    );
                }
                None => self.stall_on_gc_locker(),
            }

            // Another thread may have made room in the meantime.
            if let Some(result) = self.attempt_allocation(request) {
                return Ok(result);
            }
            let warn_every = self.config.queued_allocation_warning_count.max(1);
            if try_count % warn_every == 0 {
                tracing::warn!(
                    target: "regiongc::alloc",
                    try_count,
                    words = request.word_size(),
                    "allocation retried many times"
                );
            }
        }
    }

    fn out_of_memory(&self, request: AllocRequest) -> AllocError {
        self.stats.record_allocation_failure();
        tracing::warn!(
            target: "regiongc::alloc",
            words = request.word_size(),
            used = self.used(),
            capacity = self.capacity_bytes(),
            "out of memory"
        );
        AllocError::OutOfMemory {
            word_size: request.word_size(),
        }
    }

    /// Wait, not running, until the last critical section ends
    fn stall_on_gc_locker(&self) {
        tracing::debug!(target: "regiongc::alloc", "stalling until GC locker clears");
        self.safepoint.leave_running();
        self.gc_locker.stall_until_clear();
        self.safepoint.enter_running();
    }

    /// Stop the world for a young pause on behalf of a running mutator, then
    /// satisfy `request` at the safepoint.
    ///
    /// Returns whether the pause ran and the allocation result. A pause is
    /// skipped if another one ran since `gc_count_before` or if the GC locker
    /// is active.
    pub fn do_collection_pause(
        &self,
        request: AllocRequest,
        gc_count_before: u64,
        cause: GcCause,
    ) -> (bool, Option<(Address, usize)>) {
        self.safepoint.leave_running();
        let _safepoint = self.safepoint.begin(true);
        if self.total_collections() != gc_count_before {
            return (false, None);
        }
        if self.gc_locker.check_active_and_set_needs_gc() {
            return (false, None);
        }
        self.run_young_pause(cause);
        (true, self.satisfy_failed_allocation(request))
    }

    /// Run a pause; the world must be stopped
    pub(crate) fn run_young_pause(&self, cause: GcCause) -> PauseRecord {
        YoungCollector::new(self, cause).collect()
    }

    /// Explicit pause requested by a running mutator
    pub(crate) fn collect_from_mutator(&self, cause: GcCause) -> Option<PauseRecord> {
        self.safepoint.leave_running();
        let _safepoint = self.safepoint.begin(true);
        self.collect_at_safepoint(cause)
    }

    /// Explicit pause requested by a thread that is not a registered mutator.
    ///
    /// Returns `None` when the GC locker is active; the pause then runs as
    /// soon as the last critical section exits.
    pub fn collect(&self) -> Option<PauseRecord> {
        let _safepoint = self.safepoint.begin(false);
        self.collect_at_safepoint(GcCause::Explicit)
    }

    fn collect_at_safepoint(&self, cause: GcCause) -> Option<PauseRecord> {
        if self.gc_locker.check_active_and_set_needs_gc() {
            tracing::debug!(target: "regiongc::gc", cause = cause.name(), "pause skipped, GC locker active");
            return None;
        }
        Some(self.run_young_pause(cause))
    }

    /// Verify the heap from a thread that is not a registered mutator
    pub fn verify_at_safepoint(&self) -> Result<(), crate::error::VerifyError> {
        let _safepoint = self.safepoint.begin(false);
        self.verify()
    }

    fn satisfy_failed_allocation(&self, request: AllocRequest) -> Option<(Address, usize)> {
        let result = {
            let _heap_lock = self.heap_lock.lock();
            self.attempt_allocation_locked(request)
        };
        result.or_else(|| self.expand_and_allocate(request))
    }

    /// Expand the heap and allocate at a safepoint, ignoring the young target
    fn expand_and_allocate(&self, request: AllocRequest) -> Option<(Address, usize)> {
        let AllocRequest::Small {
            node,
            min_words,
            desired_words,
        } = request
        else {
            // Humongous allocation already committed regions as needed.
            return None;
        };
        let expanded = self.expand(min_words * WORD_SIZE);
        let _heap_lock = self.heap_lock.lock();
        if expanded > 0 {
            if let Some(result) = self
                .allocator
                .attempt_allocation_locked(self, node, min_words, desired_words)
            {
                return Some(result);
            }
        }
        let index = self
            .manager
            .allocate_free_region(RegionType::Eden, Some(node))?;
        let region = self.region(index);
        {
            let mut young = self.young.lock();
            young.set.add(region);
            young.eden.push(index);
        }
        let result = region.par_allocate(min_words, desired_words);
        self.add_used(region.used_bytes());
        tracing::debug!(
            target: "regiongc::alloc",
            region = index,
            words = min_words,
            "forced eden region after pause"
        );
        result
    }

    /// Place a humongous object on contiguous regions; heap lock held.
    ///
    /// The object header is not written.
    pub(crate) fn humongous_obj_allocate(&self, word_size: usize) -> Option<Address> {
        let num_regions = self.geometry.regions_for_words(word_size);
        let start = match self.manager.allocate_humongous(num_regions) {
            Some(start) => start,
            None => {
                let start = self.manager.expand_and_allocate_humongous(num_regions)?;
                self.policy
                    .record_new_heap_size(self.manager.num_active_regions());
                start
            }
        };
        let obj = self.region(start).bottom();
        let obj_end = obj.offset(word_size);
        let first = self.region(start);
        first.set_starts_humongous(obj_end);
        for index in start + 1..start + num_regions {
            self.region(index).set_continues_humongous(start, obj_end);
        }
        let mut used = 0;
        {
            let mut sets = self.old_sets.lock();
            for index in start..start + num_regions {
                let region = self.region(index);
                sets.humongous.add(region);
                used += region.used_bytes();
            }
        }
        self.add_used(used);
        self.stats.record_humongous_allocation();
        tracing::trace!(
            target: "regiongc::region",
            start,
            num_regions,
            word_size,
            "FREE -> HUMS/HUMC"
        );
        Some(obj)
    }

    /// Pick the NUMA node of the next attached mutator
    pub(crate) fn next_mutator_node(&self) -> u32 {
        self.next_node.fetch_add(1, Ordering::Relaxed) % self.num_nodes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::object::ObjectShape;
    use crate::region::SetKind;
    use std::sync::Arc;

    fn heap(initial_kb: usize, max_kb: usize) -> Arc<Heap> {
        Heap::builder(GcConfig {
            region_size_bytes: 64 * 1024,
            initial_heap_bytes: initial_kb * 1024,
            max_heap_bytes: max_kb * 1024,
            parallel_gc_threads: 2,
            ..Default::default()
        })
        .service_thread(false)
        .build()
        .unwrap()
    }

    #[test]
    fn test_humongous_regions_are_contiguous() {
        let heap = heap(640, 640);
        let region_words = heap.geometry().region_words;
        let word_size = 3 * region_words + 10;
        let obj = {
            let _lock = heap.heap_lock.lock();
            heap.humongous_obj_allocate(word_size).unwrap()
        };
        heap.init_object(obj, ObjectShape::type_array(word_size - 2)).unwrap();
        let start = heap.region_containing(obj).index();
        assert!(heap.region(start).is_starts_humongous());
        for index in start + 1..start + 4 {
            let region = heap.region(index);
            assert!(region.is_continues_humongous());
            assert_eq!(region.humongous_start_region(), Some(start));
            assert_eq!(region.containing_set(), SetKind::Humongous);
        }
        assert_eq!(heap.humongous_series_len(start), 4);
        assert_eq!(heap.used(), word_size * WORD_SIZE);
        assert_eq!(heap.humongous_regions_count(), 4);
        heap.verify().unwrap();
    }

    #[test]
    fn test_humongous_allocation_commits_regions() {
        let heap = heap(128, 1024);
        let region_words = heap.geometry().region_words;
        let _lock = heap.heap_lock.lock();
        let obj = heap.humongous_obj_allocate(5 * region_words).unwrap();
        assert!(heap.region_containing(obj).is_starts_humongous());
        assert!(heap.manager().num_active_regions() >= 5);
    }

    #[test]
    fn test_humongous_allocation_fails_without_space() {
        let heap = heap(256, 256);
        let region_words = heap.geometry().region_words;
        let _lock = heap.heap_lock.lock();
        assert!(heap.humongous_obj_allocate(5 * region_words).is_none());
        assert_eq!(heap.humongous_regions_count(), 0);
    }

    #[test]
    fn test_forced_allocation_grows_eden_past_target() {
        let heap = heap(1024, 1024);
        let target = heap.policy().young_list_target_length() as usize;
        while heap.new_mutator_alloc_region(0, false).is_some() {}
        assert_eq!(heap.young.lock().set.len(), target);

        let request = AllocRequest::Small {
            node: 0,
            min_words: 8,
            desired_words: 8,
        };
        let _lock = heap.heap_lock.lock();
        assert!(heap.attempt_allocation_locked(request).is_none());
        assert!(heap.attempt_allocation_force(request).is_some());
        assert_eq!(heap.young.lock().set.len(), target + 1);

        let mut forced = 1;
        while heap.attempt_allocation_force(request).is_some() {
            forced += 1;
        }
        assert_eq!(forced, (target * 5).div_ceil(100));
    }

    #[test]
    fn test_request_word_size() {
        let small = AllocRequest::Small {
            node: 0,
            min_words: 4,
            desired_words: 100,
        };
        assert_eq!(small.word_size(), 4);
        assert_eq!(small.cause(), GcCause::AllocationFailure);
        let humongous = AllocRequest::Humongous { word_size: 9000 };
        assert_eq!(humongous.cause(), GcCause::HumongousAllocation);
    }
}
