//! The young pause
//!
//! ## Design
//!
//! `YoungCollector::collect` runs one stop-the-world pause as a fixed
//! sequence of steps. The caller holds the safepoint; everything the pause
//! allocates lives for the pause only and is dropped before it returns.
//!
//! 1. Wait for a root region scan, then let the policy time the pause.
//! 2. Retire mutator regions and choose the collection set.
//! 3. Pre-evacuate: scan limits, marking starts, humongous candidates.
//! 4. Evacuate the initial collection set.
//! 5. Evacuate optional increments while the pause budget allows.
//! 6. Retire the GC alloc regions.
//! 7. Post-evacuate in two batches.
//! 8. Prepare the heap for mutators: survivors, accounting, sizing.

use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::address::WORD_SIZE;
use crate::allocator::AllocDest;
use crate::batched_task::BatchedTask;
use crate::evacuate::{EvacuateRegionsTask, EvacuationRoots};
use crate::heap::Heap;
use crate::par_scan_state::ParScanThreadStateSet;
use crate::phase_times::GcPhase;
use crate::policy::PauseSample;
use crate::post_evacuate::{FreeCsetResult, PostEvacuatePhase1Task, PostEvacuatePhase2Task};
use crate::pre_evacuate::PreEvacuateTask;
use crate::stats::PauseRecord;

/// Why a pause was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcCause {
    /// A mutator allocation could not be satisfied
    AllocationFailure,
    /// A humongous allocation could not be satisfied
    HumongousAllocation,
    /// Requested through `Mutator::collect`
    Explicit,
}

impl GcCause {
    /// Display name
    pub fn name(self) -> &'static str {
        match self {
            GcCause::AllocationFailure => "Allocation Failure",
            GcCause::HumongousAllocation => "Humongous Allocation",
            GcCause::Explicit => "Explicit",
        }
    }
}

/// Flags the heap as collecting for the lifetime of the guard
struct GcActiveMark<'h> {
    heap: &'h Heap,
}

impl<'h> GcActiveMark<'h> {
    fn new(heap: &'h Heap) -> Self {
        let was_active = heap.gc_active.swap(true, Ordering::AcqRel);
        assert!(!was_active, "nested young pause");
        Self { heap }
    }
}

impl Drop for GcActiveMark<'_> {
    fn drop(&mut self) {
        self.heap.gc_active.store(false, Ordering::Release);
    }
}

/// One young pause
pub struct YoungCollector<'h> {
    heap: &'h Heap,
    cause: GcCause,
    concurrent_start: bool,
    start: Instant,
}

impl<'h> YoungCollector<'h> {
    /// Pause on `heap`; the world must be stopped
    pub fn new(heap: &'h Heap, cause: GcCause) -> Self {
        let concurrent_start = heap.initiate_conc_mark.swap(false, Ordering::AcqRel);
        Self {
            heap,
            cause,
            concurrent_start,
            start: Instant::now(),
        }
    }

    /// Whether this pause starts a concurrent marking cycle
    pub fn concurrent_start(&self) -> bool {
        self.concurrent_start
    }

    fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    fn verify(&self, id: u64, when: &'static str) {
        if let Err(err) = self.heap.verify() {
            tracing::error!(target: "regiongc::verify", pause = id, when, %err, "heap verification failed");
            panic!("heap verification failed {when} pause {id}: {err}");
        }
        tracing::debug!(target: "regiongc::verify", pause = id, when, "heap verified");
    }

    /// Run the pause
    pub fn collect(self) -> PauseRecord {
        let heap = self.heap;
        let _active = GcActiveMark::new(heap);
        let id = heap.total_collections.fetch_add(1, Ordering::AcqRel) + 1;
        let span = tracing::info_span!(target: "regiongc::gc", "young_pause", id, cause = self.cause.name());
        let _entered = span.enter();

        let config = heap.config();
        let policy = heap.policy();
        let times = heap.phase_times();

        if heap.marking().wait_until_root_region_scan_finished() {
            tracing::debug!(target: "regiongc::gc", "waited for root region scan");
        }
        policy.record_young_collection_start();
        times.reset();
        heap.concurrent_start_pause
            .store(self.concurrent_start, Ordering::Release);
        if config.verify_before_gc {
            self.verify(id, "before");
        }
        let used_before = heap.used();

        // Collection set.
        heap.allocator().release_mutator_alloc_regions(heap);
        let (cset_regions, young_regions, old_regions) = {
            let mut cset = heap.collection_set().lock();
            cset.finalize_young_part(heap);
            cset.finalize_old_part(heap, policy.max_pause_time_ms() - self.elapsed_ms());
            (cset.len(), cset.young_region_length(), cset.old_region_length())
        };

        // Pre-evacuation.
        heap.evac_failure_regions().pre_collection();
        heap.injector().arm();
        heap.allocator().init_gc_alloc_regions(heap);
        let n_workers = heap.workers().set_active_workers(cset_regions.max(1));
        let mut pre = BatchedTask::new("Pre Evacuate Collection Set", times);
        pre.add_serial_task(PreEvacuateTask::retire_tlabs(heap));
        pre.add_parallel_task(PreEvacuateTask::prepare_regions(heap, self.concurrent_start));
        let candidates: Vec<u32> = pre
            .run(heap.workers())
            .iter_mut()
            .flat_map(|task| task.take_candidates())
            .collect();
        *heap.humongous_candidates.lock() = candidates.clone();

        let tenuring_threshold = policy.tenuring_threshold(&heap.last_age_table.lock());
        let pss = ParScanThreadStateSet::new(heap, n_workers, tenuring_threshold);

        // Initial evacuation.
        let merge_start = Instant::now();
        heap.remset().merge_heap_roots(heap, true);
        times.record_time(GcPhase::MergeHeapRoots, 0, merge_start.elapsed());
        let has_optional = !heap.collection_set().lock().optional_regions().is_empty();
        let task = EvacuateRegionsTask::new(heap, &pss, EvacuationRoots::Initial, n_workers);
        heap.workers().run_task(&task, n_workers);
        let mut scanned_cards = task.scanned_cards();
        heap.remset().complete_evac_phase(has_optional);

        // Optional increments.
        let mut optional_evacuated = 0;
        loop {
            if heap.collection_set().lock().optional_regions().is_empty() {
                break;
            }
            if heap.evac_failure_regions().has_regions_alloc_failed() {
                break;
            }
            let remaining_ms = policy.max_pause_time_ms() - self.elapsed_ms();
            if remaining_ms <= 0.0 {
                break;
            }
            let budget_ms = remaining_ms * config.optional_evacuation_fraction;
            let increment = {
                let mut cset = heap.collection_set().lock();
                if cset.finalize_optional_for_evacuation(heap, budget_ms) == 0 {
                    break;
                }
                cset.increment().to_vec()
            };
            optional_evacuated += increment.len();
            tracing::debug!(
                target: "regiongc::gc",
                regions = increment.len(),
                budget_ms,
                "evacuating optional increment"
            );
            let merge_start = Instant::now();
            heap.remset().merge_heap_roots(heap, false);
            times.record_time(GcPhase::OptMergeHeapRoots, 0, merge_start.elapsed());
            let task = EvacuateRegionsTask::new(heap, &pss, EvacuationRoots::Optional(increment), n_workers);
            heap.workers().run_task(&task, n_workers);
            scanned_cards += task.scanned_cards();
            let more = !heap.collection_set().lock().optional_regions().is_empty();
            heap.remset().complete_evac_phase(more);
        }
        let (optional_abandoned, cset_bytes) = {
            let mut cset = heap.collection_set().lock();
            (cset.abandon_optional(heap), cset.bytes_before())
        };

        heap.allocator().release_gc_alloc_regions(heap);

        // Post-evacuation, first batch.
        let failures = heap.evac_failure_regions();
        let failed = failures.regions();
        let evac_failed = !failed.is_empty();
        let old_candidates = heap.collection_set().lock().candidates().to_vec();
        let mut post1 = BatchedTask::new("Post Evacuate Cleanup 1", times);
        post1.add_serial_task(PostEvacuatePhase1Task::merge_pss(&pss));
        if evac_failed {
            post1.add_serial_task(PostEvacuatePhase1Task::RecalculateUsed { heap });
        }
        post1.add_serial_task(PostEvacuatePhase1Task::SampleCandidates {
            heap,
            candidates: old_candidates,
        });
        if evac_failed {
            post1.add_parallel_task(PostEvacuatePhase1Task::remove_self_forwards(heap, &failed));
        }
        post1.add_parallel_task(PostEvacuatePhase1Task::ClearCardTable { heap });
        let totals = post1
            .run(heap.workers())
            .iter_mut()
            .find_map(|task| task.take_totals())
            .unwrap_or_default();
        drop(pss);

        // Post-evacuation, second batch.
        let cset = heap.collection_set().lock().regions().to_vec();
        let mut post2 = BatchedTask::new("Post Evacuate Cleanup 2", times);
        post2.add_serial_task(PostEvacuatePhase2Task::eagerly_reclaim_humongous(heap, candidates.clone()));
        post2.add_serial_task(PostEvacuatePhase2Task::PurgeCodeRoots { heap });
        if evac_failed {
            post2.add_parallel_task(PostEvacuatePhase2Task::restore_preserved_marks(heap, totals.preserved));
            post2.add_parallel_task(PostEvacuatePhase2Task::clear_retained_region_bitmaps(heap, failed.clone()));
        }
        post2.add_parallel_task(PostEvacuatePhase2Task::redirty_cards(heap, totals.cards, &cset, &candidates));
        post2.add_parallel_task(PostEvacuatePhase2Task::free_collection_set(heap, cset));
        let mut humongous_reclaimed = 0;
        let mut freed = FreeCsetResult::default();
        for mut task in post2.run(heap.workers()) {
            humongous_reclaimed += task.humongous_reclaimed().0;
            if let Some(result) = task.take_free_result() {
                freed = result;
            }
        }

        {
            let mut young = heap.young.lock();
            young.set.bulk_forget(young_regions);
            young.eden.clear();
        }
        policy.cset_regions_freed(freed.freed_regions);
        heap.decrease_used(freed.freed_bytes);
        heap.region_attrs().clear_all();
        heap.humongous_candidates.lock().clear();
        {
            let mut cset = heap.collection_set().lock();
            for &region in &freed.retained {
                cset.add_retained_candidate(region);
            }
        }

        // Prepare for mutators.
        for dest in AllocDest::ALL {
            heap.evac_stats(dest).adjust_desired_plab_size();
        }
        let failed_pinned = failures.num_regions_pinned();
        let failed_alloc = failures.num_regions_alloc_failed();
        failures.post_collection();
        heap.injector().disarm();
        *heap.last_age_table.lock() = totals.age_table;
        let survivor_regions = heap.transfer_survivors_to_eden();
        heap.allocator().init_mutator_alloc_regions();
        heap.add_used(heap.bytes_used_during_gc.swap(0, Ordering::AcqRel));
        heap.resize_after_young_collection();

        let copied_bytes = totals.copied_young_words * WORD_SIZE;
        let promoted_bytes = totals.copied_old_words * WORD_SIZE;
        let duration_ms = self.elapsed_ms();
        policy.record_young_collection_end(&PauseSample {
            pause_ms: duration_ms,
            cset_bytes,
            copied_bytes: copied_bytes + promoted_bytes,
            young_regions: young_regions as u32,
            old_regions: (old_regions + optional_evacuated) as u32,
            scanned_cards,
            evacuation_failed: evac_failed,
            survivor_regions: survivor_regions as u32,
        });

        let record = PauseRecord {
            id,
            cause: self.cause.name(),
            concurrent_start: self.concurrent_start,
            duration_ms,
            young_regions,
            old_regions,
            optional_evacuated,
            optional_abandoned,
            survivor_regions,
            copied_bytes,
            promoted_bytes,
            evac_failed_regions: failed.len(),
            evac_failed_pinned: failed_pinned,
            evac_failed_alloc: failed_alloc,
            humongous_reclaimed,
            regions_freed: freed.freed_regions,
            used_before,
            used_after: heap.used(),
            committed_bytes: heap.committed_bytes(),
            phases: times.summaries(),
        };
        heap.stats().record_pause(&record);
        times.log(id);
        if evac_failed {
            tracing::warn!(
                target: "regiongc::gc",
                pause = id,
                regions = failed.len(),
                pinned = failed_pinned,
                objects = totals.failed_objects,
                "evacuation failure"
            );
        }
        tracing::info!(
            target: "regiongc::gc",
            pause = id,
            cause = self.cause.name(),
            young = young_regions,
            old = old_regions + optional_evacuated,
            survivors = survivor_regions,
            used_before = used_before / 1024,
            used_after = record.used_after / 1024,
            committed = record.committed_bytes / 1024,
            ms = duration_ms,
            "pause young"
        );

        if config.verify_after_gc {
            self.verify(id, "after");
        }
        if self.concurrent_start {
            heap.marking().post_concurrent_start();
            heap.concurrent_start_pause.store(false, Ordering::Release);
        }
        record
    }
}
