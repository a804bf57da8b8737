//! Sub-tasks run before evacuation starts

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::batched_task::{ALMOST_NO_WORK, SubTask};
use crate::heap::Heap;
use crate::object::ObjKind;
use crate::phase_times::GcPhase;
use crate::region::RegionAttr;

/// Regions one worker is expected to prepare
const REGIONS_PER_WORKER: f64 = 64.0;

/// Pre-evacuation sub-tasks
pub enum PreEvacuateTask<'h> {
    /// Invalidate every mutator TLAB
    RetireTlabs {
        /// Heap
        heap: &'h Heap,
    },
    /// Fix scan limits, note marking starts and pick humongous candidates
    PrepareRegions {
        /// Heap
        heap: &'h Heap,
        /// Next region to claim
        claim: AtomicU32,
        /// Whether this pause starts concurrent marking
        concurrent_start: bool,
        /// Humongous candidates found
        candidates: Mutex<Vec<u32>>,
        /// Regions prepared
        prepared: AtomicUsize,
    },
}

impl<'h> PreEvacuateTask<'h> {
    /// Serial TLAB retirement
    pub fn retire_tlabs(heap: &'h Heap) -> Self {
        Self::RetireTlabs { heap }
    }

    /// Parallel region preparation
    pub fn prepare_regions(heap: &'h Heap, concurrent_start: bool) -> Self {
        Self::PrepareRegions {
            heap,
            claim: AtomicU32::new(0),
            concurrent_start,
            candidates: Mutex::new(Vec::new()),
            prepared: AtomicUsize::new(0),
        }
    }

    /// Humongous eager-reclaim candidates picked by `PrepareRegions`
    pub fn take_candidates(&mut self) -> Vec<u32> {
        match self {
            Self::PrepareRegions { candidates, .. } => std::mem::take(candidates.get_mut()),
            Self::RetireTlabs { .. } => Vec::new(),
        }
    }
}

/// Whether the humongous object starting in `region` may be reclaimed at
/// this pause if nothing references it
pub(crate) fn is_humongous_reclaim_candidate(heap: &Heap, region: u32) -> bool {
    let config = heap.config();
    if !config.eager_reclaim_humongous {
        return false;
    }
    let hr = heap.region(region);
    if !hr.is_starts_humongous() || hr.has_pinned_objects() {
        return false;
    }
    let obj = hr.bottom();
    // Objects with reference fields could hold the only reference to
    // another candidate.
    if heap.storage().shape(obj).kind != ObjKind::TypeArray {
        return false;
    }
    if heap.marking().is_obj_dead(obj, hr) {
        return false;
    }
    let remset = heap.remset();
    remset.is_complete(region) && remset.occupancy(region) <= config.eager_reclaim_remset_threshold
}

impl SubTask for PreEvacuateTask<'_> {
    fn phase(&self) -> GcPhase {
        match self {
            Self::RetireTlabs { .. } => GcPhase::RetireTlabs,
            Self::PrepareRegions { .. } => GcPhase::PrepareRegions,
        }
    }

    fn worker_cost(&self) -> f64 {
        match self {
            Self::RetireTlabs { .. } => ALMOST_NO_WORK,
            Self::PrepareRegions { heap, .. } => heap.manager().num_active_regions() as f64 / REGIONS_PER_WORKER,
        }
    }

    fn do_work(&self, _worker_id: usize) {
        match self {
            Self::RetireTlabs { heap } => {
                heap.retire_tlabs();
            }
            Self::PrepareRegions {
                heap,
                claim,
                concurrent_start,
                candidates,
                prepared,
            } => {
                let manager = heap.manager();
                let max = heap.geometry().max_regions;
                let mut found = Vec::new();
                let mut count = 0;
                loop {
                    let index = claim.fetch_add(1, Ordering::Relaxed);
                    if index >= max {
                        break;
                    }
                    if !manager.is_available(index) {
                        continue;
                    }
                    count += 1;
                    heap.remset().prepare_region_for_scan(heap, index);
                    let hr = heap.region(index);
                    if *concurrent_start && (hr.is_old() || hr.is_humongous()) {
                        hr.note_start_of_marking();
                    }
                    if is_humongous_reclaim_candidate(heap, index) {
                        heap.region_attrs().set(index, RegionAttr::HumongousCandidate);
                        found.push(index);
                    }
                }
                prepared.fetch_add(count, Ordering::Relaxed);
                heap.phase_times().add_work_items(GcPhase::PrepareRegions, count);
                if !found.is_empty() {
                    candidates.lock().append(&mut found);
                }
            }
        }
    }
}
