//! Parallel evacuation of a collection set increment
//!
//! Workers first process their share of the roots, then copy everything
//! reachable, stealing from each other, until the terminator agrees that all
//! queues are empty.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::heap::Heap;
use crate::par_scan_state::{ParScanThreadState, ParScanThreadStateSet};
use crate::phase_times::GcPhase;
use crate::task_queue::{Slot, TaskTerminator};
use crate::workers::WorkerTask;

/// Root slots claimed at once
const ROOT_STRIDE: usize = 32;

/// Which roots an evacuation task starts from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvacuationRoots {
    /// Mutator roots, merged cards and code roots of the initial collection set
    Initial,
    /// References recorded into the regions of an optional increment
    Optional(Vec<u32>),
}

/// Worker task evacuating one increment of the collection set
pub struct EvacuateRegionsTask<'a, 'h> {
    heap: &'h Heap,
    pss: &'a ParScanThreadStateSet<'h>,
    roots: EvacuationRoots,
    terminator: TaskTerminator,
    root_claim: AtomicUsize,
    root_capacity: usize,
    scanned_cards: AtomicUsize,
}

impl<'a, 'h> EvacuateRegionsTask<'a, 'h> {
    /// Task for `n_workers` workers
    pub fn new(heap: &'h Heap, pss: &'a ParScanThreadStateSet<'h>, roots: EvacuationRoots, n_workers: usize) -> Self {
        Self {
            heap,
            pss,
            roots,
            terminator: TaskTerminator::new(n_workers),
            root_claim: AtomicUsize::new(0),
            root_capacity: heap.roots().capacity(),
            scanned_cards: AtomicUsize::new(0),
        }
    }

    /// Cards scanned by all workers
    pub fn scanned_cards(&self) -> usize {
        self.scanned_cards.load(Ordering::Relaxed)
    }

    fn optional(&self) -> bool {
        matches!(self.roots, EvacuationRoots::Optional(_))
    }

    fn scan_ext_roots(&self, pss: &mut ParScanThreadState<'h>) {
        let roots = self.heap.roots();
        loop {
            let start = self.root_claim.fetch_add(ROOT_STRIDE, Ordering::Relaxed);
            if start >= self.root_capacity {
                break;
            }
            for index in start..(start + ROOT_STRIDE).min(self.root_capacity) {
                if !roots.get(index).is_null() {
                    pss.do_slot(Slot::Root(index));
                }
            }
            pss.trim_queue();
        }
    }

    fn scan_heap_roots(&self, pss: &mut ParScanThreadState<'h>, worker_id: usize) -> usize {
        let scanned = self
            .heap
            .remset()
            .scan_heap_roots(self.heap, worker_id, &mut |slot| pss.do_slot(Slot::Heap(slot)));
        pss.trim_queue();
        self.scanned_cards.fetch_add(scanned, Ordering::Relaxed);
        scanned
    }

    fn scan_roots(&self, pss: &mut ParScanThreadState<'h>, worker_id: usize) {
        let times = self.heap.phase_times();
        match &self.roots {
            EvacuationRoots::Initial => {
                let start = Instant::now();
                self.scan_ext_roots(pss);
                times.record_time(GcPhase::ExtRootScan, worker_id, start.elapsed());

                let start = Instant::now();
                let scanned = self.scan_heap_roots(pss, worker_id);
                times.record_time(GcPhase::ScanHeapRoots, worker_id, start.elapsed());
                times.add_work_items(GcPhase::ScanHeapRoots, scanned);

                let start = Instant::now();
                self.heap
                    .remset()
                    .scan_collection_set_code_roots(self.heap, worker_id, &mut |slot| {
                        pss.do_slot(Slot::Heap(slot))
                    });
                pss.trim_queue();
                times.record_time(GcPhase::CodeRoots, worker_id, start.elapsed());
            }
            EvacuationRoots::Optional(regions) => {
                let start = Instant::now();
                let mut processed = 0;
                for &region in regions {
                    for slot in pss.take_optional_roots(region) {
                        pss.do_slot(slot);
                        processed += 1;
                    }
                    pss.trim_queue();
                }
                let scanned = self.scan_heap_roots(pss, worker_id);
                times.record_time(GcPhase::OptScanRoots, worker_id, start.elapsed());
                times.add_work_items(GcPhase::OptScanRoots, processed + scanned);
            }
        }
    }

    fn evacuate_live_objects(&self, pss: &mut ParScanThreadState<'h>, worker_id: usize) {
        let (copy_phase, termination_phase) = if self.optional() {
            (GcPhase::OptObjCopy, GcPhase::OptTermination)
        } else {
            (GcPhase::ObjCopy, GcPhase::Termination)
        };
        let start = Instant::now();
        let mut termination = Duration::ZERO;
        let mut attempts = 0;
        loop {
            pss.trim_queue();
            pss.steal_and_trim_queue(self.pss.queues());
            let offered = Instant::now();
            attempts += 1;
            let done = self.terminator.offer_termination(self.pss.queues());
            termination += offered.elapsed();
            if done {
                break;
            }
        }
        let times = self.heap.phase_times();
        times.record_time(copy_phase, worker_id, start.elapsed().saturating_sub(termination));
        times.record_time(termination_phase, worker_id, termination);
        times.add_work_items(termination_phase, attempts);
    }
}

impl WorkerTask for EvacuateRegionsTask<'_, '_> {
    fn name(&self) -> &'static str {
        if self.optional() {
            "Evacuate Optional Regions"
        } else {
            "Evacuate Collection Set"
        }
    }

    fn work(&self, worker_id: usize) {
        let mut pss = self.pss.state(worker_id);
        self.scan_roots(&mut pss, worker_id);
        self.evacuate_live_objects(&mut pss, worker_id);
    }
}
