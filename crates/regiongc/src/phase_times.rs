//! Per-phase timing of GC pauses
//!
//! Every sub-task of a pause reports the time each worker spent in it plus
//! an optional count of work items. The collector resets the table at pause
//! start and logs a summary at the end.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;

/// A timed phase of a young pause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GcPhase {
    /// Invalidate mutator TLABs
    RetireTlabs,
    /// Per-region scan setup and humongous candidate selection
    PrepareRegions,
    /// Merge remembered sets of the initial collection set
    MergeHeapRoots,
    /// Process mutator roots
    ExtRootScan,
    /// Scan cards for references into the collection set
    ScanHeapRoots,
    /// Scan code roots
    CodeRoots,
    /// Copy objects reachable from the roots
    ObjCopy,
    /// Wait for other workers in the termination protocol
    Termination,
    /// Merge remembered sets of an optional increment
    OptMergeHeapRoots,
    /// Process roots recorded for an optional increment
    OptScanRoots,
    /// Copy objects of an optional increment
    OptObjCopy,
    /// Termination of an optional increment
    OptTermination,
    /// Merge per-worker scan state
    MergePss,
    /// Recompute heap usage after evacuation failure
    RecalculateUsed,
    /// Sample collection set candidate statistics
    SampleCandidates,
    /// Restore objects that failed evacuation
    RemoveSelfForwards,
    /// Reset card table state used for scanning
    ClearCardTable,
    /// Free humongous objects nobody references
    EagerlyReclaimHumongous,
    /// Drop stale code root entries
    PurgeCodeRoots,
    /// Restore preserved mark words
    RestorePreservedMarks,
    /// Re-record cards with references that need tracking
    RedirtyCards,
    /// Clear evacuation failure bitmaps of retained regions
    ClearRetainedRegionBitmaps,
    /// Free or retain the collection set regions
    FreeCollectionSet,
}

impl GcPhase {
    /// All phases in pipeline order
    pub const ALL: [GcPhase; 23] = [
        GcPhase::RetireTlabs,
        GcPhase::PrepareRegions,
        GcPhase::MergeHeapRoots,
        GcPhase::ExtRootScan,
        GcPhase::ScanHeapRoots,
        GcPhase::CodeRoots,
        GcPhase::ObjCopy,
        GcPhase::Termination,
        GcPhase::OptMergeHeapRoots,
        GcPhase::OptScanRoots,
        GcPhase::OptObjCopy,
        GcPhase::OptTermination,
        GcPhase::MergePss,
        GcPhase::RecalculateUsed,
        GcPhase::SampleCandidates,
        GcPhase::RemoveSelfForwards,
        GcPhase::ClearCardTable,
        GcPhase::EagerlyReclaimHumongous,
        GcPhase::PurgeCodeRoots,
        GcPhase::RestorePreservedMarks,
        GcPhase::RedirtyCards,
        GcPhase::ClearRetainedRegionBitmaps,
        GcPhase::FreeCollectionSet,
    ];

    /// Display name
    pub fn name(self) -> &'static str {
        match self {
            GcPhase::RetireTlabs => "Retire TLABs",
            GcPhase::PrepareRegions => "Prepare Regions",
            GcPhase::MergeHeapRoots => "Merge Heap Roots",
            GcPhase::ExtRootScan => "Ext Root Scanning",
            GcPhase::ScanHeapRoots => "Scan Heap Roots",
            GcPhase::CodeRoots => "Code Root Scan",
            GcPhase::ObjCopy => "Object Copy",
            GcPhase::Termination => "Termination",
            GcPhase::OptMergeHeapRoots => "Optional Merge Heap Roots",
            GcPhase::OptScanRoots => "Optional Roots",
            GcPhase::OptObjCopy => "Optional Object Copy",
            GcPhase::OptTermination => "Optional Termination",
            GcPhase::MergePss => "Merge Per-Thread State",
            GcPhase::RecalculateUsed => "Recalculate Used Memory",
            GcPhase::SampleCandidates => "Sample Collection Set Candidates",
            GcPhase::RemoveSelfForwards => "Remove Self Forwards",
            GcPhase::ClearCardTable => "Clear Logged Cards",
            GcPhase::EagerlyReclaimHumongous => "Eagerly Reclaim Humongous Objects",
            GcPhase::PurgeCodeRoots => "Purge Code Roots",
            GcPhase::RestorePreservedMarks => "Restore Preserved Marks",
            GcPhase::RedirtyCards => "Redirty Logged Cards",
            GcPhase::ClearRetainedRegionBitmaps => "Clear Retained Region Bitmaps",
            GcPhase::FreeCollectionSet => "Free Collection Set",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Aggregated timing of one phase
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PhaseSummary {
    /// Phase
    pub phase: GcPhase,
    /// Workers that reported time
    pub workers: usize,
    /// Sum over workers in milliseconds
    pub total_ms: f64,
    /// Slowest worker in milliseconds
    pub max_ms: f64,
    /// Work items processed
    pub work_items: usize,
}

/// Per-phase, per-worker timing table of the current pause
pub struct PhaseTimes {
    max_workers: usize,
    nanos: Box<[AtomicU64]>,
    reported: Box<[AtomicU64]>,
    work_items: Box<[AtomicUsize]>,
}

const UNREPORTED: u64 = u64::MAX;

impl PhaseTimes {
    /// Table for up to `max_workers` workers
    pub fn new(max_workers: usize) -> Self {
        let slots = GcPhase::ALL.len() * max_workers;
        Self {
            max_workers,
            nanos: (0..slots).map(|_| AtomicU64::new(UNREPORTED)).collect(),
            reported: (0..GcPhase::ALL.len()).map(|_| AtomicU64::new(0)).collect(),
            work_items: (0..GcPhase::ALL.len()).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// Forget the previous pause
    pub fn reset(&self) {
        for slot in self.nanos.iter() {
            slot.store(UNREPORTED, Ordering::Relaxed);
        }
        for counter in self.reported.iter() {
            counter.store(0, Ordering::Relaxed);
        }
        for counter in self.work_items.iter() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn slot(&self, phase: GcPhase, worker_id: usize) -> &AtomicU64 {
        &self.nanos[phase.index() * self.max_workers + worker_id % self.max_workers]
    }

    /// Add `elapsed` to `worker_id`'s time in `phase`
    pub fn record_time(&self, phase: GcPhase, worker_id: usize, elapsed: Duration) {
        let nanos = elapsed.as_nanos().min(u64::MAX as u128 - 1) as u64;
        let slot = self.slot(phase, worker_id);
        let mut current = slot.load(Ordering::Relaxed);
        loop {
            let new = if current == UNREPORTED { nanos } else { current + nanos };
            match slot.compare_exchange_weak(current, new, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if current == UNREPORTED {
            self.reported[phase.index()].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count `items` units of work done in `phase`
    pub fn add_work_items(&self, phase: GcPhase, items: usize) {
        self.work_items[phase.index()].fetch_add(items, Ordering::Relaxed);
    }

    /// Summary of one phase; `None` if no worker reported
    pub fn summary(&self, phase: GcPhase) -> Option<PhaseSummary> {
        let workers = self.reported[phase.index()].load(Ordering::Relaxed) as usize;
        if workers == 0 {
            return None;
        }
        let mut total = 0u64;
        let mut max = 0u64;
        for worker in 0..self.max_workers {
            let nanos = self.slot(phase, worker).load(Ordering::Relaxed);
            if nanos != UNREPORTED {
                total += nanos;
                max = max.max(nanos);
            }
        }
        Some(PhaseSummary {
            phase,
            workers,
            total_ms: total as f64 / 1e6,
            max_ms: max as f64 / 1e6,
            work_items: self.work_items[phase.index()].load(Ordering::Relaxed),
        })
    }

    /// Summaries of all phases that ran, in pipeline order
    pub fn summaries(&self) -> Vec<PhaseSummary> {
        GcPhase::ALL.iter().filter_map(|&p| self.summary(p)).collect()
    }

    /// Emit one debug event per phase that ran
    pub fn log(&self, pause_id: u64) {
        for s in self.summaries() {
            tracing::debug!(
                target: "regiongc::gc",
                pause = pause_id,
                phase = s.phase.name(),
                workers = s.workers,
                max_ms = s.max_ms,
                total_ms = s.total_ms,
                items = s.work_items,
                "phase"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_worker_accumulation() {
        let times = PhaseTimes::new(4);
        times.record_time(GcPhase::ObjCopy, 0, Duration::from_millis(2));
        times.record_time(GcPhase::ObjCopy, 0, Duration::from_millis(1));
        times.record_time(GcPhase::ObjCopy, 3, Duration::from_millis(5));
        times.add_work_items(GcPhase::ObjCopy, 10);
        let s = times.summary(GcPhase::ObjCopy).unwrap();
        assert_eq!(s.workers, 2);
        assert!((s.total_ms - 8.0).abs() < 1e-9);
        assert!((s.max_ms - 5.0).abs() < 1e-9);
        assert_eq!(s.work_items, 10);
        assert!(times.summary(GcPhase::Termination).is_none());
        times.reset();
        assert!(times.summaries().is_empty());
    }

    #[test]
    fn test_phase_list_is_complete() {
        for (i, phase) in GcPhase::ALL.iter().enumerate() {
            assert_eq!(phase.index(), i);
        }
    }
}
