//! Collector statistics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::phase_times::PhaseSummary;

/// Pauses kept in the history
const HISTORY_LEN: usize = 32;

/// Outcome of one young pause
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PauseRecord {
    /// Pause number, starting at 1
    pub id: u64,
    /// What triggered the pause
    pub cause: &'static str,
    /// Whether the pause started a concurrent marking cycle
    pub concurrent_start: bool,
    /// Wall time of the pause
    pub duration_ms: f64,
    /// Young regions in the collection set
    pub young_regions: usize,
    /// Old regions evacuated with the initial collection set
    pub old_regions: usize,
    /// Optional regions evacuated by later increments
    pub optional_evacuated: usize,
    /// Optional regions left for a later pause
    pub optional_abandoned: usize,
    /// Survivor regions after the pause
    pub survivor_regions: usize,
    /// Bytes copied to survivor regions
    pub copied_bytes: usize,
    /// Bytes promoted to old regions
    pub promoted_bytes: usize,
    /// Regions with objects left in place
    pub evac_failed_regions: usize,
    /// Failed regions that were pinned
    pub evac_failed_pinned: usize,
    /// Failed regions that ran out of destination space
    pub evac_failed_alloc: usize,
    /// Humongous objects reclaimed
    pub humongous_reclaimed: usize,
    /// Regions returned to the free list
    pub regions_freed: usize,
    /// Heap usage before the pause
    pub used_before: usize,
    /// Heap usage after the pause
    pub used_after: usize,
    /// Committed bytes after the pause
    pub committed_bytes: usize,
    /// Per-phase timing
    pub phases: Vec<PhaseSummary>,
}

/// Point-in-time view of `GcStats`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GcStatsSnapshot {
    /// Young pauses run
    pub collections: u64,
    /// Pauses that had at least one evacuation failure
    pub evacuation_failures: u64,
    /// Pauses that started concurrent marking
    pub concurrent_starts: u64,
    /// Total pause time in milliseconds
    pub total_pause_ms: f64,
    /// Longest pause in milliseconds
    pub max_pause_ms: f64,
    /// Bytes copied to survivor regions over all pauses
    pub copied_bytes: u64,
    /// Bytes promoted over all pauses
    pub promoted_bytes: u64,
    /// Humongous objects reclaimed eagerly
    pub humongous_reclaimed: u64,
    /// Humongous objects allocated
    pub humongous_allocated: u64,
    /// Allocation requests that failed with out-of-memory
    pub allocation_failures: u64,
    /// Regions uncommitted by the service thread
    pub regions_uncommitted: u64,
    /// Old collection set candidates at the last pause
    pub candidates: usize,
    /// Reclaimable bytes in those candidates
    pub candidates_reclaimable_bytes: usize,
}

/// Lifetime statistics of a heap
#[derive(Default)]
pub struct GcStats {
    collections: AtomicU64,
    evacuation_failures: AtomicU64,
    concurrent_starts: AtomicU64,
    total_pause_nanos: AtomicU64,
    max_pause_nanos: AtomicU64,
    copied_bytes: AtomicU64,
    promoted_bytes: AtomicU64,
    humongous_reclaimed: AtomicU64,
    humongous_allocated: AtomicU64,
    allocation_failures: AtomicU64,
    regions_uncommitted: AtomicU64,
    candidates: AtomicUsize,
    candidates_reclaimable: AtomicUsize,
    history: Mutex<VecDeque<PauseRecord>>,
}

impl GcStats {
    /// Empty statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Account a finished pause
    pub fn record_pause(&self, record: &PauseRecord) {
        let nanos = (record.duration_ms * 1e6) as u64;
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.total_pause_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.max_pause_nanos.fetch_max(nanos, Ordering::Relaxed);
        self.copied_bytes
            .fetch_add(record.copied_bytes as u64, Ordering::Relaxed);
        self.promoted_bytes
            .fetch_add(record.promoted_bytes as u64, Ordering::Relaxed);
        self.humongous_reclaimed
            .fetch_add(record.humongous_reclaimed as u64, Ordering::Relaxed);
        if record.evac_failed_regions > 0 {
            self.evacuation_failures.fetch_add(1, Ordering::Relaxed);
        }
        if record.concurrent_start {
            self.concurrent_starts.fetch_add(1, Ordering::Relaxed);
        }
        let mut history = self.history.lock();
        if history.len() == HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(record.clone());
    }

    pub(crate) fn record_candidates(&self, count: usize, reclaimable_bytes: usize) {
        self.candidates.store(count, Ordering::Relaxed);
        self.candidates_reclaimable
            .store(reclaimable_bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_humongous_allocation(&self) {
        self.humongous_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_allocation_failure(&self) {
        self.allocation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_uncommit(&self, regions: usize) {
        self.regions_uncommitted
            .fetch_add(regions as u64, Ordering::Relaxed);
    }

    /// Most recent pauses, oldest first
    pub fn history(&self) -> Vec<PauseRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// The last pause, if any
    pub fn last_pause(&self) -> Option<PauseRecord> {
        self.history.lock().back().cloned()
    }

    /// Current counters
    pub fn snapshot(&self) -> GcStatsSnapshot {
        GcStatsSnapshot {
            collections: self.collections.load(Ordering::Relaxed),
            evacuation_failures: self.evacuation_failures.load(Ordering::Relaxed),
            concurrent_starts: self.concurrent_starts.load(Ordering::Relaxed),
            total_pause_ms: self.total_pause_nanos.load(Ordering::Relaxed) as f64 / 1e6,
            max_pause_ms: self.max_pause_nanos.load(Ordering::Relaxed) as f64 / 1e6,
            copied_bytes: self.copied_bytes.load(Ordering::Relaxed),
            promoted_bytes: self.promoted_bytes.load(Ordering::Relaxed),
            humongous_reclaimed: self.humongous_reclaimed.load(Ordering::Relaxed),
            humongous_allocated: self.humongous_allocated.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
            regions_uncommitted: self.regions_uncommitted.load(Ordering::Relaxed),
            candidates: self.candidates.load(Ordering::Relaxed),
            candidates_reclaimable_bytes: self.candidates_reclaimable.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, duration_ms: f64, failed: usize) -> PauseRecord {
        PauseRecord {
            id,
            cause: "test",
            concurrent_start: false,
            duration_ms,
            young_regions: 1,
            old_regions: 0,
            optional_evacuated: 0,
            optional_abandoned: 0,
            survivor_regions: 0,
            copied_bytes: 100,
            promoted_bytes: 10,
            evac_failed_regions: failed,
            evac_failed_pinned: 0,
            evac_failed_alloc: failed,
            humongous_reclaimed: 0,
            regions_freed: 1,
            used_before: 0,
            used_after: 0,
            committed_bytes: 0,
            phases: Vec::new(),
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let stats = GcStats::new();
        for id in 1..=(HISTORY_LEN as u64 + 5) {
            stats.record_pause(&record(id, 1.0, 0));
        }
        let history = stats.history();
        assert_eq!(history.len(), HISTORY_LEN);
        assert_eq!(history[0].id, 6);
        assert_eq!(stats.last_pause().map(|r| r.id), Some(HISTORY_LEN as u64 + 5));
    }

    #[test]
    fn test_snapshot_totals() {
        let stats = GcStats::new();
        stats.record_pause(&record(1, 2.0, 0));
        stats.record_pause(&record(2, 3.0, 2));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.collections, 2);
        assert_eq!(snapshot.evacuation_failures, 1);
        assert_eq!(snapshot.copied_bytes, 200);
        assert!((snapshot.max_pause_ms - 3.0).abs() < 1e-9);
        assert!((snapshot.total_pause_ms - 5.0).abs() < 1e-9);
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"collections\":2"));
    }
}
