//! Concurrent marking interface
//!
//! The pause pipeline only needs a liveness oracle and a handful of hooks
//! from concurrent marking. `RootRegionScanGate` is the default: it knows no
//! dead objects and implements the root-region handshake with a monitor.

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;

use crate::address::Address;
use crate::region::Region;

/// Services of a concurrent marking cycle used by young pauses
pub trait ConcurrentMark: Send + Sync {
    /// Whether `obj` in `region` is known to be dead
    fn is_obj_dead(&self, obj: Address, region: &Region) -> bool;

    /// Keep `obj` live for the current marking cycle
    fn mark_in_bitmap(&self, worker_id: usize, obj: Address);

    /// A region that must be scanned as a marking root
    fn add_root_region(&self, region: u32);

    /// Block until an in-progress root region scan has finished.
    ///
    /// Returns whether the caller had to wait.
    fn wait_until_root_region_scan_finished(&self) -> bool;

    /// Old regions marking recommends for collection, best first
    fn collection_set_candidates(&self) -> Vec<u32>;

    /// A concurrent-start pause finished; root regions are complete
    fn post_concurrent_start(&self) {}
}

#[derive(Default)]
struct GateState {
    scan_in_progress: bool,
    root_regions: Vec<u32>,
    marked: FxHashSet<Address>,
    candidates: Vec<u32>,
    cycles_started: u64,
}

/// Default marking collaborator
#[derive(Default)]
pub struct RootRegionScanGate {
    state: Mutex<GateState>,
    cv: Condvar,
}

impl RootRegionScanGate {
    /// Gate with no scan in progress
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag a root region scan as running; pauses wait until it finishes
    pub fn begin_root_region_scan(&self) {
        self.state.lock().scan_in_progress = true;
    }

    /// Finish the root region scan and wake waiting pauses
    pub fn finish_root_region_scan(&self) {
        let mut state = self.state.lock();
        state.scan_in_progress = false;
        state.root_regions.clear();
        self.cv.notify_all();
    }

    /// Root regions reported so far
    pub fn root_regions(&self) -> Vec<u32> {
        self.state.lock().root_regions.clone()
    }

    /// Whether `obj` was marked by a pause
    pub fn is_marked(&self, obj: Address) -> bool {
        self.state.lock().marked.contains(&obj)
    }

    /// Suggest `region` for a future collection set
    pub fn add_candidate(&self, region: u32) {
        self.state.lock().candidates.push(region);
    }

    /// Concurrent-start pauses seen
    pub fn cycles_started(&self) -> u64 {
        self.state.lock().cycles_started
    }
}

impl ConcurrentMark for RootRegionScanGate {
    fn is_obj_dead(&self, _obj: Address, _region: &Region) -> bool {
        false
    }

    fn mark_in_bitmap(&self, _worker_id: usize, obj: Address) {
        self.state.lock().marked.insert(obj);
    }

    fn add_root_region(&self, region: u32) {
        self.state.lock().root_regions.push(region);
    }

    fn wait_until_root_region_scan_finished(&self) -> bool {
        let mut state = self.state.lock();
        let mut waited = false;
        while state.scan_in_progress {
            waited = true;
            self.cv.wait(&mut state);
        }
        waited
    }

    fn collection_set_candidates(&self) -> Vec<u32> {
        std::mem::take(&mut self.state.lock().candidates)
    }

    fn post_concurrent_start(&self) {
        self.state.lock().cycles_started += 1;
    }
}
