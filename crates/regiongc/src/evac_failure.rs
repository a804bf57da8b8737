//! Regions that failed evacuation in the current pause

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::bitmap::AtomicBitmap;

/// Per-pause record of regions with at least one object left in place.
///
/// Recording is "first recorder wins": the region is appended to the list
/// exactly once no matter how many workers fail on it concurrently.
pub struct EvacFailureRegions {
    evac_failed: AtomicBitmap,
    pinned: AtomicBitmap,
    alloc_failed: AtomicBitmap,
    regions: Box<[AtomicU32]>,
    num_regions: AtomicUsize,
    num_pinned: AtomicUsize,
    num_alloc_failed: AtomicUsize,
}

impl EvacFailureRegions {
    /// Tracker for up to `max_regions` regions
    pub fn new(max_regions: u32) -> Self {
        let max = max_regions as usize;
        Self {
            evac_failed: AtomicBitmap::new(max),
            pinned: AtomicBitmap::new(max),
            alloc_failed: AtomicBitmap::new(max),
            regions: (0..max).map(|_| AtomicU32::new(0)).collect(),
            num_regions: AtomicUsize::new(0),
            num_pinned: AtomicUsize::new(0),
            num_alloc_failed: AtomicUsize::new(0),
        }
    }

    /// Reset for a new pause
    pub fn pre_collection(&self) {
        debug_assert_eq!(self.num_regions_evac_failed(), 0, "post_collection not called");
        self.num_regions.store(0, Ordering::Relaxed);
        self.num_pinned.store(0, Ordering::Relaxed);
        self.num_alloc_failed.store(0, Ordering::Relaxed);
    }

    /// Clear all recorded regions at the end of a pause
    pub fn post_collection(&self) {
        for index in self.regions() {
            self.evac_failed.clear(index as usize);
            self.pinned.clear(index as usize);
            self.alloc_failed.clear(index as usize);
        }
        self.num_regions.store(0, Ordering::Relaxed);
        self.num_pinned.store(0, Ordering::Relaxed);
        self.num_alloc_failed.store(0, Ordering::Relaxed);
    }

    /// Record a failure in `region`; returns whether this was the first one
    pub fn record(&self, region: u32, cause_pinned: bool) -> bool {
        let index = region as usize;
        let first = self.evac_failed.par_set(index);
        if first {
            let slot = self.num_regions.fetch_add(1, Ordering::AcqRel);
            self.regions[slot].store(region, Ordering::Release);
        }
        if cause_pinned {
            if self.pinned.par_set(index) {
                self.num_pinned.fetch_add(1, Ordering::Relaxed);
            }
        } else if self.alloc_failed.par_set(index) {
            self.num_alloc_failed.fetch_add(1, Ordering::Relaxed);
        }
        first
    }

    /// Whether `region` failed evacuation in this pause
    #[inline]
    pub fn contains(&self, region: u32) -> bool {
        self.evac_failed.get(region as usize)
    }

    /// Whether `region` failed because it was pinned
    pub fn contains_pinned(&self, region: u32) -> bool {
        self.pinned.get(region as usize)
    }

    /// Whether `region` failed because no destination space was left
    pub fn contains_alloc_failed(&self, region: u32) -> bool {
        self.alloc_failed.get(region as usize)
    }

    /// Number of regions that failed
    pub fn num_regions_evac_failed(&self) -> usize {
        self.num_regions.load(Ordering::Acquire)
    }

    /// Regions that failed with a pinned cause
    pub fn num_regions_pinned(&self) -> usize {
        self.num_pinned.load(Ordering::Relaxed)
    }

    /// Regions that failed for lack of destination space
    pub fn num_regions_alloc_failed(&self) -> usize {
        self.num_alloc_failed.load(Ordering::Relaxed)
    }

    /// Whether any region failed
    pub fn has_regions_evac_failed(&self) -> bool {
        self.num_regions_evac_failed() > 0
    }

    /// Whether any region failed for lack of space
    pub fn has_regions_alloc_failed(&self) -> bool {
        self.num_regions_alloc_failed() > 0
    }

    /// Failed regions in recording order
    pub fn regions(&self) -> Vec<u32> {
        let n = self.num_regions_evac_failed();
        self.regions[..n]
            .iter()
            .map(|r| r.load(Ordering::Acquire))
            .collect()
    }
}

/// Test hook forcing evacuation failures.
///
/// Regions are armed ahead of time and take effect at the start of the next
/// pause; every copy out of an active region then fails as if no space was
/// left. The injector disarms itself at the end of the pause.
pub struct EvacFailureInjector {
    pending: AtomicBitmap,
    active: AtomicBitmap,
    pending_all: AtomicBool,
    all: AtomicBool,
    armed: AtomicBool,
}

impl EvacFailureInjector {
    /// Injector for up to `max_regions` regions, disarmed
    pub fn new(max_regions: u32) -> Self {
        let max = max_regions as usize;
        Self {
            pending: AtomicBitmap::new(max),
            active: AtomicBitmap::new(max),
            pending_all: AtomicBool::new(false),
            all: AtomicBool::new(false),
            armed: AtomicBool::new(false),
        }
    }

    /// Fail copies out of `regions` during the next pause
    pub fn arm_for_regions(&self, regions: &[u32]) {
        for &region in regions {
            self.pending.par_set(region as usize);
        }
    }

    /// Fail every copy during the next pause
    pub fn arm_all(&self) {
        self.pending_all.store(true, Ordering::Release);
    }

    /// Activate what was armed; called at pause start
    pub fn arm(&self) {
        let mut armed = false;
        for index in 0..self.pending.len() {
            if self.pending.get(index) {
                self.pending.clear(index);
                self.active.par_set(index);
                armed = true;
            }
        }
        let all = self.pending_all.swap(false, Ordering::AcqRel);
        self.all.store(all, Ordering::Release);
        self.armed.store(armed || all, Ordering::Release);
    }

    /// Whether a copy out of `region` must fail
    #[inline]
    pub fn should_inject(&self, region: u32) -> bool {
        self.armed.load(Ordering::Acquire)
            && (self.all.load(Ordering::Acquire) || self.active.get(region as usize))
    }

    /// Deactivate at the end of a pause
    pub fn disarm(&self) {
        if self.armed.swap(false, Ordering::AcqRel) {
            self.active.clear_range(0, self.active.len());
            self.all.store(false, Ordering::Release);
        }
    }
}
