//! Collection set of a young pause
//!
//! ## Design
//!
//! - All young regions are always collected. Old regions come from the
//!   candidates: regions retained after an evacuation failure plus the
//!   regions concurrent marking recommends.
//! - The policy splits old candidates into an initial part, evacuated with
//!   the young regions, and optional regions. Optional regions stay in the
//!   old set and are tagged `Optional` until a later increment of the same
//!   pause takes them or the pause abandons them.
//! - `increment()` is the part whose remembered sets are merged next: the
//!   whole initial set, then each optional increment on its own.

use crate::heap::Heap;
use crate::policy::CsetCandidate;
use crate::region::{RegionAttr, SetKind};

/// Regions evacuated by the current pause
#[derive(Debug, Default)]
pub struct CollectionSet {
    regions: Vec<u32>,
    young_len: usize,
    increment_start: usize,
    optional: Vec<u32>,
    optional_evacuated: usize,
    candidates: Vec<u32>,
    bytes_before: usize,
}

impl CollectionSet {
    /// Empty collection set without candidates
    pub fn new() -> Self {
        Self::default()
    }

    /// Every region taken so far, young first
    pub fn regions(&self) -> &[u32] {
        &self.regions
    }

    /// Number of regions taken so far
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether nothing was selected
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Young regions in the set
    pub fn young_region_length(&self) -> usize {
        self.young_len
    }

    /// Old regions in the set, optional increments included
    pub fn old_region_length(&self) -> usize {
        self.regions.len() - self.young_len
    }

    /// Optional regions evacuated by later increments
    pub fn optional_evacuated(&self) -> usize {
        self.optional_evacuated
    }

    /// Optional regions not yet evacuated
    pub fn optional_regions(&self) -> &[u32] {
        &self.optional
    }

    /// Regions of the current increment
    pub fn increment(&self) -> &[u32] {
        &self.regions[self.increment_start..]
    }

    /// Old regions waiting to be collected by a later pause
    pub fn candidates(&self) -> &[u32] {
        &self.candidates
    }

    /// Used bytes of all selected regions when they were selected
    pub fn bytes_before(&self) -> usize {
        self.bytes_before
    }

    /// Remember a region that failed evacuation for a later pause
    pub fn add_retained_candidate(&mut self, region: u32) {
        if !self.candidates.contains(&region) {
            self.candidates.push(region);
        }
    }

    fn clear(&mut self) {
        self.regions.clear();
        self.young_len = 0;
        self.increment_start = 0;
        self.optional.clear();
        self.optional_evacuated = 0;
        self.bytes_before = 0;
    }

    fn add_region(&mut self, heap: &Heap, region: u32, attr: RegionAttr) {
        heap.region_attrs().set(region, attr);
        self.bytes_before += heap.region(region).used_bytes();
        self.regions.push(region);
    }

    /// Start a new collection set with every young region
    pub fn finalize_young_part(&mut self, heap: &Heap) {
        self.clear();
        let young = heap.young.lock();
        debug_assert!(young.survivors.is_empty(), "survivors not transferred to eden");
        for (i, &index) in young.eden.iter().enumerate() {
            heap.region(index).set_young_index_in_cset(Some(i as u32));
            self.add_region(heap, index, RegionAttr::Young);
        }
        self.young_len = self.regions.len();
    }

    fn is_valid_candidate(heap: &Heap, region: u32) -> bool {
        let hr = heap.region(region);
        hr.is_old()
            && hr.containing_set() == SetKind::Old
            && heap.region_attr(region) == RegionAttr::NotInCset
    }

    /// Split old candidates into initial and optional regions
    pub fn finalize_old_part(&mut self, heap: &Heap, remaining_time_ms: f64) {
        let retained = std::mem::take(&mut self.candidates);
        let mut offered = Vec::new();
        let mut seen = rustc_hash::FxHashSet::default();
        let mut kept = Vec::new();
        let marking = heap.marking().collection_set_candidates();
        let sources = retained
            .into_iter()
            .map(|r| (r, true))
            .chain(marking.into_iter().map(|r| (r, false)));
        for (region, retained) in sources {
            if !seen.insert(region) || !Self::is_valid_candidate(heap, region) {
                continue;
            }
            let hr = heap.region(region);
            if hr.has_pinned_objects() {
                kept.push(region);
                continue;
            }
            offered.push(CsetCandidate {
                region,
                live_bytes: hr.live_bytes(),
                reclaimable_bytes: hr.garbage_bytes(),
                retained,
            });
        }
        offered.sort_by(|a, b| {
            b.retained
                .cmp(&a.retained)
                .then(b.reclaimable_bytes.cmp(&a.reclaimable_bytes))
        });

        let selection = heap.policy().select_old_regions(&offered, remaining_time_ms);
        for &region in &selection.initial {
            heap.old_set_remove(region);
            self.add_region(heap, region, RegionAttr::Old);
        }
        for &region in &selection.optional {
            heap.region_attrs().set(region, RegionAttr::Optional);
            self.optional.push(region);
        }
        let selected = selection.initial.len() + selection.optional.len();
        kept.extend(offered[selected.min(offered.len())..].iter().map(|c| c.region));
        self.candidates = kept;
        self.increment_start = 0;

        tracing::debug!(
            target: "regiongc::gc",
            young = self.young_len,
            initial_old = selection.initial.len(),
            optional = self.optional.len(),
            remaining_candidates = self.candidates.len(),
            "finalized collection set"
        );
    }

    /// Move optional regions predicted to fit into `time_budget_ms` into a new
    /// increment; returns how many were taken
    pub fn finalize_optional_for_evacuation(&mut self, heap: &Heap, time_budget_ms: f64) -> usize {
        self.increment_start = self.regions.len();
        let policy = heap.policy();
        let mut predicted_ms = 0.0;
        let mut taken = 0;
        for &region in &self.optional {
            let time_ms = policy.predict_region_time_ms(heap.region(region).live_bytes(), false);
            if predicted_ms + time_ms > time_budget_ms {
                break;
            }
            predicted_ms += time_ms;
            taken += 1;
        }
        let selected: Vec<u32> = self.optional.drain(..taken).collect();
        for region in selected {
            heap.old_set_remove(region);
            self.add_region(heap, region, RegionAttr::Old);
        }
        self.optional_evacuated += taken;
        taken
    }

    /// Give up on the remaining optional regions; they stay candidates
    pub fn abandon_optional(&mut self, heap: &Heap) -> usize {
        let abandoned = std::mem::take(&mut self.optional);
        for &region in &abandoned {
            heap.region_attrs().clear(region);
            self.add_retained_candidate(region);
        }
        abandoned.len()
    }
}
