//! Pause-time policy
//!
//! ## Design
//!
//! - The `Policy` trait is the source of every number the collector acts on:
//!   young length, survivor cap, tenuring threshold, old region selection,
//!   heap expansion and shrinking, and concurrent-start decisions.
//! - `AdaptivePolicy` predicts pause times from exponentially decaying
//!   averages of observed copy cost and card cost, sizes the young generation
//!   to fit the pause time goal, and grows the heap when GC overhead stays
//!   above the `gc_time_ratio` goal for several pauses.

use std::time::Instant;

use parking_lot::Mutex;

use crate::age_table::AgeTable;
use crate::config::{GcConfig, HeapGeometry};
use crate::weighted_average::DecayingAverage;

/// Old region offered for the collection set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsetCandidate {
    /// Region index
    pub region: u32,
    /// Live bytes that would be copied
    pub live_bytes: usize,
    /// Bytes freed by collecting the region
    pub reclaimable_bytes: usize,
    /// Retained after an evacuation failure
    pub retained: bool,
}

/// Old regions chosen for a pause
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OldRegionSelection {
    /// Evacuated with the young regions
    pub initial: Vec<u32>,
    /// Evacuated later in the pause if time permits
    pub optional: Vec<u32>,
}

/// What a finished young pause reports to the policy
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PauseSample {
    /// Pause duration
    pub pause_ms: f64,
    /// Bytes in collection set regions before evacuation
    pub cset_bytes: usize,
    /// Bytes copied
    pub copied_bytes: usize,
    /// Young regions collected
    pub young_regions: u32,
    /// Old regions collected
    pub old_regions: u32,
    /// Cards scanned
    pub scanned_cards: usize,
    /// Whether any region failed evacuation
    pub evacuation_failed: bool,
    /// Survivor regions allocated
    pub survivor_regions: u32,
}

/// Decisions consumed by the collector
pub trait Policy: Send + Sync {
    /// Pause time goal
    fn max_pause_time_ms(&self) -> f64;

    /// Desired number of young regions, survivors included
    fn young_list_target_length(&self) -> u32;

    /// Survivor regions a pause may allocate before promoting everything
    fn max_survivor_regions(&self) -> u32;

    /// Age at which survivors are promoted, from last pause's age table
    fn tenuring_threshold(&self, ages: &AgeTable) -> u8;

    /// Whether a mutator may start another eden region
    fn should_allocate_mutator_region(&self, young_length: u32) -> bool;

    /// Whether eden may grow past the target while the GC locker holds off a
    /// pause
    fn can_expand_young_list(&self, young_length: u32) -> bool;

    /// Split old candidates into initial and optional regions
    fn select_old_regions(&self, candidates: &[CsetCandidate], remaining_time_ms: f64) -> OldRegionSelection;

    /// Predicted time to evacuate a region with `live_bytes` live data
    fn predict_region_time_ms(&self, live_bytes: usize, young: bool) -> f64;

    /// A pause starts
    fn record_young_collection_start(&self);

    /// A pause ended
    fn record_young_collection_end(&self, sample: &PauseSample);

    /// Collection set regions were freed
    fn cset_regions_freed(&self, count: usize);

    /// Remembered set length sampled during a pause
    fn record_rs_length(&self, rs_length: usize);

    /// Background revision of the young length from a remembered set sample
    fn revise_young_list_target_length(&self, rs_length: usize);

    /// Bytes to expand the heap by after a pause
    fn young_collection_expansion_amount(&self, committed_bytes: usize) -> usize;

    /// Bytes the heap may give back
    fn shrink_amount(&self, committed_bytes: usize, used_bytes: usize) -> usize;

    /// Whether an allocation of `alloc_bytes` should start a concurrent cycle
    fn need_to_start_conc_mark(&self, source: &'static str, alloc_bytes: usize, used_bytes: usize) -> bool;

    /// The number of committed regions changed
    fn record_new_heap_size(&self, num_regions: u32);
}

/// Initiating heap occupancy, percent of the maximum heap
const IHOP_PERCENT: usize = 45;
/// Reserve kept out of the young generation, percent of committed regions
const RESERVE_PERCENT: u32 = 10;
/// Pauses above the GC time goal before the heap grows
const MIN_OVER_THRESHOLD_FOR_GROWTH: u32 = 4;
/// Eden growth allowed past the target while the GC locker is active
const GC_LOCKER_EDEN_EXPANSION_PERCENT: u32 = 5;
/// Fraction of the pause goal available for copying
const PAUSE_TARGET_FRACTION: f64 = 0.8;

struct PolicyState {
    active_regions: u32,
    young_target: u32,
    rs_length: usize,
    pause_start: Option<Instant>,
    last_pause_end: Option<Instant>,
    copy_ms_per_byte: DecayingAverage,
    card_ms: DecayingAverage,
    fixed_ms: DecayingAverage,
    survival_rate: DecayingAverage,
    over_threshold_count: u32,
    regions_freed: usize,
}

/// Default pause-time driven policy
pub struct AdaptivePolicy {
    max_pause_ms: f64,
    region_bytes: usize,
    max_regions: u32,
    initial_regions: u32,
    young_percent_min: u32,
    young_percent_max: u32,
    survivor_ratio: u32,
    target_survivor_ratio: usize,
    max_tenuring_threshold: u8,
    gc_time_ratio: u32,
    max_heap_free_ratio: usize,
    min_heap_delta_bytes: usize,
    min_old_cset_regions: usize,
    max_old_cset_regions: usize,
    state: Mutex<PolicyState>,
}

const DEFAULT_COPY_MS_PER_BYTE: f64 = 1.0 / (256.0 * 1024.0);
const DEFAULT_CARD_MS: f64 = 0.0005;
const DEFAULT_FIXED_MS: f64 = 1.0;
const DEFAULT_SURVIVAL_RATE: f64 = 0.3;
const REGION_OVERHEAD_MS: f64 = 0.02;

impl AdaptivePolicy {
    /// Policy for a heap built from `config`
    pub fn new(config: &GcConfig, geometry: &HeapGeometry) -> Self {
        let policy = Self {
            max_pause_ms: config.max_pause_time_ms,
            region_bytes: geometry.region_bytes,
            max_regions: geometry.max_regions,
            initial_regions: geometry.initial_regions,
            young_percent_min: config.young_percent_min as u32,
            young_percent_max: config.young_percent_max as u32,
            survivor_ratio: config.survivor_ratio as u32,
            target_survivor_ratio: config.target_survivor_ratio,
            max_tenuring_threshold: config.max_tenuring_threshold,
            gc_time_ratio: config.gc_time_ratio as u32,
            max_heap_free_ratio: config.max_heap_free_ratio,
            min_heap_delta_bytes: config.min_heap_delta_bytes,
            min_old_cset_regions: config.min_old_cset_regions,
            max_old_cset_regions: config.max_old_cset_regions,
            state: Mutex::new(PolicyState {
                active_regions: geometry.initial_regions,
                young_target: 1,
                rs_length: 0,
                pause_start: None,
                last_pause_end: None,
                copy_ms_per_byte: DecayingAverage::new(0.3),
                card_ms: DecayingAverage::new(0.3),
                fixed_ms: DecayingAverage::new(0.3),
                survival_rate: DecayingAverage::new(0.3),
                over_threshold_count: 0,
                regions_freed: 0,
            }),
        };
        policy.update_young_target(&mut policy.state.lock());
        policy
    }

    /// Regions freed from collection sets so far
    pub fn regions_freed(&self) -> usize {
        self.state.lock().regions_freed
    }

    fn region_time_ms(&self, state: &PolicyState, live_bytes: usize) -> f64 {
        REGION_OVERHEAD_MS
            + live_bytes as f64 * state.copy_ms_per_byte.get_or(DEFAULT_COPY_MS_PER_BYTE)
    }

    fn update_young_target(&self, state: &mut PolicyState) {
        let active = state.active_regions.max(1);
        let min = (active * self.young_percent_min).div_ceil(100).max(1);
        let reserve = (active * RESERVE_PERCENT).div_ceil(100).max(1);
        let max = (active * self.young_percent_max / 100)
            .min(active.saturating_sub(reserve))
            .max(min);

        let base_ms = state.fixed_ms.get_or(DEFAULT_FIXED_MS)
            + state.rs_length as f64 * state.card_ms.get_or(DEFAULT_CARD_MS);
        let budget_ms = self.max_pause_ms * PAUSE_TARGET_FRACTION - base_ms;
        let survival = state.survival_rate.get_or(DEFAULT_SURVIVAL_RATE);
        let per_region_ms = self.region_time_ms(state, (self.region_bytes as f64 * survival) as usize);
        let by_time = if budget_ms <= 0.0 {
            min
        } else {
            (budget_ms / per_region_ms).floor().min(u32::MAX as f64) as u32
        };
        state.young_target = by_time.clamp(min, max);
    }

    fn gc_overhead_threshold_pct(&self) -> f64 {
        100.0 / (1.0 + self.gc_time_ratio as f64)
    }
}

impl Policy for AdaptivePolicy {
    fn max_pause_time_ms(&self) -> f64 {
        self.max_pause_ms
    }

    fn young_list_target_length(&self) -> u32 {
        self.state.lock().young_target
    }

    fn max_survivor_regions(&self) -> u32 {
        self.young_list_target_length()
            .div_ceil(self.survivor_ratio.max(1))
            .max(1)
    }

    fn tenuring_threshold(&self, ages: &AgeTable) -> u8 {
        let survivor_words = self.max_survivor_regions() as usize * self.region_bytes
            / crate::address::WORD_SIZE;
        let desired = survivor_words * self.target_survivor_ratio / 100;
        ages.compute_tenuring_threshold(desired, self.max_tenuring_threshold)
    }

    fn should_allocate_mutator_region(&self, young_length: u32) -> bool {
        young_length < self.young_list_target_length()
    }

    fn can_expand_young_list(&self, young_length: u32) -> bool {
        let target = self.young_list_target_length();
        let expansion = (target * GC_LOCKER_EDEN_EXPANSION_PERCENT).div_ceil(100);
        young_length < target + expansion
    }

    fn select_old_regions(&self, candidates: &[CsetCandidate], remaining_time_ms: f64) -> OldRegionSelection {
        let state = self.state.lock();
        let mut selection = OldRegionSelection::default();
        let mut predicted_ms = 0.0;
        for candidate in candidates {
            if selection.initial.len() + selection.optional.len() >= self.max_old_cset_regions {
                break;
            }
            let time_ms = self.region_time_ms(&state, candidate.live_bytes);
            if selection.initial.len() < self.min_old_cset_regions
                || predicted_ms + time_ms <= remaining_time_ms
            {
                predicted_ms += time_ms;
                selection.initial.push(candidate.region);
            } else {
                selection.optional.push(candidate.region);
            }
        }
        selection
    }

    fn predict_region_time_ms(&self, live_bytes: usize, young: bool) -> f64 {
        let state = self.state.lock();
        let live = if young {
            (live_bytes as f64 * state.survival_rate.get_or(DEFAULT_SURVIVAL_RATE)) as usize
        } else {
            live_bytes
        };
        self.region_time_ms(&state, live)
    }

    fn record_young_collection_start(&self) {
        self.state.lock().pause_start = Some(Instant::now());
    }

    fn record_young_collection_end(&self, sample: &PauseSample) {
        let mut state = self.state.lock();
        let now = Instant::now();

        let copy_ms = (sample.pause_ms - state.fixed_ms.get_or(DEFAULT_FIXED_MS)).max(0.0);
        if sample.copied_bytes > 0 {
            state.copy_ms_per_byte.add(copy_ms / sample.copied_bytes as f64);
        }
        if sample.scanned_cards > 0 {
            state.card_ms.add(copy_ms.min(sample.pause_ms * 0.5) / sample.scanned_cards as f64);
        }
        if sample.cset_bytes > 0 {
            state
                .survival_rate
                .add((sample.copied_bytes as f64 / sample.cset_bytes as f64).min(1.0));
        }
        if sample.copied_bytes == 0 {
            state.fixed_ms.add(sample.pause_ms);
        }

        if let Some(last_end) = state.last_pause_end {
            let interval_ms = now.duration_since(last_end).as_secs_f64() * 1000.0;
            if interval_ms > 0.0 {
                let overhead_pct = sample.pause_ms * 100.0 / interval_ms;
                if overhead_pct > self.gc_overhead_threshold_pct() {
                    state.over_threshold_count += 1;
                } else {
                    state.over_threshold_count = 0;
                }
            }
        }
        state.last_pause_end = Some(now);
        state.pause_start = None;
        self.update_young_target(&mut state);
        tracing::debug!(
            target: "regiongc::gc",
            young_target = state.young_target,
            survival_rate = state.survival_rate.get_or(DEFAULT_SURVIVAL_RATE),
            over_threshold = state.over_threshold_count,
            "policy updated"
        );
    }

    fn cset_regions_freed(&self, count: usize) {
        self.state.lock().regions_freed += count;
    }

    fn record_rs_length(&self, rs_length: usize) {
        self.state.lock().rs_length = rs_length;
    }

    fn revise_young_list_target_length(&self, rs_length: usize) {
        let mut state = self.state.lock();
        state.rs_length = rs_length;
        self.update_young_target(&mut state);
    }

    fn young_collection_expansion_amount(&self, committed_bytes: usize) -> usize {
        let mut state = self.state.lock();
        if state.active_regions >= self.max_regions
            || state.over_threshold_count < MIN_OVER_THRESHOLD_FOR_GROWTH
        {
            return 0;
        }
        state.over_threshold_count = 0;
        (committed_bytes / 5).max(self.min_heap_delta_bytes)
    }

    fn shrink_amount(&self, committed_bytes: usize, used_bytes: usize) -> usize {
        let free_ratio = self.max_heap_free_ratio.min(99);
        let target = (used_bytes * 100).div_ceil(100 - free_ratio);
        let min_capacity = self.initial_regions as usize * self.region_bytes;
        let target = target.max(min_capacity);
        let excess = committed_bytes.saturating_sub(target);
        excess / self.region_bytes * self.region_bytes
    }

    fn need_to_start_conc_mark(&self, source: &'static str, alloc_bytes: usize, used_bytes: usize) -> bool {
        let threshold = self.max_regions as usize * self.region_bytes * IHOP_PERCENT / 100;
        let start = used_bytes + alloc_bytes > threshold;
        if start {
            tracing::debug!(
                target: "regiongc::gc",
                source,
                used_bytes,
                alloc_bytes,
                threshold,
                "request concurrent cycle initiation"
            );
        }
        start
    }

    fn record_new_heap_size(&self, num_regions: u32) {
        let mut state = self.state.lock();
        state.active_regions = num_regions;
        self.update_young_target(&mut state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AdaptivePolicy {
        let config = GcConfig::default();
        let geometry = config.validate().unwrap();
        AdaptivePolicy::new(&config, &geometry)
    }

    #[test]
    fn test_young_target_within_bounds() {
        let policy = policy();
        let target = policy.young_list_target_length();
        assert!(target >= 1);
        // 16 initial regions, 60% max, 10% reserve.
        assert!(target <= 9);
        assert!(policy.should_allocate_mutator_region(target - 1));
        assert!(!policy.should_allocate_mutator_region(target));
        assert_eq!(policy.max_survivor_regions(), target.div_ceil(8).max(1));
    }

    #[test]
    fn test_gc_locker_expansion_is_bounded() {
        let policy = policy();
        let target = policy.young_list_target_length();
        let max = target + (target * GC_LOCKER_EDEN_EXPANSION_PERCENT).div_ceil(100);
        assert!(max > target);
        assert!(policy.can_expand_young_list(target));
        assert!(policy.can_expand_young_list(max - 1));
        assert!(!policy.can_expand_young_list(max));
    }

    #[test]
    fn test_target_grows_with_heap() {
        let policy = policy();
        let before = policy.young_list_target_length();
        policy.record_new_heap_size(64);
        assert!(policy.young_list_target_length() >= before);
    }

    #[test]
    fn test_old_selection_respects_min_and_max() {
        let policy = policy();
        let candidates: Vec<_> = (0..40)
            .map(|region| CsetCandidate {
                region,
                live_bytes: 512 * 1024,
                reclaimable_bytes: 512 * 1024,
                retained: false,
            })
            .collect();
        let selection = policy.select_old_regions(&candidates, 0.0);
        assert_eq!(selection.initial, vec![0]);
        assert_eq!(selection.initial.len() + selection.optional.len(), 32);
        let generous = policy.select_old_regions(&candidates[..3], 1e9);
        assert_eq!(generous.initial, vec![0, 1, 2]);
        assert!(generous.optional.is_empty());
    }

    #[test]
    fn test_shrink_keeps_initial_capacity() {
        let policy = policy();
        let region = 1024 * 1024;
        assert_eq!(policy.shrink_amount(16 * region, 0), 0);
        // 2MB used at 70% max free needs ~7MB; the initial 16MB is the floor.
        assert_eq!(policy.shrink_amount(40 * region, 2 * region), 24 * region);
    }

    #[test]
    fn test_ihop() {
        let policy = policy();
        let max = 64 * 1024 * 1024;
        assert!(!policy.need_to_start_conc_mark("test", 1024, max / 4));
        assert!(policy.need_to_start_conc_mark("test", max / 4, max / 4));
    }
}
