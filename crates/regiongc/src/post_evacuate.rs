//! Sub-tasks run after evacuation
//!
//! ## Design
//!
//! - Two batches. The first one merges per-worker state and repairs regions
//!   that failed evacuation; the second one frees the collection set and
//!   re-records the cards found during evacuation. Parallel tasks of a batch
//!   never depend on serial tasks of the same batch.
//! - Removing self forwards walks the failure bitmap of each failed region in
//!   fixed-size chunks. The chunk an object starts in owns the gap behind it;
//!   chunk 0 also owns the gap before the first failed object. Gaps become
//!   filler objects, so the region is parsable and its block offset table is
//!   correct afterwards. Running a chunk twice gives the same heap.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::address::{Address, WORD_SIZE};
use crate::allocator::AllocDest;
use crate::batched_task::{ALMOST_NO_WORK, SubTask};
use crate::heap::Heap;
use crate::object::MarkWord;
use crate::par_scan_state::{ParScanThreadStateSet, PssTotals};
use crate::phase_times::GcPhase;
use crate::region::{RegionAttr, SetKind};

/// Items claimed at once by parallel sub-tasks
const CLAIM_CHUNK: usize = 64;

/// Chunks of failed regions one worker is expected to handle
const CHUNKS_PER_WORKER: f64 = 16.0;

/// Claim the next `CLAIM_CHUNK` items of `len`
fn claim(counter: &AtomicUsize, len: usize) -> Option<std::ops::Range<usize>> {
    let start = counter.fetch_add(CLAIM_CHUNK, Ordering::Relaxed);
    if start >= len {
        return None;
    }
    Some(start..(start + CLAIM_CHUNK).min(len))
}

fn parallel_cost(items: usize, per_worker: f64) -> f64 {
    if items == 0 {
        ALMOST_NO_WORK
    } else {
        items as f64 / per_worker
    }
}

/// Restore the failed objects of one chunk of `region` below its parsable
/// bottom; returns the garbage words found
pub(crate) fn remove_self_forwards_in_chunk(heap: &Heap, region: u32, chunk: usize, chunk_words: usize) -> usize {
    let hr = heap.region(region);
    let storage = heap.storage();
    let bitmap = heap.evac_failure_bitmap();
    let base = heap.geometry().base;
    let bit = |addr: Address| addr.words_from(base);
    let top = hr.parsable_bottom();
    let chunk_start = hr.bottom().offset(chunk * chunk_words);
    if chunk_start >= top {
        return 0;
    }
    let chunk_end = chunk_start.offset(chunk_words).min(top);
    let next_marked = |from: Address| base.offset(bitmap.find_next_set(bit(from), bit(top)));

    let mut garbage = 0;
    if chunk == 0 {
        let first = next_marked(hr.bottom());
        let gap = first.words_from(hr.bottom());
        if gap > 0 {
            heap.fill_with_dummy_object(hr.bottom(), gap);
            garbage += gap;
        }
    }
    let mut obj = next_marked(chunk_start);
    while obj < chunk_end {
        if storage.mark(obj) == MarkWord::EvacFailed {
            storage.set_mark(obj, MarkWord::PROTOTYPE);
        }
        let obj_end = obj.offset(storage.shape(obj).size_words);
        heap.bot().update_for_block(obj, obj_end);
        let next = next_marked(obj_end);
        let gap = next.words_from(obj_end);
        if gap > 0 {
            heap.fill_with_dummy_object(obj_end, gap);
            garbage += gap;
        }
        obj = next;
    }
    garbage
}

/// First post-evacuation batch
pub enum PostEvacuatePhase1Task<'a, 'h> {
    /// Flush PLABs and collect per-worker results (serial)
    MergePss {
        /// Worker states
        pss: &'a ParScanThreadStateSet<'h>,
        /// Collected totals
        totals: Mutex<Option<PssTotals>>,
    },
    /// Recompute used bytes from the regions (serial, failure only)
    RecalculateUsed {
        /// Heap
        heap: &'h Heap,
    },
    /// Sample remembered sets of old collection set candidates (serial)
    SampleCandidates {
        /// Heap
        heap: &'h Heap,
        /// Candidates to sample
        candidates: Vec<u32>,
    },
    /// Make failed regions parsable and restore failed objects (parallel)
    RemoveSelfForwards {
        /// Heap
        heap: &'h Heap,
        /// (region, chunk) pairs to process
        chunks: Vec<(u32, usize)>,
        /// Chunk size in words
        chunk_words: usize,
        /// Next pair to claim
        claim: AtomicUsize,
    },
    /// Reset the card table entries used for scanning (parallel)
    ClearCardTable {
        /// Heap
        heap: &'h Heap,
    },
}

impl<'a, 'h> PostEvacuatePhase1Task<'a, 'h> {
    /// Per-worker state merge
    pub fn merge_pss(pss: &'a ParScanThreadStateSet<'h>) -> Self {
        Self::MergePss {
            pss,
            totals: Mutex::new(None),
        }
    }

    /// Self-forward removal for all failed regions
    pub fn remove_self_forwards(heap: &'h Heap, regions: &[u32]) -> Self {
        let chunk_words = heap.config().remove_self_forwards_chunk_words.max(1);
        let mut chunks = Vec::new();
        for &region in regions {
            let hr = heap.region(region);
            hr.reset_garbage_bytes();
            hr.set_parsable_bottom(hr.top());
            let num_chunks = hr.used_words().div_ceil(chunk_words).max(1);
            chunks.extend((0..num_chunks).map(|chunk| (region, chunk)));
        }
        Self::RemoveSelfForwards {
            heap,
            chunks,
            chunk_words,
            claim: AtomicUsize::new(0),
        }
    }

    /// Merged totals once the batch ran
    pub fn take_totals(&mut self) -> Option<PssTotals> {
        match self {
            Self::MergePss { totals, .. } => totals.get_mut().take(),
            _ => None,
        }
    }
}

impl SubTask for PostEvacuatePhase1Task<'_, '_> {
    fn phase(&self) -> GcPhase {
        match self {
            Self::MergePss { .. } => GcPhase::MergePss,
            Self::RecalculateUsed { .. } => GcPhase::RecalculateUsed,
            Self::SampleCandidates { .. } => GcPhase::SampleCandidates,
            Self::RemoveSelfForwards { .. } => GcPhase::RemoveSelfForwards,
            Self::ClearCardTable { .. } => GcPhase::ClearCardTable,
        }
    }

    fn worker_cost(&self) -> f64 {
        match self {
            Self::MergePss { .. } | Self::SampleCandidates { .. } => ALMOST_NO_WORK,
            Self::RecalculateUsed { .. } => 1.0,
            Self::RemoveSelfForwards { chunks, .. } => parallel_cost(chunks.len(), CHUNKS_PER_WORKER),
            Self::ClearCardTable { heap } => parallel_cost(heap.collection_set_len(), REGIONS_PER_CLEAR_WORKER),
        }
    }

    fn do_work(&self, _worker_id: usize) {
        match self {
            Self::MergePss { pss, totals } => {
                *totals.lock() = Some(pss.flush());
            }
            Self::RecalculateUsed { heap } => heap.recalculate_used(),
            Self::SampleCandidates { heap, candidates } => {
                let rs_length: usize = candidates.iter().map(|&r| heap.remset().occupancy(r)).sum();
                let reclaimable: usize = candidates.iter().map(|&r| heap.region(r).garbage_bytes()).sum();
                heap.stats().record_candidates(candidates.len(), reclaimable);
                heap.phase_times().add_work_items(GcPhase::SampleCandidates, rs_length);
            }
            Self::RemoveSelfForwards {
                heap,
                chunks,
                chunk_words,
                claim: counter,
            } => {
                while let Some(range) = claim(counter, chunks.len()) {
                    for &(region, chunk) in &chunks[range] {
                        let garbage = remove_self_forwards_in_chunk(heap, region, chunk, *chunk_words);
                        heap.region(region).note_self_forward_chunk_done(garbage * WORD_SIZE);
                    }
                }
            }
            Self::ClearCardTable { heap } => heap.remset().clear_scanned_cards(),
        }
    }
}

/// Collection set regions one worker is expected to clear cards for
const REGIONS_PER_CLEAR_WORKER: f64 = 64.0;

/// Outcome of freeing the collection set
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FreeCsetResult {
    /// Regions returned to the free list
    pub freed_regions: usize,
    /// Used bytes of the freed regions
    pub freed_bytes: usize,
    /// Regions kept because objects failed to move
    pub retained: Vec<u32>,
}

/// Second post-evacuation batch
pub enum PostEvacuatePhase2Task<'h> {
    /// Free humongous candidates nothing referenced (serial)
    EagerlyReclaimHumongous {
        /// Heap
        heap: &'h Heap,
        /// Candidates selected at pause start
        candidates: Vec<u32>,
        /// Objects reclaimed
        reclaimed: AtomicUsize,
        /// Regions freed
        regions_freed: AtomicUsize,
    },
    /// Drop code roots into freed regions (serial)
    PurgeCodeRoots {
        /// Heap
        heap: &'h Heap,
    },
    /// Restore mark words of failed objects (parallel)
    RestorePreservedMarks {
        /// Heap
        heap: &'h Heap,
        /// Objects and their original mark words
        preserved: Vec<(Address, MarkWord)>,
        /// Next item to claim
        claim: AtomicUsize,
    },
    /// Re-record remembered-set entries for cards found during evacuation (parallel)
    RedirtyCards {
        /// Heap
        heap: &'h Heap,
        /// Cards enqueued by the workers
        cards: Vec<usize>,
        /// Regions whose cards are dropped
        skip: FxHashSet<u32>,
        /// Next item to claim
        claim: AtomicUsize,
    },
    /// Clear the failure bitmap of retained regions (parallel)
    ClearRetainedRegionBitmaps {
        /// Heap
        heap: &'h Heap,
        /// Regions that failed evacuation
        regions: Vec<u32>,
        /// Next item to claim
        claim: AtomicUsize,
    },
    /// Free or retain every collection set region (parallel)
    FreeCollectionSet {
        /// Heap
        heap: &'h Heap,
        /// Collection set regions
        regions: Vec<u32>,
        /// Next item to claim
        claim: AtomicUsize,
        /// Accumulated result
        result: Mutex<FreeCsetResult>,
    },
}

impl<'h> PostEvacuatePhase2Task<'h> {
    /// Humongous reclaim over `candidates`
    pub fn eagerly_reclaim_humongous(heap: &'h Heap, candidates: Vec<u32>) -> Self {
        Self::EagerlyReclaimHumongous {
            heap,
            candidates,
            reclaimed: AtomicUsize::new(0),
            regions_freed: AtomicUsize::new(0),
        }
    }

    /// Restore of `preserved` marks
    pub fn restore_preserved_marks(heap: &'h Heap, preserved: Vec<(Address, MarkWord)>) -> Self {
        Self::RestorePreservedMarks {
            heap,
            preserved,
            claim: AtomicUsize::new(0),
        }
    }

    /// Card redirtying, skipping regions about to be freed.
    ///
    /// Must be built before the batch runs: it reads region attributes that
    /// freeing the collection set clears.
    pub fn redirty_cards(heap: &'h Heap, cards: Vec<usize>, cset: &[u32], candidates: &[u32]) -> Self {
        let failures = heap.evac_failure_regions();
        let skip = cset
            .iter()
            .copied()
            .filter(|&r| !failures.contains(r))
            .chain(
                candidates
                    .iter()
                    .copied()
                    .filter(|&r| heap.region_attr(r) == RegionAttr::HumongousCandidate),
            )
            .collect();
        Self::RedirtyCards {
            heap,
            cards,
            skip,
            claim: AtomicUsize::new(0),
        }
    }

    /// Bitmap clearing for `regions`
    pub fn clear_retained_region_bitmaps(heap: &'h Heap, regions: Vec<u32>) -> Self {
        Self::ClearRetainedRegionBitmaps {
            heap,
            regions,
            claim: AtomicUsize::new(0),
        }
    }

    /// Freeing of the collection set `regions`
    pub fn free_collection_set(heap: &'h Heap, regions: Vec<u32>) -> Self {
        Self::FreeCollectionSet {
            heap,
            regions,
            claim: AtomicUsize::new(0),
            result: Mutex::new(FreeCsetResult::default()),
        }
    }

    /// Humongous objects and regions reclaimed
    pub fn humongous_reclaimed(&self) -> (usize, usize) {
        match self {
            Self::EagerlyReclaimHumongous {
                reclaimed,
                regions_freed,
                ..
            } => (reclaimed.load(Ordering::Relaxed), regions_freed.load(Ordering::Relaxed)),
            _ => (0, 0),
        }
    }

    /// Result of freeing the collection set
    pub fn take_free_result(&mut self) -> Option<FreeCsetResult> {
        match self {
            Self::FreeCollectionSet { result, .. } => Some(std::mem::take(result.get_mut())),
            _ => None,
        }
    }

    fn reclaim_humongous(heap: &Heap, start: u32) -> usize {
        let num_regions = heap.humongous_series_len(start);
        let mut freed_bytes = 0;
        for index in (start..start + num_regions).rev() {
            let hr = heap.region(index);
            freed_bytes += hr.used_bytes();
            heap.humongous_set_remove(index);
            hr.clear_humongous();
            heap.remset().clear_region(index);
            heap.region_attrs().clear(index);
            hr.hr_clear();
        }
        let indices: Vec<u32> = (start..start + num_regions).collect();
        heap.manager().insert_all_into_free_list(&indices);
        heap.decrease_used(freed_bytes);
        tracing::debug!(
            target: "regiongc::gc",
            region = start,
            regions = num_regions,
            bytes = freed_bytes,
            "eagerly reclaimed humongous object"
        );
        num_regions as usize
    }

    fn free_region(heap: &Heap, index: u32, local: &mut FreeCsetResult, freed: &mut Vec<u32>) {
        let hr = heap.region(index);
        let failures = heap.evac_failure_regions();
        if failures.contains(index) {
            if hr.is_young() {
                hr.clear_containing_set(SetKind::Young);
                hr.move_to_old();
            }
            hr.set_young_index_in_cset(None);
            hr.reset_parsable_bottom();
            heap.old_set_add(index);
            let live_words = hr.live_bytes() / WORD_SIZE;
            let garbage_words = hr.garbage_bytes() / WORD_SIZE;
            heap.evac_stats(AllocDest::Old)
                .add_failure_used_and_waste(live_words, garbage_words);
            local.retained.push(index);
        } else {
            if hr.is_young() {
                hr.clear_containing_set(SetKind::Young);
            }
            local.freed_bytes += hr.used_bytes();
            local.freed_regions += 1;
            heap.remset().clear_region(index);
            hr.hr_clear();
            freed.push(index);
        }
        heap.region_attrs().clear(index);
    }
}

impl SubTask for PostEvacuatePhase2Task<'_> {
    fn phase(&self) -> GcPhase {
        match self {
            Self::EagerlyReclaimHumongous { .. } => GcPhase::EagerlyReclaimHumongous,
            Self::PurgeCodeRoots { .. } => GcPhase::PurgeCodeRoots,
            Self::RestorePreservedMarks { .. } => GcPhase::RestorePreservedMarks,
            Self::RedirtyCards { .. } => GcPhase::RedirtyCards,
            Self::ClearRetainedRegionBitmaps { .. } => GcPhase::ClearRetainedRegionBitmaps,
            Self::FreeCollectionSet { .. } => GcPhase::FreeCollectionSet,
        }
    }

    fn worker_cost(&self) -> f64 {
        match self {
            Self::EagerlyReclaimHumongous { .. } | Self::PurgeCodeRoots { .. } => ALMOST_NO_WORK,
            Self::RestorePreservedMarks { preserved, .. } => parallel_cost(preserved.len(), 1024.0),
            Self::RedirtyCards { cards, .. } => parallel_cost(cards.len(), 256.0),
            Self::ClearRetainedRegionBitmaps { regions, .. } => parallel_cost(regions.len(), 8.0),
            Self::FreeCollectionSet { regions, .. } => parallel_cost(regions.len(), 32.0),
        }
    }

    fn do_work(&self, _worker_id: usize) {
        match self {
            Self::EagerlyReclaimHumongous {
                heap,
                candidates,
                reclaimed,
                regions_freed,
            } => {
                for &start in candidates {
                    if heap.region_attr(start) != RegionAttr::HumongousCandidate {
                        continue;
                    }
                    let freed = Self::reclaim_humongous(heap, start);
                    reclaimed.fetch_add(1, Ordering::Relaxed);
                    regions_freed.fetch_add(freed, Ordering::Relaxed);
                }
                heap.phase_times()
                    .add_work_items(GcPhase::EagerlyReclaimHumongous, reclaimed.load(Ordering::Relaxed));
            }
            Self::PurgeCodeRoots { heap } => heap.remset().purge_code_roots(heap),
            Self::RestorePreservedMarks {
                heap,
                preserved,
                claim: counter,
            } => {
                let storage = heap.storage();
                while let Some(range) = claim(counter, preserved.len()) {
                    for &(obj, mark) in &preserved[range] {
                        storage.set_mark(obj, mark);
                    }
                }
            }
            Self::RedirtyCards {
                heap,
                cards,
                skip,
                claim: counter,
            } => {
                let mut done = 0;
                while let Some(range) = claim(counter, cards.len()) {
                    done += range.len();
                    heap.remset()
                        .redirty_cards(heap, &cards[range], &|region| skip.contains(&region));
                }
                heap.phase_times().add_work_items(GcPhase::RedirtyCards, done);
            }
            Self::ClearRetainedRegionBitmaps {
                heap,
                regions,
                claim: counter,
            } => {
                let base = heap.geometry().base;
                while let Some(range) = claim(counter, regions.len()) {
                    for &region in &regions[range] {
                        let hr = heap.region(region);
                        heap.evac_failure_bitmap()
                            .clear_range(hr.bottom().words_from(base), hr.end().words_from(base));
                    }
                }
            }
            Self::FreeCollectionSet {
                heap,
                regions,
                claim: counter,
                result,
            } => {
                let mut local = FreeCsetResult::default();
                let mut freed = Vec::new();
                while let Some(range) = claim(counter, regions.len()) {
                    for &index in &regions[range] {
                        Self::free_region(heap, index, &mut local, &mut freed);
                    }
                }
                heap.manager().insert_all_into_free_list(&freed);
                let mut result = result.lock();
                result.freed_regions += local.freed_regions;
                result.freed_bytes += local.freed_bytes;
                result.retained.append(&mut local.retained);
            }
        }
    }
}
