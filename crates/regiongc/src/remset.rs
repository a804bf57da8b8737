//! Remembered sets and card scanning
//!
//! ## Design
//!
//! - The `RemSet` trait is what the pause pipeline needs from a
//!   remembered-set implementation: a post-write barrier sink, per-region
//!   scan limits, merging remembered sets of collection set regions into a
//!   list of cards, and parallel scanning of those cards.
//! - `CardRemSet` keeps, for every region, the set of cards holding
//!   references into it. A card table with one byte per card deduplicates
//!   cards across all evacuation phases of a pause; cards scanned in an
//!   earlier phase are not scanned again, references into optional regions
//!   found there were already recorded as optional roots.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::address::Address;
use crate::config::CARD_WORDS;
use crate::heap::Heap;
use crate::object::HEADER_WORDS;
use crate::storage::HeapStorage;

/// Cards claimed at once by a scanning worker
const CARD_CHUNK: usize = 64;

const CLEAN: u8 = 0;
const DIRTY: u8 = 1;

/// Remembered-set service used by the pause pipeline
pub trait RemSet: Send + Sync {
    /// Post-write barrier: `slot` now holds `target`
    fn record_reference(&self, heap: &Heap, slot: Address, target: Address);

    /// Fix the scan limit of `region` before evacuation starts
    fn prepare_region_for_scan(&self, heap: &Heap, region: u32);

    /// Turn the remembered sets of the current collection set increment into
    /// cards to scan
    fn merge_heap_roots(&self, heap: &Heap, initial_evacuation: bool);

    /// Scan merged cards, calling `visit` with every reference slot found
    fn scan_heap_roots(&self, heap: &Heap, worker_id: usize, visit: &mut dyn FnMut(Address)) -> usize;

    /// Scan code roots pointing into the collection set
    fn scan_collection_set_code_roots(&self, _heap: &Heap, _worker_id: usize, _visit: &mut dyn FnMut(Address)) {}

    /// Drop code root entries that point into freed regions
    fn purge_code_roots(&self, _heap: &Heap) {}

    /// The scan of the current increment finished
    fn complete_evac_phase(&self, has_more_phases: bool);

    /// Number of remembered entries pointing into `region`
    fn occupancy(&self, region: u32) -> usize;

    /// Whether the remembered set of `region` tracks all incoming references
    fn is_complete(&self, region: u32) -> bool;

    /// Forget everything pointing into `region`
    fn clear_region(&self, region: u32);

    /// Re-record the references found on `cards`, skipping cards in regions
    /// for which `skip` returns true
    fn redirty_cards(&self, heap: &Heap, cards: &[usize], skip: &dyn Fn(u32) -> bool);

    /// Reset the card table entries used during this pause; may be called by
    /// several workers at once
    fn clear_scanned_cards(&self);

    /// Total remembered entries over all regions
    fn total_length(&self) -> usize;
}

/// Card-table based remembered set
pub struct CardRemSet {
    card_table: Box<[AtomicU8]>,
    per_region: Box<[Mutex<FxHashSet<usize>>]>,
    scan_top: Box<[AtomicUsize]>,
    merged: Mutex<Vec<usize>>,
    next_chunk: AtomicUsize,
    all_merged: Mutex<Vec<usize>>,
    next_clear_chunk: AtomicUsize,
}

impl CardRemSet {
    /// Remembered set covering `num_cards` cards and `max_regions` regions
    pub fn new(num_cards: usize, max_regions: u32) -> Self {
        Self {
            card_table: (0..num_cards).map(|_| AtomicU8::new(CLEAN)).collect(),
            per_region: (0..max_regions).map(|_| Mutex::new(FxHashSet::default())).collect(),
            scan_top: (0..max_regions).map(|_| AtomicUsize::new(0)).collect(),
            merged: Mutex::new(Vec::new()),
            next_chunk: AtomicUsize::new(0),
            all_merged: Mutex::new(Vec::new()),
            next_clear_chunk: AtomicUsize::new(0),
        }
    }

    /// Whether `region`'s remembered set holds `card`
    pub fn contains_card(&self, region: u32, card: usize) -> bool {
        self.per_region[region as usize].lock().contains(&card)
    }

    fn add_card(&self, region: u32, card: usize) {
        self.per_region[region as usize].lock().insert(card);
    }

    fn claim_card(&self, card: usize, into: &mut Vec<usize>) {
        if self.card_table[card]
            .compare_exchange(CLEAN, DIRTY, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            into.push(card);
        }
    }

    /// Cards merged for the current evacuation phase
    pub fn merged_cards(&self) -> usize {
        self.merged.lock().len()
    }

    /// Call `visit` for every reference slot in `[from, limit)` of the block
    /// sequence covering card `card`
    fn walk_card(
        heap: &Heap,
        card: usize,
        limit: Address,
        visit: &mut dyn FnMut(Address),
    ) {
        let geometry = heap.geometry();
        let storage = heap.storage();
        let card_start = geometry.card_start(card);
        let card_end = card_start.offset(CARD_WORDS).min(limit);
        if card_start >= card_end {
            return;
        }
        let region = heap.region(geometry.region_index(card_start));
        if region.is_humongous() {
            let Some(start) = region.humongous_start_region() else {
                return;
            };
            let obj = heap.region(start).bottom();
            visit_slots_in(storage, obj, card_start, card_end, visit);
            return;
        }
        let mut obj = heap.bot().block_start(storage, card_start);
        while obj < card_end {
            let size = storage.block_size(obj);
            if !storage.is_filler(obj) {
                visit_slots_in(storage, obj, card_start, card_end, visit);
            }
            obj = obj.offset(size);
        }
    }
}

/// Visit the reference slots of `obj` that fall into `[from, to)`
fn visit_slots_in(
    storage: &HeapStorage,
    obj: Address,
    from: Address,
    to: Address,
    visit: &mut dyn FnMut(Address),
) {
    let shape = storage.shape(obj);
    let first_slot = obj.offset(HEADER_WORDS);
    let begin = if from > first_slot { from.words_from(first_slot) } else { 0 };
    let end = if to > first_slot {
        to.words_from(first_slot).min(shape.ref_fields)
    } else {
        0
    };
    for i in begin..end {
        visit(HeapStorage::ref_slot(obj, i));
    }
}

impl RemSet for CardRemSet {
    fn record_reference(&self, heap: &Heap, slot: Address, target: Address) {
        if target.is_null() {
            return;
        }
        let geometry = heap.geometry();
        let slot_region = geometry.region_index(slot);
        let target_region = geometry.region_index(target);
        if slot_region == target_region || heap.region(slot_region).is_young() {
            return;
        }
        self.add_card(target_region, geometry.card_index(slot));
    }

    fn prepare_region_for_scan(&self, heap: &Heap, region: u32) {
        let hr = heap.region(region);
        let top = if hr.is_old() || hr.is_humongous() {
            hr.top()
        } else {
            hr.bottom()
        };
        self.scan_top[region as usize].store(top.as_usize(), Ordering::Release);
    }

    fn merge_heap_roots(&self, heap: &Heap, initial_evacuation: bool) {
        let mut cards = Vec::new();
        if initial_evacuation {
            // The card table was cleaned at the end of the previous pause.
            self.all_merged.lock().clear();
        }
        for region in heap.collection_set_increment() {
            let entries = std::mem::take(&mut *self.per_region[region as usize].lock());
            for card in entries {
                self.claim_card(card, &mut cards);
            }
        }
        if initial_evacuation {
            // Candidates keep their remembered sets; they are only read here
            // so that references to them are found.
            for region in heap.humongous_candidates() {
                let entries = self.per_region[region as usize].lock();
                for &card in entries.iter() {
                    self.claim_card(card, &mut cards);
                }
            }
        }
        cards.sort_unstable();
        tracing::trace!(
            target: "regiongc::gc",
            cards = cards.len(),
            initial_evacuation,
            "merged heap roots"
        );
        *self.merged.lock() = cards;
        self.next_chunk.store(0, Ordering::Release);
    }

    fn scan_heap_roots(&self, heap: &Heap, _worker_id: usize, visit: &mut dyn FnMut(Address)) -> usize {
        let merged = self.merged.lock().clone();
        let geometry = heap.geometry();
        let mut scanned = 0;
        loop {
            let chunk = self.next_chunk.fetch_add(1, Ordering::AcqRel);
            let start = chunk * CARD_CHUNK;
            if start >= merged.len() {
                return scanned;
            }
            for &card in &merged[start..(start + CARD_CHUNK).min(merged.len())] {
                let region = geometry.region_index(geometry.card_start(card));
                let hr = heap.region(region);
                if hr.is_free() || heap.region_attr(region).is_in_cset() {
                    continue;
                }
                let limit = Address::new(self.scan_top[region as usize].load(Ordering::Acquire));
                Self::walk_card(heap, card, limit, visit);
                scanned += 1;
            }
        }
    }

    fn complete_evac_phase(&self, _has_more_phases: bool) {
        let mut merged = self.merged.lock();
        self.all_merged.lock().append(&mut merged);
        self.next_clear_chunk.store(0, Ordering::Release);
    }

    fn occupancy(&self, region: u32) -> usize {
        self.per_region[region as usize].lock().len()
    }

    fn is_complete(&self, _region: u32) -> bool {
        true
    }

    fn clear_region(&self, region: u32) {
        self.per_region[region as usize].lock().clear();
    }

    fn redirty_cards(&self, heap: &Heap, cards: &[usize], skip: &dyn Fn(u32) -> bool) {
        let geometry = heap.geometry();
        for &card in cards {
            let region = geometry.region_index(geometry.card_start(card));
            if skip(region) {
                continue;
            }
            let hr = heap.region(region);
            if hr.is_free() {
                continue;
            }
            let limit = hr.top();
            Self::walk_card(heap, card, limit, &mut |slot| {
                let target = heap.storage().load_ref(slot);
                if target.is_null() {
                    return;
                }
                let target_region = geometry.region_index(target);
                if target_region != region && !heap.region(target_region).is_free() {
                    self.add_card(target_region, card);
                }
            });
        }
    }

    fn clear_scanned_cards(&self) {
        let cards = self.all_merged.lock().clone();
        loop {
            let chunk = self.next_clear_chunk.fetch_add(1, Ordering::AcqRel);
            let start = chunk * CARD_CHUNK;
            if start >= cards.len() {
                break;
            }
            for &card in &cards[start..(start + CARD_CHUNK).min(cards.len())] {
                self.card_table[card].store(CLEAN, Ordering::Release);
            }
        }
    }

    fn total_length(&self) -> usize {
        self.per_region.iter().map(|set| set.lock().len()).sum()
    }
}
