//! A single heap region

use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};

use crate::address::{Address, WORD_SIZE};

use super::region_type::{RegionType, SetKind};

const NO_INDEX: u32 = u32::MAX;

/// Fixed-size heap partition.
///
/// Regions are created once and only relabeled afterwards. All mutable state
/// is atomic so a region can be read from any thread; writers follow the
/// locking rules of the set or allocator that currently owns the region.
pub struct Region {
    index: u32,
    node_index: u32,
    bottom: Address,
    end: Address,
    top: AtomicUsize,
    region_type: AtomicU8,
    containing_set: AtomicU8,
    humongous_start: AtomicU32,
    top_at_mark_start: AtomicUsize,
    parsable_bottom: AtomicUsize,
    garbage_bytes: AtomicUsize,
    pinned_count: AtomicUsize,
    young_index_in_cset: AtomicU32,
}

impl Region {
    pub(crate) fn new(index: u32, bottom: Address, words: usize, node_index: u32) -> Self {
        Self {
            index,
            node_index,
            bottom,
            end: bottom.offset(words),
            top: AtomicUsize::new(bottom.as_usize()),
            region_type: AtomicU8::new(RegionType::Free as u8),
            containing_set: AtomicU8::new(SetKind::None as u8),
            humongous_start: AtomicU32::new(NO_INDEX),
            top_at_mark_start: AtomicUsize::new(bottom.as_usize()),
            parsable_bottom: AtomicUsize::new(bottom.as_usize()),
            garbage_bytes: AtomicUsize::new(0),
            pinned_count: AtomicUsize::new(0),
            young_index_in_cset: AtomicU32::new(NO_INDEX),
        }
    }

    /// Stable region index
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// NUMA node this region belongs to
    #[inline]
    pub fn node_index(&self) -> u32 {
        self.node_index
    }

    /// First word of the region
    #[inline]
    pub fn bottom(&self) -> Address {
        self.bottom
    }

    /// First word past the region
    #[inline]
    pub fn end(&self) -> Address {
        self.end
    }

    /// First unallocated word
    #[inline]
    pub fn top(&self) -> Address {
        Address::new(self.top.load(Ordering::Acquire))
    }

    pub(crate) fn set_top(&self, top: Address) {
        debug_assert!(top >= self.bottom && top <= self.end);
        self.top.store(top.as_usize(), Ordering::Release);
    }

    /// Capacity in words
    #[inline]
    pub fn capacity_words(&self) -> usize {
        self.end.words_from(self.bottom)
    }

    /// Words below top
    #[inline]
    pub fn used_words(&self) -> usize {
        self.top().words_from(self.bottom)
    }

    /// Bytes below top
    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.used_words() * WORD_SIZE
    }

    /// Words above top
    #[inline]
    pub fn free_words(&self) -> usize {
        self.end.words_from(self.top())
    }

    /// Whether nothing was allocated in the region
    pub fn is_empty(&self) -> bool {
        self.top() == self.bottom
    }

    /// Whether `addr` lies in `[bottom, end)`
    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.bottom && addr < self.end
    }

    /// Bump-allocate between `min_words` and `desired_words` words.
    ///
    /// Lock-free; several threads may allocate concurrently.
    pub fn par_allocate(&self, min_words: usize, desired_words: usize) -> Option<(Address, usize)> {
        let end = self.end.as_usize();
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            let available = end - top;
            let want = desired_words.min(available);
            if want < min_words || want == 0 {
                return None;
            }
            match self.top.compare_exchange_weak(
                top,
                top + want,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some((Address::new(top), want)),
                Err(current) => top = current,
            }
        }
    }

    /// Current region type
    #[inline]
    pub fn region_type(&self) -> RegionType {
        RegionType::from_u8(self.region_type.load(Ordering::Acquire))
    }

    fn store_type(&self, ty: RegionType) {
        let from = self.region_type();
        self.region_type.store(ty as u8, Ordering::Release);
        tracing::trace!(
            target: "regiongc::region",
            region = self.index,
            from = from.name(),
            to = ty.name(),
            bottom = %self.bottom,
            top = %self.top(),
            "region transition"
        );
    }

    /// Free region
    pub fn is_free(&self) -> bool {
        self.region_type() == RegionType::Free
    }

    /// Eden region
    pub fn is_eden(&self) -> bool {
        self.region_type() == RegionType::Eden
    }

    /// Survivor region
    pub fn is_survivor(&self) -> bool {
        self.region_type() == RegionType::Survivor
    }

    /// Eden or survivor region
    pub fn is_young(&self) -> bool {
        self.region_type().is_young()
    }

    /// Old region
    pub fn is_old(&self) -> bool {
        self.region_type() == RegionType::Old
    }

    /// Any humongous region
    pub fn is_humongous(&self) -> bool {
        self.region_type().is_humongous()
    }

    /// First region of a humongous object
    pub fn is_starts_humongous(&self) -> bool {
        self.region_type() == RegionType::StartsHumongous
    }

    /// Tail region of a humongous object
    pub fn is_continues_humongous(&self) -> bool {
        self.region_type() == RegionType::ContinuesHumongous
    }

    /// Index of the first region of the humongous object covering this region
    pub fn humongous_start_region(&self) -> Option<u32> {
        match self.humongous_start.load(Ordering::Acquire) {
            NO_INDEX => None,
            index => Some(index),
        }
    }

    /// Set type `Eden`; the region must be free
    pub fn set_eden(&self) {
        assert!(self.is_free(), "region {} must be free to become eden", self.index);
        self.store_type(RegionType::Eden);
    }

    /// Relabel a survivor as eden when it joins the next collection set
    pub fn set_eden_from_survivor(&self) {
        assert!(self.is_survivor(), "region {} must be survivor", self.index);
        self.store_type(RegionType::Eden);
    }

    /// Set type `Survivor`; the region must be free
    pub fn set_survivor(&self) {
        assert!(self.is_free(), "region {} must be free to become survivor", self.index);
        self.store_type(RegionType::Survivor);
    }

    /// Set type `Old`; the region must be free
    pub fn set_old(&self) {
        assert!(self.is_free(), "region {} must be free to become old", self.index);
        self.store_type(RegionType::Old);
    }

    /// Relabel a young or humongous-start region as old
    pub fn move_to_old(&self) {
        let ty = self.region_type();
        assert!(
            ty.is_young() || ty == RegionType::StartsHumongous,
            "region {} of type {} cannot move to old",
            self.index,
            ty.name()
        );
        self.store_type(RegionType::Old);
    }

    /// Start a humongous object whose end is `obj_top`
    pub fn set_starts_humongous(&self, obj_top: Address) {
        assert!(self.is_free(), "region {} must be free to start humongous", self.index);
        self.humongous_start.store(self.index, Ordering::Release);
        self.set_top(obj_top.min(self.end));
        self.store_type(RegionType::StartsHumongous);
    }

    /// Continue the humongous object started in region `start`
    pub fn set_continues_humongous(&self, start: u32, obj_top: Address) {
        assert!(self.is_free(), "region {} must be free to continue humongous", self.index);
        self.humongous_start.store(start, Ordering::Release);
        self.set_top(obj_top.min(self.end).max(self.bottom));
        self.store_type(RegionType::ContinuesHumongous);
    }

    /// Forget humongous membership before the region is freed
    pub fn clear_humongous(&self) {
        assert!(self.is_humongous(), "region {} is not humongous", self.index);
        self.humongous_start.store(NO_INDEX, Ordering::Release);
    }

    /// Reset the region to `Free` with an empty allocation range
    pub fn hr_clear(&self) {
        assert!(
            !self.is_humongous() || self.humongous_start_region().is_none(),
            "region {} still belongs to a humongous object",
            self.index
        );
        assert_eq!(
            self.pinned_count(),
            0,
            "pinned region {} cannot be cleared",
            self.index
        );
        self.humongous_start.store(NO_INDEX, Ordering::Release);
        self.young_index_in_cset.store(NO_INDEX, Ordering::Relaxed);
        self.set_top(self.bottom);
        self.top_at_mark_start
            .store(self.bottom.as_usize(), Ordering::Relaxed);
        self.parsable_bottom
            .store(self.bottom.as_usize(), Ordering::Relaxed);
        self.garbage_bytes.store(0, Ordering::Relaxed);
        if !self.is_free() {
            self.store_type(RegionType::Free);
        }
    }

    /// Containing set tag
    #[inline]
    pub fn containing_set(&self) -> SetKind {
        SetKind::from_u8(self.containing_set.load(Ordering::Acquire))
    }

    /// Tag the region as member of `set`; it must not be in any set
    pub(crate) fn set_containing_set(&self, set: SetKind) {
        let prev = self.containing_set.swap(set as u8, Ordering::AcqRel);
        assert_eq!(
            SetKind::from_u8(prev),
            SetKind::None,
            "region {} added to {} while in {}",
            self.index,
            set.name(),
            SetKind::from_u8(prev).name()
        );
    }

    /// Remove the tag of `set`; the region must be a member of it
    pub(crate) fn clear_containing_set(&self, set: SetKind) {
        let prev = self.containing_set.swap(SetKind::None as u8, Ordering::AcqRel);
        assert_eq!(
            SetKind::from_u8(prev),
            set,
            "region {} removed from {} while in {}",
            self.index,
            set.name(),
            SetKind::from_u8(prev).name()
        );
    }

    /// Top at the start of the last marking cycle
    pub fn top_at_mark_start(&self) -> Address {
        Address::new(self.top_at_mark_start.load(Ordering::Acquire))
    }

    /// Record the current top as top-at-mark-start
    pub fn note_start_of_marking(&self) {
        self.top_at_mark_start
            .store(self.top().as_usize(), Ordering::Release);
    }

    /// Objects below this address can only be found through the
    /// evacuation-failure bitmap; `bottom` when the whole region walks.
    pub fn parsable_bottom(&self) -> Address {
        Address::new(self.parsable_bottom.load(Ordering::Acquire))
    }

    /// Whether the region can be walked object by object from `bottom`
    pub fn is_parsable(&self) -> bool {
        self.parsable_bottom() == self.bottom
    }

    pub(crate) fn set_parsable_bottom(&self, addr: Address) {
        debug_assert!(addr >= self.bottom && addr <= self.top());
        self.parsable_bottom.store(addr.as_usize(), Ordering::Release);
    }

    pub(crate) fn reset_parsable_bottom(&self) {
        self.parsable_bottom
            .store(self.bottom.as_usize(), Ordering::Release);
    }

    /// Dead bytes found in this region after removing self forwards
    pub fn garbage_bytes(&self) -> usize {
        self.garbage_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn reset_garbage_bytes(&self) {
        self.garbage_bytes.store(0, Ordering::Relaxed);
    }

    pub(crate) fn note_self_forward_chunk_done(&self, garbage_bytes: usize) {
        self.garbage_bytes.fetch_add(garbage_bytes, Ordering::Relaxed);
    }

    /// Live bytes estimate (used minus known garbage)
    pub fn live_bytes(&self) -> usize {
        self.used_bytes().saturating_sub(self.garbage_bytes())
    }

    /// Number of outstanding pins
    pub fn pinned_count(&self) -> usize {
        self.pinned_count.load(Ordering::Acquire)
    }

    /// Whether the region may not be evacuated
    pub fn has_pinned_objects(&self) -> bool {
        self.pinned_count() > 0
    }

    pub(crate) fn increment_pinned(&self) {
        self.pinned_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrement_pinned(&self) {
        let prev = self.pinned_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unbalanced unpin of region {}", self.index);
    }

    /// Index among the young regions of the current collection set
    pub fn young_index_in_cset(&self) -> Option<u32> {
        match self.young_index_in_cset.load(Ordering::Relaxed) {
            NO_INDEX => None,
            index => Some(index),
        }
    }

    pub(crate) fn set_young_index_in_cset(&self, index: Option<u32>) {
        self.young_index_in_cset
            .store(index.unwrap_or(NO_INDEX), Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("index", &self.index)
            .field("type", &self.region_type())
            .field("bottom", &self.bottom)
            .field("top", &self.top())
            .field("end", &self.end)
            .field("set", &self.containing_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> Region {
        Region::new(2, Address::heap_base().offset(2048), 1024, 0)
    }

    #[test]
    fn test_par_allocate_bounds() {
        let r = region();
        let (a, n) = r.par_allocate(10, 10).unwrap();
        assert_eq!(a, r.bottom());
        assert_eq!(n, 10);
        let (_, n) = r.par_allocate(1, 5000).unwrap();
        assert_eq!(n, 1014);
        assert_eq!(r.top(), r.end());
        assert!(r.par_allocate(1, 1).is_none());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let r = region();
        r.set_eden();
        assert!(r.is_young());
        r.move_to_old();
        assert!(r.is_old());
        r.hr_clear();
        assert!(r.is_free());
        assert!(r.is_empty());

        r.set_starts_humongous(r.bottom().offset(100));
        assert_eq!(r.humongous_start_region(), Some(2));
        assert_eq!(r.used_words(), 100);
        r.clear_humongous();
        r.hr_clear();
        assert!(r.is_free());
    }

    #[test]
    #[should_panic(expected = "must be free")]
    fn test_set_old_requires_free() {
        let r = region();
        r.set_eden();
        r.set_old();
    }

    #[test]
    #[should_panic(expected = "added to old while in free")]
    fn test_containing_set_exclusive() {
        let r = region();
        r.set_containing_set(SetKind::Free);
        r.set_containing_set(SetKind::Old);
    }

    #[test]
    fn test_concurrent_par_allocate_disjoint() {
        let r = region();
        let mut chunks: Vec<usize> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        let mut got = Vec::new();
                        while let Some((addr, _)) = r.par_allocate(8, 8) {
                            got.push(addr.as_usize());
                        }
                        got
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        chunks.sort_unstable();
        chunks.dedup();
        assert_eq!(chunks.len(), 1024 / 8);
    }
}
