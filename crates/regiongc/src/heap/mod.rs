//! The heap context
//!
//! ## Design
//!
//! - **One context object**: everything that would otherwise be process-wide
//!   state (geometry, region table, region sets, allocators, collaborators,
//!   statistics) lives in a `Heap` built once and shared as `Arc<Heap>`.
//!   Geometry and configuration never change after construction.
//! - **Region sets**: the young set (with the eden and survivor lists), the
//!   old set and the humongous set are guarded by their own locks, separate
//!   from the heap lock, so GC workers can move regions between sets in
//!   parallel during a pause.
//! - **Used bytes**: a summary counter plus the bytes in the current mutator
//!   alloc regions. GC allocations are accumulated separately during a pause
//!   and folded in when the pause ends.

mod allocation;
mod builder;
mod sizing;

pub use allocation::AllocRequest;
pub use builder::HeapBuilder;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::address::Address;
use crate::age_table::AgeTable;
use crate::allocator::{AllocDest, Allocator};
use crate::bitmap::AtomicBitmap;
use crate::block_offset::BlockOffsetTable;
use crate::collection_set::CollectionSet;
use crate::config::{GcConfig, HeapGeometry};
use crate::error::{AllocError, VerifyError};
use crate::evac_failure::{EvacFailureInjector, EvacFailureRegions};
use crate::gc_locker::GcLocker;
use crate::marking::ConcurrentMark;
use crate::object::ObjectShape;
use crate::phase_times::PhaseTimes;
use crate::plab::EvacStats;
use crate::policy::Policy;
use crate::region::{Region, RegionAttr, RegionAttrTable, RegionManager, RegionSet, RegionType};
use crate::remset::RemSet;
use crate::roots::RootSet;
use crate::safepoint::Safepoint;
use crate::service::ServiceThread;
use crate::stats::GcStats;
use crate::storage::HeapStorage;
use crate::verifier::HeapVerifier;
use crate::workers::WorkerThreads;

/// Young regions: the young set plus the order regions joined it
pub(crate) struct YoungRegions {
    /// Tag-based membership count
    pub(crate) set: RegionSet,
    /// Eden regions, in allocation order
    pub(crate) eden: Vec<u32>,
    /// Survivor regions allocated by the current or last pause
    pub(crate) survivors: Vec<u32>,
}

/// Old and humongous region sets
pub(crate) struct OldSets {
    pub(crate) old: RegionSet,
    pub(crate) humongous: RegionSet,
}

/// Region-based garbage collected heap
pub struct Heap {
    pub(crate) config: GcConfig,
    pub(crate) geometry: HeapGeometry,
    pub(crate) storage: HeapStorage,
    pub(crate) bot: BlockOffsetTable,
    pub(crate) manager: RegionManager,
    pub(crate) attrs: RegionAttrTable,
    pub(crate) allocator: Allocator,

    pub(crate) young: Mutex<YoungRegions>,
    pub(crate) old_sets: Mutex<OldSets>,
    /// Serializes mutator alloc region replacement and humongous allocation
    pub(crate) heap_lock: Mutex<()>,

    pub(crate) safepoint: Safepoint,
    pub(crate) gc_locker: GcLocker,
    pub(crate) roots: RootSet,

    /// Bumped at every pause; TLABs from an older epoch are discarded
    pub(crate) gc_epoch: AtomicU64,
    pub(crate) total_collections: AtomicU64,
    pub(crate) summary_bytes_used: AtomicUsize,
    pub(crate) bytes_used_during_gc: AtomicUsize,
    pub(crate) gc_active: AtomicBool,
    /// Whether the running pause starts concurrent marking
    pub(crate) concurrent_start_pause: AtomicBool,
    /// Concurrent start requested for the next pause
    pub(crate) initiate_conc_mark: AtomicBool,

    pub(crate) collection_set: Mutex<CollectionSet>,
    pub(crate) evac_failure_regions: EvacFailureRegions,
    pub(crate) evac_failure_bitmap: AtomicBitmap,
    pub(crate) injector: EvacFailureInjector,
    pub(crate) evac_stats: [EvacStats; 2],
    pub(crate) last_age_table: Mutex<AgeTable>,
    pub(crate) humongous_candidates: Mutex<Vec<u32>>,

    pub(crate) workers: WorkerThreads,
    pub(crate) phase_times: PhaseTimes,

    pub(crate) marking: Arc<dyn ConcurrentMark>,
    pub(crate) remset: Arc<dyn RemSet>,
    pub(crate) policy: Arc<dyn Policy>,

    pub(crate) stats: GcStats,
    pub(crate) hash_seed: AtomicU32,
    pub(crate) next_node: AtomicU32,
    pub(crate) service: Mutex<Option<ServiceThread>>,
}

impl Heap {
    /// Start building a heap from `config`
    pub fn builder(config: GcConfig) -> HeapBuilder {
        HeapBuilder::new(config)
    }

    /// Heap with default collaborators and a running service thread
    pub fn with_config(config: GcConfig) -> Result<Arc<Self>, crate::error::HeapError> {
        Self::builder(config).build()
    }

    /// Configuration the heap was built from
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Fixed heap geometry
    pub fn geometry(&self) -> &HeapGeometry {
        &self.geometry
    }

    /// Backing word storage
    pub fn storage(&self) -> &HeapStorage {
        &self.storage
    }

    /// Block offset table
    pub fn bot(&self) -> &BlockOffsetTable {
        &self.bot
    }

    /// Region table and free list
    pub fn manager(&self) -> &RegionManager {
        &self.manager
    }

    /// Region `index`
    #[inline]
    pub fn region(&self, index: u32) -> &Region {
        self.manager.region(index)
    }

    /// Region containing `addr`
    #[inline]
    pub fn region_containing(&self, addr: Address) -> &Region {
        self.manager.region_containing(addr)
    }

    /// Collection set attribute of region `index`
    #[inline]
    pub fn region_attr(&self, index: u32) -> RegionAttr {
        self.attrs.get(index)
    }

    /// Attribute table
    pub fn region_attrs(&self) -> &RegionAttrTable {
        &self.attrs
    }

    /// Mutator and GC alloc regions
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// PLAB statistics of `dest`
    pub fn evac_stats(&self, dest: AllocDest) -> &EvacStats {
        &self.evac_stats[dest.index()]
    }

    /// NUMA nodes regions are spread over
    pub fn num_nodes(&self) -> u32 {
        self.manager.num_nodes()
    }

    /// Marking collaborator
    pub fn marking(&self) -> &dyn ConcurrentMark {
        self.marking.as_ref()
    }

    /// Remembered set collaborator
    pub fn remset(&self) -> &dyn RemSet {
        self.remset.as_ref()
    }

    /// Policy collaborator
    pub fn policy(&self) -> &dyn Policy {
        self.policy.as_ref()
    }

    /// Mutator root table
    pub fn roots(&self) -> &RootSet {
        &self.roots
    }

    /// Safepoint synchronizer
    pub fn safepoint(&self) -> &Safepoint {
        &self.safepoint
    }

    /// GC locker
    pub fn gc_locker(&self) -> &GcLocker {
        &self.gc_locker
    }

    /// GC worker pool
    pub fn workers(&self) -> &WorkerThreads {
        &self.workers
    }

    /// Phase timing of the current or last pause
    pub fn phase_times(&self) -> &PhaseTimes {
        &self.phase_times
    }

    /// Lifetime statistics
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Current collection set
    pub fn collection_set(&self) -> &Mutex<CollectionSet> {
        &self.collection_set
    }

    /// Regions of the increment being evacuated
    pub fn collection_set_increment(&self) -> Vec<u32> {
        self.collection_set.lock().increment().to_vec()
    }

    /// Regions in the collection set so far
    pub fn collection_set_len(&self) -> usize {
        self.collection_set.lock().len()
    }

    /// Humongous regions that are eager reclaim candidates in this pause
    pub fn humongous_candidates(&self) -> Vec<u32> {
        self.humongous_candidates.lock().clone()
    }

    /// Regions that failed evacuation in this pause
    pub fn evac_failure_regions(&self) -> &EvacFailureRegions {
        &self.evac_failure_regions
    }

    /// Objects left in place by the current pause, one bit per heap word
    pub fn evac_failure_bitmap(&self) -> &AtomicBitmap {
        &self.evac_failure_bitmap
    }

    /// Evacuation failure injection for testing the failure path
    pub fn injector(&self) -> &EvacFailureInjector {
        &self.injector
    }

    /// Whether the running pause starts concurrent marking
    pub fn in_concurrent_start(&self) -> bool {
        self.concurrent_start_pause.load(Ordering::Acquire)
    }

    /// Whether a pause is in progress
    pub fn is_gc_active(&self) -> bool {
        self.gc_active.load(Ordering::Acquire)
    }

    /// Young pauses run so far
    pub fn total_collections(&self) -> u64 {
        self.total_collections.load(Ordering::Acquire)
    }

    /// Current GC epoch
    pub fn gc_epoch(&self) -> u64 {
        self.gc_epoch.load(Ordering::Acquire)
    }

    /// Request that the next pause starts a concurrent marking cycle
    pub fn request_concurrent_start(&self) {
        self.initiate_conc_mark.store(true, Ordering::Release);
    }

    /// Young set length, eden plus survivors
    pub fn young_regions_count(&self) -> usize {
        self.young.lock().set.len()
    }

    /// Eden regions
    pub fn eden_regions(&self) -> Vec<u32> {
        self.young.lock().eden.clone()
    }

    /// Survivor regions
    pub fn survivor_regions(&self) -> Vec<u32> {
        self.young.lock().survivors.clone()
    }

    /// Old set length
    pub fn old_regions_count(&self) -> usize {
        self.old_sets.lock().old.len()
    }

    /// Humongous set length
    pub fn humongous_regions_count(&self) -> usize {
        self.old_sets.lock().humongous.len()
    }

    /// Bytes in use
    pub fn used(&self) -> usize {
        self.summary_bytes_used.load(Ordering::Acquire) + self.allocator.used_in_alloc_regions(self)
    }

    pub(crate) fn add_used(&self, bytes: usize) {
        self.summary_bytes_used.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn decrease_used(&self, bytes: usize) {
        let prev = self.summary_bytes_used.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "used bytes underflow: {prev} - {bytes}");
    }

    /// Sum of used bytes over every region in use
    pub(crate) fn recalculate_used_bytes(&self) -> usize {
        self.manager
            .regions()
            .iter()
            .filter(|r| !r.is_free())
            .map(|r| r.used_bytes())
            .sum()
    }

    /// Rebuild the summary after an evacuation failure
    pub(crate) fn recalculate_used(&self) {
        let used = self.recalculate_used_bytes();
        self.summary_bytes_used.store(used, Ordering::Release);
        self.bytes_used_during_gc.store(0, Ordering::Release);
    }

    /// Bytes in active regions
    pub fn capacity_bytes(&self) -> usize {
        self.manager.num_active_regions() as usize * self.geometry.region_bytes
    }

    /// Bytes in committed regions, active or waiting to be uncommitted
    pub fn committed_bytes(&self) -> usize {
        (self.manager.num_active_regions() + self.manager.num_inactive_regions()) as usize
            * self.geometry.region_bytes
    }

    /// Reserved bytes
    pub fn max_capacity_bytes(&self) -> usize {
        self.geometry.max_regions as usize * self.geometry.region_bytes
    }

    /// Invalidate every TLAB handed out before this call
    pub(crate) fn retire_tlabs(&self) {
        let epoch = self.gc_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(target: "regiongc::alloc", epoch, "retired TLABs");
    }

    /// Turn `[addr, addr + words)` into filler and record it in the BOT
    pub(crate) fn fill_with_dummy_object(&self, addr: Address, words: usize) {
        if words == 0 {
            return;
        }
        self.storage.fill_with_filler(addr, words);
        self.bot.update_for_block(addr, addr.offset(words));
    }

    /// Write the header of a newly allocated object
    pub fn init_object(&self, obj: Address, shape: ObjectShape) -> Result<(), AllocError> {
        let layout = shape.encode()?;
        self.storage.init_object(obj, shape, layout);
        self.bot.update_for_block(obj, obj.offset(shape.size_words));
        Ok(())
    }

    pub(crate) fn old_set_add(&self, index: u32) {
        self.old_sets.lock().old.add(self.region(index));
    }

    pub(crate) fn old_set_remove(&self, index: u32) {
        self.old_sets.lock().old.remove(self.region(index));
    }

    pub(crate) fn humongous_set_remove(&self, index: u32) {
        self.old_sets.lock().humongous.remove(self.region(index));
    }

    /// Regions covered by the humongous object starting in `start`
    pub fn humongous_series_len(&self, start: u32) -> u32 {
        debug_assert!(self.region(start).is_starts_humongous());
        let max = self.geometry.max_regions;
        let mut end = start + 1;
        while end < max {
            let region = self.region(end);
            if !region.is_continues_humongous() || region.humongous_start_region() != Some(start) {
                break;
            }
            end += 1;
        }
        end - start
    }

    /// Take a free region of type `ty`, committing one more if none is free
    fn allocate_region_expanding(&self, ty: RegionType, node: Option<u32>) -> Option<u32> {
        if let Some(index) = self.manager.allocate_free_region(ty, node) {
            return Some(index);
        }
        let expanded = match node {
            Some(node) if self.manager.expand_on_preferred_node(node) => 1,
            _ => self.manager.expand_by(1),
        };
        if expanded == 0 {
            return None;
        }
        self.policy.record_new_heap_size(self.manager.num_active_regions());
        tracing::debug!(
            target: "regiongc::alloc",
            region_type = ty.name(),
            active = self.manager.num_active_regions(),
            "expanded heap by one region during a pause"
        );
        self.manager.allocate_free_region(ty, node)
    }

    /// New eden region for a mutator alloc region, within the young target
    pub(crate) fn new_mutator_alloc_region(&self, node: u32, force: bool) -> Option<u32> {
        let mut young = self.young.lock();
        let young_length = young.set.len() as u32;
        let allowed = if force {
            self.policy.can_expand_young_list(young_length)
        } else {
            self.policy.should_allocate_mutator_region(young_length)
        };
        if !allowed {
            return None;
        }
        let index = self.manager.allocate_free_region(RegionType::Eden, Some(node))?;
        young.set.add(self.region(index));
        young.eden.push(index);
        tracing::trace!(target: "regiongc::region", region = index, node, "FREE -> EDEN");
        Some(index)
    }

    pub(crate) fn retire_mutator_alloc_region(&self, index: u32, allocated_bytes: usize) {
        self.add_used(allocated_bytes);
        tracing::trace!(target: "regiongc::region", region = index, allocated_bytes, "retire EDEN");
    }

    /// New survivor or old region for GC allocation during a pause
    pub(crate) fn new_gc_alloc_region(&self, dest: AllocDest, node: u32) -> Option<u32> {
        match dest {
            AllocDest::Young => {
                let mut young = self.young.lock();
                if young.survivors.len() as u32 >= self.policy.max_survivor_regions() {
                    return None;
                }
                let index = self.allocate_region_expanding(RegionType::Survivor, Some(node))?;
                self.attrs.set(index, RegionAttr::NewSurvivor);
                young.set.add(self.region(index));
                young.survivors.push(index);
                tracing::trace!(target: "regiongc::region", region = index, node, "FREE -> SURV");
                Some(index)
            }
            AllocDest::Old => {
                let index = self.allocate_region_expanding(RegionType::Old, None)?;
                tracing::trace!(target: "regiongc::region", region = index, "FREE -> OLD");
                Some(index)
            }
        }
    }

    pub(crate) fn retire_gc_alloc_region(&self, index: u32, allocated_bytes: usize, dest: AllocDest, waste_words: usize) {
        self.bytes_used_during_gc
            .fetch_add(allocated_bytes, Ordering::AcqRel);
        if waste_words > 0 {
            self.evac_stats(dest).add_region_end_waste(waste_words);
        }
        match dest {
            // Survivors of a concurrent start pause are marking roots.
            AllocDest::Young if self.in_concurrent_start() => self.marking.add_root_region(index),
            AllocDest::Young => {}
            AllocDest::Old => self.old_set_add(index),
        }
        tracing::trace!(
            target: "regiongc::region",
            region = index,
            allocated_bytes,
            waste_words,
            dest = ?dest,
            "retire GC alloc region"
        );
    }

    /// Relabel last pause's survivors as eden of the next collection set.
    ///
    /// Returns the number of survivor regions.
    pub(crate) fn transfer_survivors_to_eden(&self) -> usize {
        let mut young = self.young.lock();
        debug_assert!(young.eden.is_empty());
        let survivors = std::mem::take(&mut young.survivors);
        for &index in &survivors {
            self.region(index).set_eden_from_survivor();
        }
        let count = survivors.len();
        young.eden = survivors;
        count
    }

    /// Check heap consistency; the world must be stopped
    pub fn verify(&self) -> Result<(), VerifyError> {
        HeapVerifier::new(self).verify()
    }

    /// Identity hash for a new hashed object, never zero
    pub(crate) fn next_identity_hash(&self) -> u32 {
        let n = self.hash_seed.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        match n.wrapping_mul(0x9E37_79B9) {
            0 => 1,
            hash => hash,
        }
    }

    /// Stop the service thread; later drops of the heap do not wait for it
    pub fn shutdown(&self) {
        if let Some(service) = self.service.lock().take() {
            service.stop();
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if let Some(service) = self.service.get_mut().take() {
            service.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::SetKind;

    fn heap() -> Arc<Heap> {
        Heap::builder(GcConfig {
            region_size_bytes: 64 * 1024,
            initial_heap_bytes: 512 * 1024,
            max_heap_bytes: 1024 * 1024,
            parallel_gc_threads: 2,
            ..Default::default()
        })
        .service_thread(false)
        .build()
        .unwrap()
    }

    #[test]
    fn test_build_commits_initial_regions() {
        let heap = heap();
        assert_eq!(heap.manager().num_active_regions(), 8);
        assert_eq!(heap.manager().num_free_regions(), 8);
        assert_eq!(heap.capacity_bytes(), 512 * 1024);
        assert_eq!(heap.used(), 0);
        heap.verify().unwrap();
    }

    #[test]
    fn test_mutator_region_joins_young_set() {
        let heap = heap();
        let index = heap.new_mutator_alloc_region(0, false).unwrap();
        let region = heap.region(index);
        assert!(region.is_eden());
        assert_eq!(region.containing_set(), SetKind::Young);
        assert_eq!(heap.eden_regions(), vec![index]);
        assert_eq!(heap.young_regions_count(), 1);
    }

    #[test]
    fn test_survivor_cap() {
        let heap = heap();
        let cap = heap.policy().max_survivor_regions() as usize;
        let mut taken = Vec::new();
        while let Some(index) = heap.new_gc_alloc_region(AllocDest::Young, 0) {
            taken.push(index);
        }
        assert_eq!(taken.len(), cap);
        assert!(taken.iter().all(|&r| heap.region_attr(r) == RegionAttr::NewSurvivor));
        assert_eq!(heap.transfer_survivors_to_eden(), cap);
        assert!(taken.iter().all(|&r| heap.region(r).is_eden()));
    }

    #[test]
    fn test_old_gc_region_expands_when_free_list_is_empty() {
        let heap = heap();
        let mut taken = 0;
        while heap.new_gc_alloc_region(AllocDest::Old, 0).is_some() {
            taken += 1;
        }
        assert_eq!(taken, 16);
        assert_eq!(heap.manager().num_active_regions(), 16);
    }

    #[test]
    fn test_dummy_object_is_parsable_and_recorded_in_bot() {
        let heap = heap();
        let index = heap.new_gc_alloc_region(AllocDest::Old, 0).unwrap();
        let region = heap.region(index);
        let (addr, words) = region.par_allocate(300, 300).unwrap();
        heap.fill_with_dummy_object(addr, words);
        assert!(heap.storage().is_filler(addr));
        assert_eq!(heap.storage().block_size(addr), 300);
        assert_eq!(heap.bot().block_start(heap.storage(), addr.offset(200)), addr);
    }

    #[test]
    fn test_identity_hash_is_never_zero() {
        let heap = heap();
        for _ in 0..1000 {
            assert_ne!(heap.next_identity_hash(), 0);
        }
    }
}
