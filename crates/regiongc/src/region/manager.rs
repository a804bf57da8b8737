//! Region manager: the region table, commit state and the free list
//!
//! ## Design
//!
//! - **Region table**: every reserved region exists from construction on and
//!   is addressed by index; nothing is ever deallocated.
//! - **Commit state**: regions are `Uncommitted`, `Active` or `Inactive`.
//!   Shrinking turns free active regions inactive; the service thread later
//!   uncommits them. Expansion reactivates inactive regions before committing
//!   new ones.
//! - **Locking**: all free-list and commit-state changes happen under one
//!   mutex (the free-list lock), so callers may use the manager from mutator
//!   threads or from GC workers during a pause.

use parking_lot::{Mutex, MutexGuard};

use crate::address::Address;
use crate::config::HeapGeometry;

use super::heap_region::Region;
use super::region_set::FreeRegionList;
use super::region_type::RegionType;

/// Commit state of a reserved region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    /// Not backed by memory
    Uncommitted,
    /// Committed and usable
    Active,
    /// Committed but withheld from allocation, waiting to be uncommitted
    Inactive,
}

struct ManagerState {
    free_list: FreeRegionList,
    commit: Vec<CommitState>,
    num_active: u32,
    num_inactive: u32,
}

/// Owner of the region table and the free region list
pub struct RegionManager {
    geometry: HeapGeometry,
    num_nodes: u32,
    regions: Box<[Region]>,
    state: Mutex<ManagerState>,
}

impl RegionManager {
    /// Create the region table; nothing is committed yet
    pub fn new(geometry: HeapGeometry, num_nodes: usize) -> Self {
        let num_nodes = num_nodes.max(1) as u32;
        let regions = (0..geometry.max_regions)
            .map(|i| {
                Region::new(
                    i,
                    geometry.region_bottom(i),
                    geometry.region_words,
                    i % num_nodes,
                )
            })
            .collect();
        Self {
            geometry,
            num_nodes,
            regions,
            state: Mutex::new(ManagerState {
                free_list: FreeRegionList::new(num_nodes as usize),
                commit: vec![CommitState::Uncommitted; geometry.max_regions as usize],
                num_active: 0,
                num_inactive: 0,
            }),
        }
    }

    /// Heap geometry
    pub fn geometry(&self) -> &HeapGeometry {
        &self.geometry
    }

    /// Number of NUMA nodes
    pub fn num_nodes(&self) -> u32 {
        self.num_nodes
    }

    /// Region `index`
    #[inline]
    pub fn region(&self, index: u32) -> &Region {
        &self.regions[index as usize]
    }

    /// All reserved regions
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Region containing `addr`
    #[inline]
    pub fn region_containing(&self, addr: Address) -> &Region {
        self.region(self.geometry.region_index(addr))
    }

    /// Reserved region count
    pub fn max_length(&self) -> u32 {
        self.geometry.max_regions
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock()
    }

    /// Committed and active regions
    pub fn num_active_regions(&self) -> u32 {
        self.lock().num_active
    }

    /// Committed but inactive regions
    pub fn num_inactive_regions(&self) -> u32 {
        self.lock().num_inactive
    }

    /// Regions that could still be made active
    pub fn available(&self) -> u32 {
        let state = self.lock();
        self.geometry.max_regions - state.num_active
    }

    /// Free regions on the free list
    pub fn num_free_regions(&self) -> u32 {
        self.lock().free_list.len() as u32
    }

    /// Free regions on `node`
    pub fn num_free_regions_on_node(&self, node: u32) -> u32 {
        self.lock().free_list.len_on_node(node) as u32
    }

    /// Commit state of region `index`
    pub fn commit_state(&self, index: u32) -> CommitState {
        self.lock().commit[index as usize]
    }

    /// Whether region `index` is committed and active
    pub fn is_available(&self, index: u32) -> bool {
        self.commit_state(index) == CommitState::Active
    }

    /// Take a free region and give it type `ty`.
    ///
    /// Young regions come from the tail of the free list, others from the head.
    pub fn allocate_free_region(&self, ty: RegionType, node: Option<u32>) -> Option<u32> {
        debug_assert!(!ty.is_humongous() && ty != RegionType::Free);
        let mut state = self.lock();
        let index = state
            .free_list
            .remove_region(&self.regions, !ty.is_young(), node)?;
        drop(state);
        let region = self.region(index);
        match ty {
            RegionType::Eden => region.set_eden(),
            RegionType::Survivor => region.set_survivor(),
            _ => region.set_old(),
        }
        Some(index)
    }

    fn activate(&self, state: &mut ManagerState, index: u32) {
        let prev = state.commit[index as usize];
        debug_assert_ne!(prev, CommitState::Active);
        if prev == CommitState::Inactive {
            state.num_inactive -= 1;
        }
        state.commit[index as usize] = CommitState::Active;
        state.num_active += 1;
        let region = self.region(index);
        region.hr_clear();
        state.free_list.add_ordered(region);
    }

    /// Make up to `num_regions` more regions active; returns how many were added.
    ///
    /// Inactive regions are reused before uncommitted ones are committed.
    pub fn expand_by(&self, num_regions: u32) -> u32 {
        let mut state = self.lock();
        let mut expanded = 0;
        for wanted in [CommitState::Inactive, CommitState::Uncommitted] {
            for index in 0..self.geometry.max_regions {
                if expanded == num_regions {
                    return expanded;
                }
                if state.commit[index as usize] == wanted {
                    self.activate(&mut state, index);
                    expanded += 1;
                }
            }
        }
        expanded
    }

    /// Activate one region on `node` if any is available there
    pub fn expand_on_preferred_node(&self, node: u32) -> bool {
        let mut state = self.lock();
        let candidate = (0..self.geometry.max_regions)
            .filter(|&i| state.commit[i as usize] != CommitState::Active)
            .find(|&i| self.region(i).node_index() == node);
        match candidate {
            Some(index) => {
                self.activate(&mut state, index);
                true
            }
            None => false,
        }
    }

    fn find_contiguous(
        &self,
        state: &ManagerState,
        num_regions: u32,
        allow_inactive: bool,
    ) -> Option<u32> {
        let max = self.geometry.max_regions;
        let usable = |i: u32| match state.commit[i as usize] {
            CommitState::Active => state.free_list.contains(i),
            _ => allow_inactive,
        };
        let mut start = 0;
        while start + num_regions <= max {
            match (start..start + num_regions).rev().find(|&i| !usable(i)) {
                None => return Some(start),
                Some(blocker) => start = blocker + 1,
            }
        }
        None
    }

    /// Take `num_regions` contiguous free regions; returns the first index.
    ///
    /// The regions are removed from the free list but keep type `Free`;
    /// the caller relabels them as humongous.
    pub fn allocate_humongous(&self, num_regions: u32) -> Option<u32> {
        let mut state = self.lock();
        let start = self.find_contiguous(&state, num_regions, false)?;
        for index in start..start + num_regions {
            state.free_list.remove(self.region(index));
        }
        Some(start)
    }

    /// Like `allocate_humongous`, committing regions to form the run if needed
    pub fn expand_and_allocate_humongous(&self, num_regions: u32) -> Option<u32> {
        let mut state = self.lock();
        let start = self.find_contiguous(&state, num_regions, true)?;
        for index in start..start + num_regions {
            if state.commit[index as usize] != CommitState::Active {
                self.activate(&mut state, index);
            }
            state.free_list.remove(self.region(index));
        }
        tracing::debug!(
            target: "regiongc::alloc",
            start,
            num_regions,
            "expanded heap for humongous allocation"
        );
        Some(start)
    }

    /// Return `region` to the free list; it must already be cleared
    pub fn insert_into_free_list(&self, index: u32) {
        let mut state = self.lock();
        state.free_list.add_ordered(self.region(index));
    }

    /// Return a batch of cleared regions to the free list under one lock hold
    pub fn insert_all_into_free_list(&self, indices: &[u32]) {
        if indices.is_empty() {
            return;
        }
        let mut state = self.lock();
        for &index in indices {
            state.free_list.add_ordered(self.region(index));
        }
    }

    /// Deactivate up to `num_regions` free regions, highest indices first
    pub fn shrink_by(&self, num_regions: u32) -> u32 {
        let mut state = self.lock();
        let victims: Vec<u32> = state
            .free_list
            .iter()
            .rev()
            .take(num_regions as usize)
            .collect();
        for &index in &victims {
            let region = self.region(index);
            state.free_list.remove(region);
            assert!(region.is_free() && region.is_empty());
            state.commit[index as usize] = CommitState::Inactive;
            state.num_active -= 1;
            state.num_inactive += 1;
        }
        victims.len() as u32
    }

    /// Uncommit up to `limit` inactive regions, returning the uncommitted indices.
    ///
    /// `release` runs for each region while the lock is held, so the memory
    /// cannot be recommitted while it is being released.
    pub fn uncommit_inactive_regions(&self, limit: u32, mut release: impl FnMut(&Region)) -> Vec<u32> {
        let mut state = self.lock();
        let mut uncommitted = Vec::new();
        for index in 0..self.geometry.max_regions {
            if uncommitted.len() as u32 == limit {
                break;
            }
            if state.commit[index as usize] == CommitState::Inactive {
                let region = self.region(index);
                assert!(region.is_free(), "uncommitting non-free region {index}");
                release(region);
                state.commit[index as usize] = CommitState::Uncommitted;
                state.num_inactive -= 1;
                uncommitted.push(index);
            }
        }
        uncommitted
    }

    /// Whether inactive regions are waiting to be uncommitted
    pub fn has_inactive_regions(&self) -> bool {
        self.lock().num_inactive > 0
    }

    /// Indices on the free list, ascending
    pub fn free_list_snapshot(&self) -> Vec<u32> {
        self.lock().free_list.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;

    fn manager(regions: usize, initial: usize, nodes: usize) -> RegionManager {
        let config = GcConfig {
            region_size_bytes: 64 * 1024,
            max_heap_bytes: regions * 64 * 1024,
            initial_heap_bytes: initial * 64 * 1024,
            ..Default::default()
        };
        let manager = RegionManager::new(config.validate().unwrap(), nodes);
        manager.expand_by(initial as u32);
        manager
    }

    #[test]
    fn test_expand_and_allocate() {
        let m = manager(8, 4, 1);
        assert_eq!(m.num_active_regions(), 4);
        assert_eq!(m.num_free_regions(), 4);
        let eden = m.allocate_free_region(RegionType::Eden, None).unwrap();
        assert_eq!(eden, 3);
        assert!(m.region(eden).is_eden());
        let old = m.allocate_free_region(RegionType::Old, None).unwrap();
        assert_eq!(old, 0);
        assert_eq!(m.expand_by(10), 4);
        assert_eq!(m.available(), 0);
    }

    #[test]
    fn test_humongous_needs_contiguous_run() {
        let m = manager(8, 8, 1);
        m.allocate_free_region(RegionType::Old, None).unwrap(); // 0
        let blocker = m.allocate_free_region(RegionType::Eden, None).unwrap(); // 7
        assert_eq!(blocker, 7);
        assert_eq!(m.allocate_humongous(6), Some(1));
        assert_eq!(m.num_free_regions(), 0);
        assert_eq!(m.allocate_humongous(1), None);
    }

    #[test]
    fn test_expand_for_humongous() {
        let m = manager(8, 2, 1);
        assert_eq!(m.allocate_humongous(4), None);
        let start = m.expand_and_allocate_humongous(4).unwrap();
        assert_eq!(start, 0);
        assert_eq!(m.num_active_regions(), 4);
        assert_eq!(m.num_free_regions(), 0);
    }

    #[test]
    fn test_shrink_then_uncommit_then_reactivate() {
        let m = manager(8, 8, 1);
        assert_eq!(m.shrink_by(3), 3);
        assert_eq!(m.num_inactive_regions(), 3);
        assert_eq!(m.commit_state(7), CommitState::Inactive);
        let mut released = 0;
        assert_eq!(m.uncommit_inactive_regions(2, |_| released += 1), vec![5, 6]);
        assert_eq!(released, 2);
        assert_eq!(m.num_inactive_regions(), 1);
        assert_eq!(m.expand_by(1), 1);
        // The inactive region is reused before uncommitted ones.
        assert_eq!(m.commit_state(7), CommitState::Active);
        assert_eq!(m.commit_state(5), CommitState::Uncommitted);
    }

    #[test]
    fn test_numa_striping() {
        let m = manager(8, 8, 2);
        let r = m.allocate_free_region(RegionType::Survivor, Some(0)).unwrap();
        assert_eq!(m.region(r).node_index(), 0);
        assert_eq!(m.num_free_regions_on_node(0), 3);
        assert_eq!(m.num_free_regions_on_node(1), 4);
        assert!(!m.expand_on_preferred_node(1));
    }
}
