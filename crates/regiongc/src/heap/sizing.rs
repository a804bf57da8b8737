//! Heap expansion and shrinking
//!
//! Expansion activates regions, reusing inactive ones first. Shrinking only
//! deactivates free regions; their memory is given back later by the service
//! thread in bounded steps.

use std::time::Duration;

use crate::service::ServiceTask;

use super::Heap;

impl Heap {
    /// Activate regions for at least `bytes`; returns the number added
    pub fn expand(&self, bytes: usize) -> u32 {
        let region_bytes = self.geometry.region_bytes;
        let wanted = u32::try_from(bytes.max(1).div_ceil(region_bytes)).unwrap_or(u32::MAX);
        let expanded = self.manager.expand_by(wanted);
        if expanded > 0 {
            let active = self.manager.num_active_regions();
            self.policy.record_new_heap_size(active);
            tracing::debug!(
                target: "regiongc::alloc",
                requested_bytes = bytes,
                regions = expanded,
                capacity = active as usize * region_bytes,
                "expanded heap"
            );
        }
        expanded
    }

    /// Deactivate free regions for up to `bytes`, keeping room for the young
    /// target; returns the number removed
    pub fn shrink(&self, bytes: usize) -> u32 {
        let region_bytes = self.geometry.region_bytes;
        let wanted = u32::try_from(bytes / region_bytes).unwrap_or(u32::MAX);
        if wanted == 0 {
            return 0;
        }
        let young_len = self.young.lock().set.len() as u32;
        let young_reserve = self
            .policy
            .young_list_target_length()
            .saturating_sub(young_len);
        let removable = self
            .manager
            .num_free_regions()
            .saturating_sub(young_reserve);
        let shrunk = self.manager.shrink_by(wanted.min(removable));
        if shrunk > 0 {
            let active = self.manager.num_active_regions();
            self.policy.record_new_heap_size(active);
            tracing::debug!(
                target: "regiongc::alloc",
                requested_bytes = bytes,
                regions = shrunk,
                capacity = active as usize * region_bytes,
                "shrunk heap"
            );
            if let Some(service) = self.service.lock().as_ref() {
                service.schedule(ServiceTask::UncommitRegion, Duration::ZERO);
            }
        }
        shrunk
    }

    /// Grow or shrink after a young pause as the policy asks
    pub(crate) fn resize_after_young_collection(&self) {
        let capacity = self.capacity_bytes();
        let expand_bytes = self.policy.young_collection_expansion_amount(capacity);
        if expand_bytes > 0 {
            self.expand(expand_bytes);
            return;
        }
        let shrink_bytes = self.policy.shrink_amount(capacity, self.used());
        if shrink_bytes > 0 {
            self.shrink(shrink_bytes);
        }
    }

    /// Uncommit up to `limit` inactive regions; returns how many were uncommitted
    pub fn uncommit_regions(&self, limit: u32) -> usize {
        let region_words = self.geometry.region_words;
        let uncommitted = self
            .manager
            .uncommit_inactive_regions(limit, |region| self.storage.zero(region.bottom(), region_words));
        if !uncommitted.is_empty() {
            self.stats.record_uncommit(uncommitted.len());
            tracing::debug!(
                target: "regiongc::alloc",
                regions = uncommitted.len(),
                remaining = self.manager.num_inactive_regions(),
                "uncommitted regions"
            );
        }
        uncommitted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::region::CommitState;
    use std::sync::Arc;

    fn heap() -> Arc<Heap> {
        Heap::builder(GcConfig {
            region_size_bytes: 64 * 1024,
            initial_heap_bytes: 256 * 1024,
            max_heap_bytes: 1024 * 1024,
            parallel_gc_threads: 1,
            ..Default::default()
        })
        .service_thread(false)
        .build()
        .unwrap()
    }

    #[test]
    fn test_expand_rounds_up_to_regions() {
        let heap = heap();
        assert_eq!(heap.expand(64 * 1024 + 1), 2);
        assert_eq!(heap.manager().num_active_regions(), 6);
        assert_eq!(heap.expand(usize::MAX / 2), 10);
        assert_eq!(heap.expand(1), 0);
    }

    #[test]
    fn test_huge_requests_are_clamped() {
        let heap = heap();
        assert_eq!(heap.expand(usize::MAX), 12);
        assert_eq!(heap.manager().num_active_regions(), 16);
        let shrunk = heap.shrink(usize::MAX);
        assert!(shrunk > 0);
        assert_eq!(heap.manager().num_inactive_regions(), shrunk);
    }

    #[test]
    fn test_shrink_then_uncommit() {
        let heap = heap();
        heap.expand(4 * 64 * 1024);
        let young_target = heap.policy().young_list_target_length();
        let shrunk = heap.shrink(6 * 64 * 1024);
        assert!(shrunk > 0);
        assert!(heap.manager().num_free_regions() >= young_target);
        assert_eq!(heap.manager().num_inactive_regions(), shrunk);
        assert_eq!(heap.committed_bytes(), 8 * 64 * 1024);

        assert_eq!(heap.uncommit_regions(1), 1);
        assert_eq!(heap.uncommit_regions(u32::MAX), shrunk as usize - 1);
        assert!(!heap.manager().has_inactive_regions());
        assert_eq!(heap.stats().snapshot().regions_uncommitted, shrunk as u64);
        let uncommitted = (0..heap.geometry().max_regions)
            .filter(|&i| heap.manager().commit_state(i) == CommitState::Uncommitted)
            .count();
        assert_eq!(uncommitted, 16 - 8 + shrunk as usize);
        heap.verify().unwrap();
    }

    #[test]
    fn test_expansion_reuses_inactive_regions_first() {
        let heap = heap();
        heap.expand(4 * 64 * 1024);
        let shrunk = heap.shrink(2 * 64 * 1024);
        assert_eq!(shrunk, 2);
        assert_eq!(heap.expand(64 * 1024), 1);
        assert_eq!(heap.manager().num_inactive_regions(), 1);
    }
}
