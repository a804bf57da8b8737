//! Region sets
//!
//! Membership is recorded twice: the set keeps its length (and the free
//! list its ordered indices), and every member region carries the set's tag.
//! Adding a region that is already tagged, or removing one tagged for a
//! different set, is a fatal consistency error.

use std::collections::BTreeSet;

use super::heap_region::Region;
use super::region_type::SetKind;

/// Counting set of regions identified by their containing-set tag
#[derive(Debug)]
pub struct RegionSet {
    kind: SetKind,
    length: usize,
}

impl RegionSet {
    /// Empty set of kind `kind`
    pub fn new(kind: SetKind) -> Self {
        Self { kind, length: 0 }
    }

    /// Set kind
    pub fn kind(&self) -> SetKind {
        self.kind
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether the set has no members
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Add `region`
    pub fn add(&mut self, region: &Region) {
        region.set_containing_set(self.kind);
        self.length += 1;
    }

    /// Remove `region`
    pub fn remove(&mut self, region: &Region) {
        region.clear_containing_set(self.kind);
        assert!(self.length > 0, "{} set underflow", self.kind.name());
        self.length -= 1;
    }

    /// Account for `count` members whose tags were already cleared individually
    pub fn bulk_forget(&mut self, count: usize) {
        assert!(count <= self.length, "{} set underflow", self.kind.name());
        self.length -= count;
    }
}

/// Ordered list of free regions with per-node accounting.
///
/// Young regions are taken from the tail and old regions from the head so
/// long-lived data clusters at low addresses.
#[derive(Debug)]
pub struct FreeRegionList {
    regions: BTreeSet<u32>,
    node_lengths: Vec<usize>,
}

impl FreeRegionList {
    /// Empty list for `num_nodes` NUMA nodes
    pub fn new(num_nodes: usize) -> Self {
        Self {
            regions: BTreeSet::new(),
            node_lengths: vec![0; num_nodes.max(1)],
        }
    }

    /// Number of free regions
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Free regions on `node`
    pub fn len_on_node(&self, node: u32) -> usize {
        self.node_lengths.get(node as usize).copied().unwrap_or(0)
    }

    /// Whether region `index` is on the list
    pub fn contains(&self, index: u32) -> bool {
        self.regions.contains(&index)
    }

    /// Insert `region` keeping index order
    pub fn add_ordered(&mut self, region: &Region) {
        debug_assert!(region.is_free(), "region {} is not free", region.index());
        region.set_containing_set(SetKind::Free);
        let inserted = self.regions.insert(region.index());
        debug_assert!(inserted);
        self.node_lengths[region.node_index() as usize] += 1;
    }

    /// Remove a specific `region`
    pub fn remove(&mut self, region: &Region) {
        region.clear_containing_set(SetKind::Free);
        let removed = self.regions.remove(&region.index());
        assert!(removed, "region {} not on the free list", region.index());
        self.node_lengths[region.node_index() as usize] -= 1;
    }

    /// Remove a region, preferring one on `node` (any node when `None`)
    pub fn remove_region(&mut self, regions: &[Region], from_head: bool, node: Option<u32>) -> Option<u32> {
        let pick = |index: &&u32| match node {
            Some(node) => regions[**index as usize].node_index() == node,
            None => true,
        };
        let found = if node.is_some_and(|n| self.len_on_node(n) > 0) || node.is_none() {
            if from_head {
                self.regions.iter().find(pick).copied()
            } else {
                self.regions.iter().rev().find(pick).copied()
            }
        } else {
            None
        };
        // Fall back to any node rather than failing.
        let index = found.or_else(|| {
            if from_head {
                self.regions.first().copied()
            } else {
                self.regions.last().copied()
            }
        })?;
        self.remove(&regions[index as usize]);
        Some(index)
    }

    /// Free region indices in ascending order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = u32> + '_ {
        self.regions.iter().copied()
    }
}
