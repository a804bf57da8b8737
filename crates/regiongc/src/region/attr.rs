//! Per-region attribute table consulted on every scanned reference

use std::sync::atomic::{AtomicU8, Ordering};

/// What evacuation should do with references into a region
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionAttr {
    /// Not being collected
    NotInCset = 0,
    /// Young region in the collection set
    Young = 1,
    /// Old region in the collection set
    Old = 2,
    /// Old region that may be evacuated in a later increment of this pause
    Optional = 3,
    /// Humongous object that is reclaimed unless a reference to it is found
    HumongousCandidate = 4,
    /// Survivor region allocated during this pause
    NewSurvivor = 5,
}

impl RegionAttr {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RegionAttr::Young,
            2 => RegionAttr::Old,
            3 => RegionAttr::Optional,
            4 => RegionAttr::HumongousCandidate,
            5 => RegionAttr::NewSurvivor,
            _ => RegionAttr::NotInCset,
        }
    }

    /// Objects in the region are copied when reached
    #[inline]
    pub fn is_in_cset(self) -> bool {
        matches!(self, RegionAttr::Young | RegionAttr::Old)
    }
}

/// Table of `RegionAttr` indexed by region
pub struct RegionAttrTable {
    attrs: Box<[AtomicU8]>,
}

impl RegionAttrTable {
    /// Table for `max_regions` regions, all `NotInCset`
    pub fn new(max_regions: u32) -> Self {
        Self {
            attrs: (0..max_regions)
                .map(|_| AtomicU8::new(RegionAttr::NotInCset as u8))
                .collect(),
        }
    }

    /// Attribute of region `index`
    #[inline]
    pub fn get(&self, index: u32) -> RegionAttr {
        RegionAttr::from_u8(self.attrs[index as usize].load(Ordering::Acquire))
    }

    /// Set the attribute of region `index`
    #[inline]
    pub fn set(&self, index: u32, attr: RegionAttr) {
        self.attrs[index as usize].store(attr as u8, Ordering::Release);
    }

    /// Reset region `index` to `NotInCset`
    pub fn clear(&self, index: u32) {
        self.set(index, RegionAttr::NotInCset);
    }

    /// Drop the humongous candidate flag; returns whether this call did it
    pub fn clear_humongous_candidate(&self, index: u32) -> bool {
        self.attrs[index as usize]
            .compare_exchange(
                RegionAttr::HumongousCandidate as u8,
                RegionAttr::NotInCset as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Reset every region to `NotInCset`
    pub fn clear_all(&self) {
        for attr in self.attrs.iter() {
            attr.store(RegionAttr::NotInCset as u8, Ordering::Relaxed);
        }
    }

    /// Regions whose attribute is not `NotInCset`
    pub fn non_default(&self) -> impl Iterator<Item = (u32, RegionAttr)> + '_ {
        (0..self.attrs.len() as u32)
            .map(|i| (i, self.get(i)))
            .filter(|(_, a)| *a != RegionAttr::NotInCset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_humongous_candidate_cleared_once() {
        let table = RegionAttrTable::new(4);
        table.set(1, RegionAttr::HumongousCandidate);
        assert!(table.clear_humongous_candidate(1));
        assert!(!table.clear_humongous_candidate(1));
        assert_eq!(table.get(1), RegionAttr::NotInCset);
    }

    #[test]
    fn test_cset_membership() {
        let table = RegionAttrTable::new(4);
        table.set(0, RegionAttr::Young);
        table.set(2, RegionAttr::Optional);
        assert!(table.get(0).is_in_cset());
        assert!(!table.get(2).is_in_cset());
        assert_eq!(table.non_default().count(), 2);
        table.clear_all();
        assert_eq!(table.non_default().count(), 0);
    }
}
