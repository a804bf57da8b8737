//! Regions, region sets and the region manager

mod attr;
mod heap_region;
mod manager;
mod region_set;
mod region_type;

pub use attr::{RegionAttr, RegionAttrTable};
pub use heap_region::Region;
pub use manager::{CommitState, RegionManager};
pub use region_set::{FreeRegionList, RegionSet};
pub use region_type::{RegionType, SetKind};
