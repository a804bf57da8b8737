//! Region type and containing-set tags

/// Type of a region
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionType {
    /// Unused, on the free list (or not committed)
    Free = 0,
    /// Receives new mutator allocations
    Eden = 1,
    /// Receives objects surviving a young pause
    Survivor = 2,
    /// Tenured objects
    Old = 3,
    /// First region of a humongous object
    StartsHumongous = 4,
    /// Tail region of a humongous object
    ContinuesHumongous = 5,
}

impl RegionType {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => RegionType::Free,
            1 => RegionType::Eden,
            2 => RegionType::Survivor,
            3 => RegionType::Old,
            4 => RegionType::StartsHumongous,
            _ => RegionType::ContinuesHumongous,
        }
    }

    /// Eden or survivor
    pub fn is_young(self) -> bool {
        matches!(self, RegionType::Eden | RegionType::Survivor)
    }

    /// Starts or continues a humongous object
    pub fn is_humongous(self) -> bool {
        matches!(
            self,
            RegionType::StartsHumongous | RegionType::ContinuesHumongous
        )
    }

    /// Old or humongous: regions whose references are tracked by remembered sets
    pub fn is_old_or_humongous(self) -> bool {
        self == RegionType::Old || self.is_humongous()
    }

    /// Short name for logs and errors
    pub fn name(self) -> &'static str {
        match self {
            RegionType::Free => "FREE",
            RegionType::Eden => "EDEN",
            RegionType::Survivor => "SURV",
            RegionType::Old => "OLD",
            RegionType::StartsHumongous => "HUMS",
            RegionType::ContinuesHumongous => "HUMC",
        }
    }
}

/// The region set a region currently belongs to
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetKind {
    /// Not a member of any set
    None = 0,
    /// Free region list
    Free = 1,
    /// Eden and survivor regions
    Young = 2,
    /// Old region set
    Old = 3,
    /// Humongous region set
    Humongous = 4,
}

impl SetKind {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => SetKind::Free,
            2 => SetKind::Young,
            3 => SetKind::Old,
            4 => SetKind::Humongous,
            _ => SetKind::None,
        }
    }

    /// Set name for logs and errors
    pub fn name(self) -> &'static str {
        match self {
            SetKind::None => "none",
            SetKind::Free => "free",
            SetKind::Young => "young",
            SetKind::Old => "old",
            SetKind::Humongous => "humongous",
        }
    }
}
