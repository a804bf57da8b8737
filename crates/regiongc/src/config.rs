//! Heap configuration and derived geometry
//!
//! `GcConfig` is the user-facing, serde-loadable knob set. Validating it
//! produces a `HeapGeometry`: the sizes every other component reads and that
//! never change after the heap is constructed.

use serde::{Deserialize, Serialize};

use crate::address::{Address, WORD_SIZE};
use crate::error::ConfigError;

/// Bytes covered by one card (card table and block offset table granularity)
pub const CARD_SIZE_BYTES: usize = 512;

/// Words covered by one card
pub const CARD_WORDS: usize = CARD_SIZE_BYTES / WORD_SIZE;

const MIN_REGION_SIZE: usize = 4 * 1024;
const MAX_REGION_SIZE: usize = 32 * 1024 * 1024;

/// Garbage collector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Region size in bytes, power of two (default: 1MB)
    pub region_size_bytes: usize,
    /// Committed heap size at startup (default: 16MB)
    pub initial_heap_bytes: usize,
    /// Reserved heap size (default: 64MB)
    pub max_heap_bytes: usize,
    /// Worker threads used by pause tasks (default: 4)
    pub parallel_gc_threads: usize,
    /// Simulated NUMA nodes; regions are striped across them (default: 1)
    pub numa_nodes: usize,
    /// Pause time goal in milliseconds (default: 200)
    pub max_pause_time_ms: f64,
    /// Lower bound of the young generation in percent of committed regions
    pub young_percent_min: usize,
    /// Upper bound of the young generation in percent of committed regions
    pub young_percent_max: usize,
    /// Ratio of eden to one survivor space (default: 8)
    pub survivor_ratio: usize,
    /// Oldest age an object may reach before promotion (default: 15)
    pub max_tenuring_threshold: u8,
    /// Desired survivor occupancy in percent after a pause (default: 50)
    pub target_survivor_ratio: usize,
    /// Adapt PLAB sizes between pauses (default: true)
    pub resize_plab: bool,
    /// Initial PLAB size for survivor destinations, in words
    pub young_plab_size_words: usize,
    /// Initial PLAB size for old destinations, in words
    pub old_plab_size_words: usize,
    /// Waste in percent tolerated when retiring a PLAB (default: 10)
    pub parallel_gc_buffer_waste_pct: usize,
    /// Target PLAB waste in percent of PLAB allocation (default: 10)
    pub target_plab_waste_pct: usize,
    /// Expected occupancy in percent of the last PLAB of a worker (default: 50)
    pub last_plab_average_occupancy: usize,
    /// Weight in percent of the newest sample in PLAB size averages (default: 75)
    pub plab_weight: u32,
    /// Thread-local allocation buffer size in words (default: 1024)
    pub tlab_size_words: usize,
    /// Minimum heap expansion in bytes (default: one region)
    pub min_heap_delta_bytes: usize,
    /// Wanted ratio of mutator time to GC time (default: 12)
    pub gc_time_ratio: usize,
    /// Free percentage above which `shrink_amount` proposes shrinking
    pub max_heap_free_ratio: usize,
    /// Regions uncommitted per service-thread step (default: 16)
    pub uncommit_size_limit_regions: usize,
    /// Remembered set sampling interval in milliseconds (default: 300)
    pub service_interval_ms: u64,
    /// Warn every N retries of the allocation slow path, 0 disables
    pub queued_allocation_warning_count: usize,
    /// Reclaim dead humongous type arrays at every young pause
    pub eager_reclaim_humongous: bool,
    /// Remembered set size (cards) above which a humongous object is not a candidate
    pub eager_reclaim_remset_threshold: usize,
    /// Verify the heap before each pause
    pub verify_before_gc: bool,
    /// Verify the heap after each pause
    pub verify_after_gc: bool,
    /// Fraction of the remaining pause budget given to each optional increment
    pub optional_evacuation_fraction: f64,
    /// Old regions always taken into a collection set when candidates exist
    pub min_old_cset_regions: usize,
    /// Upper bound of old regions in one collection set
    pub max_old_cset_regions: usize,
    /// Chunk size in words used when removing self forwards
    pub remove_self_forwards_chunk_words: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            region_size_bytes: 1024 * 1024,        // 1MB
            initial_heap_bytes: 16 * 1024 * 1024,  // 16MB
            max_heap_bytes: 64 * 1024 * 1024,      // 64MB
            parallel_gc_threads: 4,
            numa_nodes: 1,
            max_pause_time_ms: 200.0,
            young_percent_min: 5,
            young_percent_max: 60,
            survivor_ratio: 8,
            max_tenuring_threshold: 15,
            target_survivor_ratio: 50,
            resize_plab: true,
            young_plab_size_words: 4096,
            old_plab_size_words: 1024,
            parallel_gc_buffer_waste_pct: 10,
            target_plab_waste_pct: 10,
            last_plab_average_occupancy: 50,
            plab_weight: 75,
            tlab_size_words: 1024,
            min_heap_delta_bytes: 1024 * 1024,
            gc_time_ratio: 12,
            max_heap_free_ratio: 70,
            uncommit_size_limit_regions: 16,
            service_interval_ms: 300,
            queued_allocation_warning_count: 100,
            eager_reclaim_humongous: true,
            eager_reclaim_remset_threshold: 128,
            verify_before_gc: false,
            verify_after_gc: false,
            optional_evacuation_fraction: 0.2,
            min_old_cset_regions: 1,
            max_old_cset_regions: 32,
            remove_self_forwards_chunk_words: 2048,
        }
    }
}

impl GcConfig {
    /// Check all settings and derive the fixed heap geometry
    pub fn validate(&self) -> Result<HeapGeometry, ConfigError> {
        let region_bytes = self.region_size_bytes;
        if !region_bytes.is_power_of_two()
            || !(MIN_REGION_SIZE..=MAX_REGION_SIZE).contains(&region_bytes)
        {
            return Err(ConfigError::InvalidRegionSize(region_bytes));
        }
        if self.max_heap_bytes < region_bytes {
            return Err(ConfigError::HeapTooSmall(self.max_heap_bytes));
        }
        if self.initial_heap_bytes > self.max_heap_bytes {
            return Err(ConfigError::InitialExceedsMax {
                initial: self.initial_heap_bytes,
                max: self.max_heap_bytes,
            });
        }
        if self.parallel_gc_threads == 0 {
            return Err(ConfigError::Zero("parallel_gc_threads"));
        }
        if self.numa_nodes == 0 {
            return Err(ConfigError::Zero("numa_nodes"));
        }
        if self.survivor_ratio == 0 {
            return Err(ConfigError::Zero("survivor_ratio"));
        }
        if self.tlab_size_words == 0 {
            return Err(ConfigError::Zero("tlab_size_words"));
        }
        if self.remove_self_forwards_chunk_words == 0 {
            return Err(ConfigError::Zero("remove_self_forwards_chunk_words"));
        }
        check_pct("young_percent_min", self.young_percent_min, 100)?;
        check_pct("young_percent_max", self.young_percent_max, 100)?;
        if self.young_percent_min > self.young_percent_max {
            return Err(ConfigError::OutOfRange {
                name: "young_percent_min",
                value: self.young_percent_min as f64,
            });
        }
        check_pct("target_survivor_ratio", self.target_survivor_ratio, 100)?;
        check_pct("parallel_gc_buffer_waste_pct", self.parallel_gc_buffer_waste_pct, 100)?;
        check_pct("target_plab_waste_pct", self.target_plab_waste_pct, 100)?;
        check_pct("last_plab_average_occupancy", self.last_plab_average_occupancy, 99)?;
        check_pct("plab_weight", self.plab_weight as usize, 100)?;
        check_pct("max_heap_free_ratio", self.max_heap_free_ratio, 100)?;
        if self.max_tenuring_threshold > crate::object::MAX_AGE {
            return Err(ConfigError::OutOfRange {
                name: "max_tenuring_threshold",
                value: self.max_tenuring_threshold as f64,
            });
        }
        if !(self.max_pause_time_ms > 0.0) {
            return Err(ConfigError::OutOfRange {
                name: "max_pause_time_ms",
                value: self.max_pause_time_ms,
            });
        }
        if !(self.optional_evacuation_fraction > 0.0 && self.optional_evacuation_fraction <= 1.0) {
            return Err(ConfigError::OutOfRange {
                name: "optional_evacuation_fraction",
                value: self.optional_evacuation_fraction,
            });
        }

        let region_words = region_bytes / WORD_SIZE;
        let max_regions = self.max_heap_bytes / region_bytes;
        let initial_regions = self.initial_heap_bytes.div_ceil(region_bytes).max(1);
        Ok(HeapGeometry {
            region_bytes,
            region_words,
            log_region_words: region_words.trailing_zeros(),
            cards_per_region: region_words / CARD_WORDS,
            humongous_threshold_words: region_words / 2,
            max_regions: max_regions as u32,
            initial_regions: initial_regions.min(max_regions) as u32,
            base: Address::heap_base(),
        })
    }
}

fn check_pct(name: &'static str, value: usize, max: usize) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::OutOfRange {
            name,
            value: value as f64,
        });
    }
    Ok(())
}

/// Immutable heap dimensions derived from a validated `GcConfig`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapGeometry {
    /// Region size in bytes
    pub region_bytes: usize,
    /// Region size in words
    pub region_words: usize,
    /// log2 of `region_words`
    pub log_region_words: u32,
    /// Cards in one region
    pub cards_per_region: usize,
    /// Objects of at least this many words are humongous
    pub humongous_threshold_words: usize,
    /// Reserved regions
    pub max_regions: u32,
    /// Regions committed at startup
    pub initial_regions: u32,
    /// Address of the first word of region 0
    pub base: Address,
}

impl HeapGeometry {
    /// Total reserved words
    pub fn reserved_words(&self) -> usize {
        self.max_regions as usize * self.region_words
    }

    /// First address past the reserved heap
    pub fn end(&self) -> Address {
        self.base.offset(self.reserved_words())
    }

    /// Whether `addr` lies inside the reserved heap
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Index of the region containing `addr`
    #[inline]
    pub fn region_index(&self, addr: Address) -> u32 {
        debug_assert!(self.contains(addr), "address {addr} outside heap");
        (addr.words_from(self.base) >> self.log_region_words) as u32
    }

    /// Bottom address of region `index`
    #[inline]
    pub fn region_bottom(&self, index: u32) -> Address {
        self.base.offset((index as usize) << self.log_region_words)
    }

    /// Global card index of `addr`
    #[inline]
    pub fn card_index(&self, addr: Address) -> usize {
        addr.words_from(self.base) / CARD_WORDS
    }

    /// First address of card `card`
    #[inline]
    pub fn card_start(&self, card: usize) -> Address {
        self.base.offset(card * CARD_WORDS)
    }

    /// Total number of cards covering the reserved heap
    pub fn num_cards(&self) -> usize {
        self.reserved_words() / CARD_WORDS
    }

    /// Whether an allocation of `word_size` words is humongous
    #[inline]
    pub fn is_humongous(&self, word_size: usize) -> bool {
        word_size >= self.humongous_threshold_words
    }

    /// Regions needed to hold `word_size` words
    pub fn regions_for_words(&self, word_size: usize) -> u32 {
        word_size.div_ceil(self.region_words) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let geometry = GcConfig::default().validate().unwrap();
        assert_eq!(geometry.region_words, 128 * 1024);
        assert_eq!(geometry.max_regions, 64);
        assert_eq!(geometry.initial_regions, 16);
        assert_eq!(geometry.cards_per_region, 2048);
        assert_eq!(geometry.humongous_threshold_words, 64 * 1024);
    }

    #[test]
    fn test_region_size_must_be_power_of_two() {
        let config = GcConfig {
            region_size_bytes: 3 * 1024 * 1024,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidRegionSize(3 * 1024 * 1024))
        );
    }

    #[test]
    fn test_initial_exceeds_max() {
        let config = GcConfig {
            initial_heap_bytes: 128 * 1024 * 1024,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InitialExceedsMax { .. })
        ));
    }

    #[test]
    fn test_percentages_checked() {
        let config = GcConfig {
            last_plab_average_occupancy: 100,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                name: "last_plab_average_occupancy",
                ..
            })
        ));

        let config = GcConfig {
            young_percent_min: 70,
            young_percent_max: 60,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = GcConfig {
            parallel_gc_threads: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("parallel_gc_threads")));
    }

    #[test]
    fn test_geometry_address_math() {
        let geometry = GcConfig::default().validate().unwrap();
        let bottom = geometry.region_bottom(3);
        assert_eq!(geometry.region_index(bottom), 3);
        assert_eq!(geometry.region_index(bottom.offset(geometry.region_words - 1)), 3);
        assert_eq!(geometry.region_index(bottom.offset(geometry.region_words)), 4);
        assert_eq!(geometry.card_start(geometry.card_index(bottom.offset(70))), bottom.offset(64));
        assert_eq!(geometry.regions_for_words(geometry.region_words * 3 + 1), 4);
        assert!(geometry.is_humongous(geometry.region_words / 2));
        assert!(!geometry.is_humongous(geometry.region_words / 2 - 1));
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: GcConfig =
            serde_json::from_str(r#"{ "region_size_bytes": 65536, "parallel_gc_threads": 2 }"#)
                .unwrap();
        assert_eq!(config.region_size_bytes, 65536);
        assert_eq!(config.parallel_gc_threads, 2);
        assert_eq!(config.max_heap_bytes, GcConfig::default().max_heap_bytes);
    }
}
