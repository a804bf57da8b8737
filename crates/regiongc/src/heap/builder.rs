//! Heap construction

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize};

use parking_lot::Mutex;

use crate::age_table::AgeTable;
use crate::allocator::Allocator;
use crate::bitmap::AtomicBitmap;
use crate::block_offset::BlockOffsetTable;
use crate::collection_set::CollectionSet;
use crate::config::GcConfig;
use crate::error::HeapError;
use crate::evac_failure::{EvacFailureInjector, EvacFailureRegions};
use crate::gc_locker::GcLocker;
use crate::marking::{ConcurrentMark, RootRegionScanGate};
use crate::phase_times::PhaseTimes;
use crate::plab::{EvacStats, PlabSizing};
use crate::policy::{AdaptivePolicy, Policy};
use crate::region::{RegionAttrTable, RegionManager, RegionSet, SetKind};
use crate::remset::{CardRemSet, RemSet};
use crate::roots::RootSet;
use crate::safepoint::Safepoint;
use crate::service::ServiceThread;
use crate::stats::GcStats;
use crate::storage::HeapStorage;
use crate::workers::WorkerThreads;

use super::{Heap, OldSets, YoungRegions};

/// Smallest PLAB in words
const MIN_PLAB_WORDS: usize = 64;

/// Builder for `Heap`, with optional collaborator overrides
pub struct HeapBuilder {
    config: GcConfig,
    service_thread: bool,
    marking: Option<Arc<dyn ConcurrentMark>>,
    remset: Option<Arc<dyn RemSet>>,
    policy: Option<Arc<dyn Policy>>,
}

impl HeapBuilder {
    pub(crate) fn new(config: GcConfig) -> Self {
        Self {
            config,
            service_thread: true,
            marking: None,
            remset: None,
            policy: None,
        }
    }

    /// Whether to start the background service thread (default: true)
    pub fn service_thread(mut self, enabled: bool) -> Self {
        self.service_thread = enabled;
        self
    }

    /// Use `marking` instead of `RootRegionScanGate`
    pub fn marking(mut self, marking: Arc<dyn ConcurrentMark>) -> Self {
        self.marking = Some(marking);
        self
    }

    /// Use `remset` instead of `CardRemSet`
    pub fn remset(mut self, remset: Arc<dyn RemSet>) -> Self {
        self.remset = Some(remset);
        self
    }

    /// Use `policy` instead of `AdaptivePolicy`
    pub fn policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Validate the configuration, commit the initial regions and start the
    /// service thread if enabled
    pub fn build(self) -> Result<Arc<Heap>, HeapError> {
        let config = self.config;
        let geometry = config.validate()?;
        let workers = config.parallel_gc_threads;
        let sizing = PlabSizing {
            min_words: MIN_PLAB_WORDS.min(geometry.humongous_threshold_words),
            max_words: geometry.humongous_threshold_words,
            target_waste_pct: config.target_plab_waste_pct,
            last_plab_average_occupancy: config.last_plab_average_occupancy,
            weight: config.plab_weight,
            resize: config.resize_plab,
        };
        let marking = self
            .marking
            .unwrap_or_else(|| Arc::new(RootRegionScanGate::new()));
        let remset = self
            .remset
            .unwrap_or_else(|| Arc::new(CardRemSet::new(geometry.num_cards(), geometry.max_regions)));
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(AdaptivePolicy::new(&config, &geometry)));
        let manager = RegionManager::new(geometry, config.numa_nodes);
        let num_nodes = manager.num_nodes();

        let heap = Heap {
            storage: HeapStorage::new(geometry.base, geometry.reserved_words()),
            bot: BlockOffsetTable::new(geometry),
            attrs: RegionAttrTable::new(geometry.max_regions),
            allocator: Allocator::new(num_nodes),
            manager,
            young: Mutex::new(YoungRegions {
                set: RegionSet::new(SetKind::Young),
                eden: Vec::new(),
                survivors: Vec::new(),
            }),
            old_sets: Mutex::new(OldSets {
                old: RegionSet::new(SetKind::Old),
                humongous: RegionSet::new(SetKind::Humongous),
            }),
            heap_lock: Mutex::new(()),
            safepoint: Safepoint::new(),
            gc_locker: GcLocker::new(),
            roots: RootSet::new(),
            gc_epoch: AtomicU64::new(0),
            total_collections: AtomicU64::new(0),
            summary_bytes_used: AtomicUsize::new(0),
            bytes_used_during_gc: AtomicUsize::new(0),
            gc_active: AtomicBool::new(false),
            concurrent_start_pause: AtomicBool::new(false),
            initiate_conc_mark: AtomicBool::new(false),
            collection_set: Mutex::new(CollectionSet::new()),
            evac_failure_regions: EvacFailureRegions::new(geometry.max_regions),
            evac_failure_bitmap: AtomicBitmap::new(geometry.reserved_words()),
            injector: EvacFailureInjector::new(geometry.max_regions),
            evac_stats: [
                EvacStats::new("Young", config.young_plab_size_words, workers, sizing),
                EvacStats::new("Old", config.old_plab_size_words, workers, sizing),
            ],
            last_age_table: Mutex::new(AgeTable::new()),
            humongous_candidates: Mutex::new(Vec::new()),
            workers: WorkerThreads::new(workers),
            phase_times: PhaseTimes::new(workers),
            marking,
            remset,
            policy,
            stats: GcStats::new(),
            hash_seed: AtomicU32::new(0),
            next_node: AtomicU32::new(0),
            service: Mutex::new(None),
            geometry,
            config,
        };

        let committed = heap.manager.expand_by(geometry.initial_regions);
        heap.policy.record_new_heap_size(committed);
        heap.allocator.init_mutator_alloc_regions();
        tracing::info!(
            target: "regiongc::gc",
            region_bytes = geometry.region_bytes,
            initial_regions = committed,
            max_regions = geometry.max_regions,
            workers,
            nodes = num_nodes,
            "heap initialized"
        );

        let heap = Arc::new(heap);
        if self.service_thread {
            *heap.service.lock() = Some(ServiceThread::start(&heap));
        }
        Ok(heap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = Heap::builder(GcConfig {
            region_size_bytes: 3000,
            ..Default::default()
        })
        .service_thread(false)
        .build();
        assert!(matches!(
            result,
            Err(HeapError::Config(ConfigError::InvalidRegionSize(3000)))
        ));
    }

    #[test]
    fn test_custom_policy_is_used() {
        let config = GcConfig {
            max_pause_time_ms: 7.0,
            ..Default::default()
        };
        let geometry = config.validate().unwrap();
        let policy = Arc::new(AdaptivePolicy::new(&config, &geometry));
        let heap = Heap::builder(GcConfig::default())
            .policy(policy)
            .service_thread(false)
            .build()
            .unwrap();
        assert_eq!(heap.policy().max_pause_time_ms(), 7.0);
        assert_eq!(heap.config().max_pause_time_ms, GcConfig::default().max_pause_time_ms);
    }

    #[test]
    fn test_service_thread_stops_with_heap() {
        let heap = Heap::builder(GcConfig {
            service_interval_ms: 1,
            ..Default::default()
        })
        .build()
        .unwrap();
        assert!(heap.service.lock().is_some());
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(heap);
    }
}
