//! Young pause integration tests
//!
//! Each test builds its own small heap, drives it through a `Mutator` and
//! checks the heap with the verifier after every pause.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use regiongc::address::Address;
use regiongc::age_table::AgeTable;
use regiongc::marking::RootRegionScanGate;
use regiongc::policy::{CsetCandidate, OldRegionSelection, PauseSample};
use regiongc::{AdaptivePolicy, AllocError, GcConfig, Heap, Policy};

const REGION_BYTES: usize = 64 * 1024;
const REGION_WORDS: usize = REGION_BYTES / 8;

fn config() -> GcConfig {
    GcConfig {
        region_size_bytes: REGION_BYTES,
        initial_heap_bytes: 16 * REGION_BYTES,
        max_heap_bytes: 64 * REGION_BYTES,
        parallel_gc_threads: 2,
        verify_before_gc: true,
        verify_after_gc: true,
        ..Default::default()
    }
}

fn heap_with(config: GcConfig) -> Arc<Heap> {
    Heap::builder(config).service_thread(false).build().unwrap()
}

// ============================================================================
// Young pauses
// ============================================================================

#[test]
fn test_unreachable_objects_are_freed() {
    let heap = heap_with(config());
    let m = heap.attach_mutator();
    for _ in 0..2_000 {
        m.allocate_instance(2, 8).unwrap();
    }
    let used_before = heap.used();
    let record = m.collect().unwrap();
    assert!(record.young_regions >= 1);
    assert_eq!(record.copied_bytes, 0);
    assert!(record.used_after < used_before);
    assert_eq!(heap.eden_regions().len(), 0);
    m.verify_heap().unwrap();
}

#[test]
fn test_linked_list_survives_pauses() {
    let heap = heap_with(config());
    let m = heap.attach_mutator();
    let head = m.root(Address::NULL);
    for i in 0..500u64 {
        let node = m.allocate_instance(1, 1).unwrap();
        m.write_word(node, 0, i);
        m.write_ref(node, 0, head.get());
        head.set(node);
        if i % 100 == 99 {
            m.collect().unwrap();
        }
    }
    m.collect().unwrap();

    let mut expected = 500u64;
    let mut cur = head.get();
    while !cur.is_null() {
        expected -= 1;
        assert_eq!(m.read_word(cur, 0), expected);
        cur = m.read_ref(cur, 0);
    }
    assert_eq!(expected, 0);
    assert!(heap.stats().snapshot().collections >= 6);
}

#[test]
fn test_allocation_failure_triggers_pause() {
    let heap = heap_with(GcConfig {
        max_heap_bytes: 16 * REGION_BYTES,
        ..config()
    });
    let m = heap.attach_mutator();
    // Far more garbage than the heap can hold at once.
    for _ in 0..(40 * REGION_WORDS / 64) {
        m.allocate_type_array(62).unwrap();
    }
    let history = heap.stats().history();
    assert!(!history.is_empty());
    assert!(history.iter().any(|r| r.cause == "Allocation Failure"));
}

#[test]
fn test_out_of_memory_when_everything_is_live() {
    let heap = heap_with(GcConfig {
        max_heap_bytes: 8 * REGION_BYTES,
        initial_heap_bytes: 8 * REGION_BYTES,
        verify_before_gc: false,
        verify_after_gc: false,
        ..config()
    });
    let m = heap.attach_mutator();
    let list = m.root(Address::NULL);
    let err = loop {
        match m.allocate_instance(1, 254) {
            Ok(node) => {
                m.write_ref(node, 0, list.get());
                list.set(node);
            }
            Err(err) => break err,
        }
    };
    assert!(matches!(err, AllocError::OutOfMemory { word_size } if word_size >= 256));
    assert!(heap.stats().snapshot().allocation_failures >= 1);
}

// ============================================================================
// Cross-region references
// ============================================================================

#[test]
fn test_old_to_young_reference_keeps_child_alive() {
    let heap = heap_with(GcConfig {
        max_tenuring_threshold: 0,
        ..config()
    });
    let m = heap.attach_mutator();
    let parent = m.root(m.allocate_instance(1, 0).unwrap());
    let record = m.collect().unwrap();
    assert!(record.promoted_bytes > 0);
    assert!(heap.region_containing(parent.get()).is_old());

    // Only the old parent refers to the child; the card must be found.
    let child = m.allocate_type_array(4).unwrap();
    m.write_word(child, 3, 0xfeed);
    m.write_ref(parent.get(), 0, child);
    assert!(heap.region_containing(child).is_eden());
    assert!(heap.remset().total_length() > 0);

    m.collect().unwrap();
    let child = m.read_ref(parent.get(), 0);
    assert!(heap.region_containing(child).is_old());
    assert_eq!(m.read_word(child, 3), 0xfeed);
    m.verify_heap().unwrap();
}

#[test]
fn test_young_to_old_reference_is_not_recorded() {
    let heap = heap_with(GcConfig {
        max_tenuring_threshold: 0,
        ..config()
    });
    let m = heap.attach_mutator();
    let target = m.root(m.allocate_instance(0, 1).unwrap());
    m.collect().unwrap();
    let before = heap.remset().total_length();
    let holder = m.allocate_instance(1, 0).unwrap();
    m.write_ref(holder, 0, target.get());
    assert_eq!(heap.remset().total_length(), before);
}

// ============================================================================
// Evacuation failure
// ============================================================================

#[test]
fn test_injected_failure_keeps_objects_in_place() {
    let heap = heap_with(config());
    let m = heap.attach_mutator();
    let a = m.allocate_instance(1, 1).unwrap();
    let b = m.allocate_instance(0, 2).unwrap();
    m.write_ref(a, 0, b);
    m.write_word(b, 1, 99);
    let hash = m.identity_hash(a);
    let root = m.root(a);
    let region = heap.region_containing(a).index();

    heap.injector().arm_for_regions(&[region]);
    let record = m.collect().unwrap();
    assert_eq!(record.evac_failed_regions, 1);
    assert_eq!(record.evac_failed_pinned, 0);
    assert_eq!(root.get(), a);
    assert_eq!(m.read_ref(a, 0), b);
    assert_eq!(m.read_word(b, 1), 99);
    assert_eq!(m.identity_hash(a), hash);
    assert!(heap.region(region).is_old());
    assert!(heap.region(region).is_parsable());
    assert!(heap.stats().snapshot().evacuation_failures >= 1);
    m.verify_heap().unwrap();

    // The retained region is collected by a later pause.
    let record = m.collect().unwrap();
    assert_eq!(record.evac_failed_regions, 0);
    assert_eq!(m.read_word(m.read_ref(root.get(), 0), 1), 99);
    assert_eq!(m.identity_hash(root.get()), hash);
    m.verify_heap().unwrap();
}

#[test]
fn test_failure_everywhere_still_verifies() {
    let heap = heap_with(config());
    let m = heap.attach_mutator();
    let list = m.root(Address::NULL);
    for i in 0..3_000u64 {
        let node = m.allocate_instance(1, 1).unwrap();
        m.write_word(node, 0, i);
        if i % 3 == 0 {
            m.write_ref(node, 0, list.get());
            list.set(node);
        }
    }
    heap.injector().arm_all();
    let record = m.collect().unwrap();
    assert!(record.evac_failed_regions >= 1);
    assert_eq!(record.copied_bytes, 0);
    m.verify_heap().unwrap();

    let mut count = 0;
    let mut cur = list.get();
    while !cur.is_null() {
        assert_eq!(m.read_word(cur, 0) % 3, 0);
        count += 1;
        cur = m.read_ref(cur, 0);
    }
    assert_eq!(count, 1_000);
}

#[test]
fn test_pinned_region_fails_with_pinned_cause() {
    let heap = heap_with(config());
    let m = heap.attach_mutator();
    let obj = m.allocate_instance(0, 1).unwrap();
    m.write_word(obj, 0, 5);
    let root = m.root(obj);
    let record = {
        let _pin = m.pin(obj);
        m.collect().unwrap()
    };
    assert_eq!(record.evac_failed_pinned, 1);
    assert_eq!(root.get(), obj);
    assert_eq!(m.read_word(obj, 0), 5);
    assert_eq!(heap.region_containing(obj).pinned_count(), 0);
    m.verify_heap().unwrap();
}

// ============================================================================
// Humongous objects
// ============================================================================

#[test]
fn test_humongous_object_spans_contiguous_regions() {
    let heap = heap_with(config());
    let m = heap.attach_mutator();
    let len = 2 * REGION_WORDS + 100;
    let obj = m.allocate_type_array(len).unwrap();
    let start = heap.region_containing(obj).index();
    assert_eq!(heap.humongous_series_len(start), 3);
    assert!(heap.region(start + 1).is_continues_humongous());
    assert!(heap.region(start + 2).is_continues_humongous());
    assert_eq!(heap.stats().snapshot().humongous_allocated, 1);
    m.write_word(obj, len - 1, 11);
    assert_eq!(m.read_word(obj, len - 1), 11);
    m.verify_heap().unwrap();
}

#[test]
fn test_unreferenced_type_array_is_eagerly_reclaimed() {
    let heap = heap_with(config());
    let m = heap.attach_mutator();
    let garbage = m.allocate_type_array(REGION_WORDS).unwrap();
    let kept = m.root(m.allocate_type_array(REGION_WORDS).unwrap());
    let garbage_region = heap.region_containing(garbage).index();
    let kept_region = heap.region_containing(kept.get()).index();

    let record = m.collect().unwrap();
    assert_eq!(record.humongous_reclaimed, 1);
    assert!(heap.region(garbage_region).is_free());
    assert!(heap.region(kept_region).is_starts_humongous());
    assert_eq!(kept.get(), heap.region(kept_region).bottom());
    assert_eq!(heap.humongous_regions_count(), 2);
    m.verify_heap().unwrap();
}

#[test]
fn test_humongous_ref_array_is_not_eagerly_reclaimed() {
    let heap = heap_with(config());
    let m = heap.attach_mutator();
    let array = m.allocate_obj_array(REGION_WORDS).unwrap();
    let region = heap.region_containing(array).index();
    let record = m.collect().unwrap();
    assert_eq!(record.humongous_reclaimed, 0);
    assert!(heap.region(region).is_starts_humongous());
}

#[test]
fn test_humongous_array_keeps_young_elements_alive() {
    let heap = heap_with(config());
    let m = heap.attach_mutator();
    let array = m.root(m.allocate_obj_array(REGION_WORDS).unwrap());
    let mut before = Vec::new();
    for i in 0..16 {
        let elem = m.allocate_instance(0, 1).unwrap();
        m.write_word(elem, 0, i as u64);
        m.write_ref(array.get(), i * 500, elem);
        before.push(elem);
    }
    m.collect().unwrap();
    for i in 0..16 {
        let elem = m.read_ref(array.get(), i * 500);
        assert_ne!(elem, before[i]);
        assert_eq!(m.read_word(elem, 0), i as u64);
    }
    m.verify_heap().unwrap();
}

#[test]
fn test_humongous_allocation_without_space_is_out_of_memory() {
    let heap = heap_with(GcConfig {
        max_heap_bytes: 16 * REGION_BYTES,
        ..config()
    });
    let m = heap.attach_mutator();
    let err = m.allocate_type_array(20 * REGION_WORDS).unwrap_err();
    assert!(matches!(err, AllocError::OutOfMemory { .. }));
}

// ============================================================================
// Optional regions and concurrent start
// ============================================================================

/// Promotes everything and offers every old candidate as optional
struct OptionalOnly {
    inner: AdaptivePolicy,
}

impl Policy for OptionalOnly {
    fn max_pause_time_ms(&self) -> f64 {
        60_000.0
    }
    fn young_list_target_length(&self) -> u32 {
        self.inner.young_list_target_length()
    }
    fn max_survivor_regions(&self) -> u32 {
        self.inner.max_survivor_regions()
    }
    fn tenuring_threshold(&self, _ages: &AgeTable) -> u8 {
        0
    }
    fn should_allocate_mutator_region(&self, young_length: u32) -> bool {
        self.inner.should_allocate_mutator_region(young_length)
    }
    fn can_expand_young_list(&self, young_length: u32) -> bool {
        self.inner.can_expand_young_list(young_length)
    }
    fn select_old_regions(&self, candidates: &[CsetCandidate], _remaining_time_ms: f64) -> OldRegionSelection {
        OldRegionSelection {
            initial: Vec::new(),
            optional: candidates.iter().map(|c| c.region).collect(),
        }
    }
    fn predict_region_time_ms(&self, _live_bytes: usize, _young: bool) -> f64 {
        0.0
    }
    fn record_young_collection_start(&self) {
        self.inner.record_young_collection_start()
    }
    fn record_young_collection_end(&self, sample: &PauseSample) {
        self.inner.record_young_collection_end(sample)
    }
    fn cset_regions_freed(&self, count: usize) {
        self.inner.cset_regions_freed(count)
    }
    fn record_rs_length(&self, rs_length: usize) {
        self.inner.record_rs_length(rs_length)
    }
    fn revise_young_list_target_length(&self, rs_length: usize) {
        self.inner.revise_young_list_target_length(rs_length)
    }
    fn young_collection_expansion_amount(&self, _committed_bytes: usize) -> usize {
        0
    }
    fn shrink_amount(&self, _committed_bytes: usize, _used_bytes: usize) -> usize {
        0
    }
    fn need_to_start_conc_mark(&self, source: &'static str, alloc_bytes: usize, used_bytes: usize) -> bool {
        self.inner.need_to_start_conc_mark(source, alloc_bytes, used_bytes)
    }
    fn record_new_heap_size(&self, num_regions: u32) {
        self.inner.record_new_heap_size(num_regions)
    }
}

#[test]
fn test_marking_candidates_are_evacuated_as_optional_regions() {
    let config = config();
    let geometry = config.validate().unwrap();
    let gate = Arc::new(RootRegionScanGate::new());
    let heap = Heap::builder(config.clone())
        .service_thread(false)
        .marking(gate.clone())
        .policy(Arc::new(OptionalOnly {
            inner: AdaptivePolicy::new(&config, &geometry),
        }))
        .build()
        .unwrap();
    let m = heap.attach_mutator();
    let obj = m.allocate_instance(0, 3).unwrap();
    m.write_word(obj, 2, 123);
    let root = m.root(obj);
    m.collect().unwrap();
    let old_region = heap.region_containing(root.get()).index();
    assert!(heap.region(old_region).is_old());

    gate.add_candidate(old_region);
    let record = m.collect().unwrap();
    assert_eq!(record.optional_evacuated, 1);
    assert_eq!(record.optional_abandoned, 0);
    assert_ne!(heap.region_containing(root.get()).index(), old_region);
    assert_eq!(m.read_word(root.get(), 2), 123);
    m.verify_heap().unwrap();
}

#[test]
fn test_requested_concurrent_start_reports_root_regions() {
    let gate = Arc::new(RootRegionScanGate::new());
    let heap = Heap::builder(config())
        .service_thread(false)
        .marking(gate.clone())
        .build()
        .unwrap();
    let m = heap.attach_mutator();
    let _root = m.root(m.allocate_instance(0, 16).unwrap());

    heap.request_concurrent_start();
    let record = m.collect().unwrap();
    assert!(record.concurrent_start);
    assert_eq!(gate.cycles_started(), 1);
    assert_eq!(gate.root_regions().len(), record.survivor_regions);
    assert!(!heap.in_concurrent_start());

    let record = m.collect().unwrap();
    assert!(!record.concurrent_start);
    assert_eq!(gate.cycles_started(), 1);
}

#[test]
fn test_gc_locker_skips_explicit_pause() {
    let heap = heap_with(config());
    let m = heap.attach_mutator();
    let before = heap.total_collections();
    let critical = m.critical();
    assert!(m.collect().is_none());
    assert!(heap.gc_locker().needs_gc());
    drop(critical);
    assert!(!heap.gc_locker().needs_gc());
    assert_eq!(heap.total_collections(), before);
}

#[test]
fn test_allocation_survives_gc_locker_churn() {
    let heap = heap_with(GcConfig {
        max_heap_bytes: 16 * REGION_BYTES,
        ..config()
    });
    let done = Arc::new(AtomicBool::new(false));
    let churner = {
        let heap = Arc::clone(&heap);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let m = heap.attach_mutator();
            let mut sections = 0u64;
            while !done.load(Ordering::Acquire) {
                {
                    let _critical = m.critical();
                    thread::sleep(Duration::from_micros(20));
                }
                sections += 1;
                m.poll();
            }
            sections
        })
    };

    // Four times the heap in garbage; pauses can only run between sections.
    let m = heap.attach_mutator();
    let allocations = 4 * 16 * REGION_BYTES / 512;
    for i in 0..allocations {
        let obj = m.allocate_instance(0, 62).unwrap();
        m.write_word(obj, 0, i as u64);
    }
    done.store(true, Ordering::Release);
    let sections = m.blocking(|| churner.join().unwrap());
    assert!(sections > 0);
    assert!(heap.total_collections() > 0);
    assert_eq!(heap.stats().snapshot().allocation_failures, 0);
    m.verify_heap().unwrap();
}
