//! Configuration loading and validation

use regiongc::{ConfigError, GcConfig, Heap, HeapError};

#[test]
fn test_partial_json_uses_defaults() {
    let config: GcConfig = serde_json::from_str(
        r#"{
            "region_size_bytes": 262144,
            "max_heap_bytes": 33554432,
            "parallel_gc_threads": 2,
            "eager_reclaim_humongous": false
        }"#,
    )
    .unwrap();
    let defaults = GcConfig::default();
    assert_eq!(config.region_size_bytes, 256 * 1024);
    assert!(!config.eager_reclaim_humongous);
    assert_eq!(config.max_pause_time_ms, defaults.max_pause_time_ms);
    assert_eq!(config.tlab_size_words, defaults.tlab_size_words);

    let geometry = config.validate().unwrap();
    assert_eq!(geometry.region_words, 32 * 1024);
    assert_eq!(geometry.humongous_threshold_words, 16 * 1024);
    assert_eq!(geometry.max_regions, 128);
    assert_eq!(geometry.initial_regions, 64);
}

#[test]
fn test_config_round_trips_through_json() {
    let config = GcConfig {
        numa_nodes: 2,
        verify_after_gc: true,
        ..Default::default()
    };
    let json = serde_json::to_string(&config).unwrap();
    let back: GcConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, config);
}

#[test]
fn test_invalid_configs_are_rejected() {
    let region = GcConfig {
        region_size_bytes: 100_000,
        ..Default::default()
    };
    assert!(matches!(region.validate(), Err(ConfigError::InvalidRegionSize(100_000))));

    let sizes = GcConfig {
        initial_heap_bytes: 128 * 1024 * 1024,
        ..Default::default()
    };
    assert!(sizes.validate().is_err());

    let workers = GcConfig {
        parallel_gc_threads: 0,
        ..Default::default()
    };
    assert!(workers.validate().is_err());

    let err = Heap::builder(workers).service_thread(false).build().err();
    assert!(matches!(err, Some(HeapError::Config(_))));
}
