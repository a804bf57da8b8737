//! Configuration file parsing for regiongc.toml.

use anyhow::{Context, Result};
use regiongc::GcConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    /// Collector settings
    #[serde(default)]
    pub gc: GcConfig,

    /// Workload settings
    #[serde(default)]
    pub workload: WorkloadConfig,
}

/// Synthetic allocation workload.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Mutator threads
    pub threads: usize,

    /// Allocations per thread
    pub allocations: u64,

    /// Objects each thread keeps reachable
    pub live_objects: usize,

    /// Largest garbage array in words
    pub max_array_words: usize,

    /// Allocate a humongous array every this many allocations (0: never)
    pub humongous_every: u64,

    /// Request an explicit pause every this many allocations (0: never)
    pub collect_every: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            allocations: 200_000,
            live_objects: 2_000,
            max_array_words: 256,
            humongous_every: 10_000,
            collect_every: 0,
        }
    }
}

impl Config {
    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_config() {
        let config: Config = toml::from_str(
            r#"
            [gc]
            region_size_bytes = 262144
            verify_after_gc = true

            [workload]
            threads = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.gc.region_size_bytes, 256 * 1024);
        assert!(config.gc.verify_after_gc);
        assert_eq!(config.gc.parallel_gc_threads, GcConfig::default().parallel_gc_threads);
        assert_eq!(config.workload.threads, 2);
        assert_eq!(config.workload.allocations, WorkloadConfig::default().allocations);
    }

    #[test]
    fn test_empty_config_is_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.gc, GcConfig::default());
        assert_eq!(config.workload.threads, 4);
    }
}
