//! Error types for regiongc

use thiserror::Error;

/// Configuration validation error
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Region size must be a power of two within the supported range
    #[error("region size {0} bytes is not a power of two between 4KB and 32MB")]
    InvalidRegionSize(usize),

    /// Initial heap larger than the maximum heap
    #[error("initial heap size {initial} exceeds maximum heap size {max}")]
    InitialExceedsMax {
        /// Requested initial heap size in bytes
        initial: usize,
        /// Requested maximum heap size in bytes
        max: usize,
    },

    /// Heap too small to hold a single region
    #[error("maximum heap size {0} bytes is smaller than one region")]
    HeapTooSmall(usize),

    /// A percentage setting is outside 0..=100 (or its narrower valid range)
    #[error("{name} = {value} is out of range")]
    OutOfRange {
        /// Setting name
        name: &'static str,
        /// Offending value
        value: f64,
    },

    /// A count setting that must be positive was zero
    #[error("{0} must be at least 1")]
    Zero(&'static str),
}

/// Allocation error surfaced to mutators after the escalation path is exhausted
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// No space after collection and heap expansion
    #[error("out of memory allocating {word_size} words")]
    OutOfMemory {
        /// Requested size in words
        word_size: usize,
    },

    /// Object shape cannot be encoded in an object header
    #[error("invalid object shape: {0}")]
    InvalidShape(&'static str),
}

/// Heap construction error
#[derive(Debug, Error)]
pub enum HeapError {
    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Heap verification failure
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// A region is tagged with a containing set that does not match its type
    #[error("region {region} of type {region_type} is tagged as member of {set}")]
    WrongContainingSet {
        /// Region index
        region: u32,
        /// Region type name
        region_type: &'static str,
        /// Containing set name
        set: &'static str,
    },

    /// The number of tagged members differs from the recorded set length
    #[error("{set} set length {recorded} does not match {tagged} tagged regions")]
    SetLengthMismatch {
        /// Set name
        set: &'static str,
        /// Length recorded by the set
        recorded: usize,
        /// Number of regions carrying the tag
        tagged: usize,
    },

    /// Humongous series is malformed
    #[error("region {0} breaks a humongous series")]
    BrokenHumongous(u32),

    /// Object walk failed inside a region
    #[error("region {region} is not parsable at word {addr:#x}")]
    Unparsable {
        /// Region index
        region: u32,
        /// Offending address
        addr: usize,
    },

    /// Block offset table disagrees with the object walk
    #[error("block offset table of region {region} is wrong at card start {addr:#x}")]
    BlockOffset {
        /// Region index
        region: u32,
        /// Card start address
        addr: usize,
    },

    /// A reference points into a free or uncommitted region
    #[error("reference at {slot:#x} points to {target:#x} in a free region")]
    DanglingReference {
        /// Slot address (0 for roots)
        slot: usize,
        /// Target address
        target: usize,
    },

    /// An object still carries a forwarding or evacuation-failure mark
    #[error("object at {0:#x} still has a transient mark word")]
    TransientMark(usize),

    /// Summary used bytes do not match the per-region sum
    #[error("used bytes {recorded} do not match recalculated {actual}")]
    UsedMismatch {
        /// Heap summary value
        recorded: usize,
        /// Recalculated value
        actual: usize,
    },

    /// The evacuation failure bitmap was left dirty
    #[error("evacuation failure bitmap not clear for region {0}")]
    StaleFailureBitmap(u32),
}
