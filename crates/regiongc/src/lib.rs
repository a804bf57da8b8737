//! # regiongc
//!
//! Region-based, parallel evacuating garbage collector core.
//!
//! ## Design
//!
//! - **Regions**: the heap is a reserved range of equally sized regions,
//!   each free, eden, survivor, old or part of a humongous object.
//! - **Allocation**: mutators bump-allocate from TLABs carved out of a
//!   per-node eden region; objects of half a region or more take whole
//!   contiguous regions.
//! - **Young pauses**: a stop-the-world pause evacuates the collection set
//!   (all young regions plus policy-selected old regions) with parallel
//!   work-stealing workers copying into PLABs. Objects that cannot be copied
//!   stay in place and their region becomes old.
//! - **Collaborators**: marking, remembered sets and the pause-time policy
//!   are traits with simple default implementations.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod address;
pub mod age_table;
pub mod alloc_region;
pub mod allocator;
pub mod batched_task;
pub mod bitmap;
pub mod block_offset;
pub mod collection_set;
pub mod config;
pub mod error;
pub mod evac_failure;
pub mod evacuate;
pub mod gc_locker;
pub mod heap;
pub mod marking;
pub mod mutator;
pub mod object;
pub mod par_scan_state;
pub mod phase_times;
pub mod plab;
pub mod plab_allocator;
pub mod policy;
pub mod post_evacuate;
pub mod pre_evacuate;
pub mod region;
pub mod remset;
pub mod roots;
pub mod safepoint;
pub mod service;
pub mod stats;
pub mod storage;
pub mod task_queue;
pub mod verifier;
pub mod weighted_average;
pub mod workers;
pub mod young_collector;

pub use address::Address;
pub use config::{GcConfig, HeapGeometry};
pub use error::{AllocError, ConfigError, HeapError, VerifyError};
pub use heap::{AllocRequest, Heap, HeapBuilder};
pub use marking::ConcurrentMark;
pub use mutator::{CriticalGuard, Mutator, PinGuard};
pub use object::{MarkWord, ObjKind, ObjectShape};
pub use policy::{AdaptivePolicy, Policy};
pub use remset::{CardRemSet, RemSet};
pub use roots::Root;
pub use stats::{GcStats, GcStatsSnapshot, PauseRecord};
pub use young_collector::GcCause;
