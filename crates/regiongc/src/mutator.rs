//! Mutator threads
//!
//! ## Design
//!
//! - A `Mutator` is registered as running for its whole lifetime. Pauses
//!   only happen while it polls, blocks, allocates on the slow path or
//!   requests a collection, so addresses it holds stay valid between those
//!   calls. Anything that must survive them goes into a `Root`.
//! - Small objects are bump-allocated from a thread-local TLAB. The TLAB is
//!   tagged with the GC epoch and dropped when a pause has run since.
//! - Reference stores go through the post-write barrier of the remembered
//!   set.

use std::cell::Cell;
use std::sync::Arc;

use crate::address::Address;
use crate::error::AllocError;
use crate::heap::{AllocRequest, Heap};
use crate::object::{HEADER_WORDS, MarkWord, ObjectShape};
use crate::roots::Root;
use crate::stats::PauseRecord;
use crate::storage::HeapStorage;
use crate::young_collector::GcCause;

/// Thread-local allocation buffer
#[derive(Debug, Clone, Copy)]
struct Tlab {
    top: Address,
    end: Address,
    epoch: u64,
}

impl Tlab {
    const EMPTY: Tlab = Tlab {
        top: Address::NULL,
        end: Address::NULL,
        epoch: 0,
    };

    fn free_words(&self) -> usize {
        self.end.words_from(self.top)
    }
}

/// A thread allocating in and mutating the heap
pub struct Mutator {
    heap: Arc<Heap>,
    node: u32,
    tlab: Cell<Tlab>,
}

impl Heap {
    /// Register the calling thread as a mutator
    pub fn attach_mutator(self: &Arc<Self>) -> Mutator {
        let node = self.next_mutator_node();
        self.safepoint.enter_running();
        tracing::trace!(target: "regiongc::alloc", node, "mutator attached");
        Mutator {
            heap: Arc::clone(self),
            node,
            tlab: Cell::new(Tlab::EMPTY),
        }
    }
}

impl Mutator {
    /// The heap this mutator runs on
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// NUMA node this mutator allocates on
    pub fn node(&self) -> u32 {
        self.node
    }

    /// Allocate and initialize an object of `shape`
    pub fn allocate(&self, shape: ObjectShape) -> Result<Address, AllocError> {
        self.heap.safepoint.poll();
        shape.encode()?;
        let words = shape.size_words;
        let obj = if words >= self.heap.geometry.humongous_threshold_words {
            self.heap
                .mem_allocate(AllocRequest::Humongous { word_size: words })?
                .0
        } else if words >= self.heap.config.tlab_size_words / 2 {
            self.allocate_outside_tlab(words)?
        } else if let Some(obj) = self.allocate_from_tlab(words) {
            obj
        } else {
            self.refill_tlab(words)?
        };
        self.heap.init_object(obj, shape)?;
        Ok(obj)
    }

    /// Allocate an instance with `ref_fields` references and `data_words` words
    pub fn allocate_instance(&self, ref_fields: usize, data_words: usize) -> Result<Address, AllocError> {
        self.allocate(ObjectShape::instance(ref_fields, data_words))
    }

    /// Allocate an array of `len` references
    pub fn allocate_obj_array(&self, len: usize) -> Result<Address, AllocError> {
        self.allocate(ObjectShape::obj_array(len))
    }

    /// Allocate an array of `len` primitive words
    pub fn allocate_type_array(&self, len: usize) -> Result<Address, AllocError> {
        self.allocate(ObjectShape::type_array(len))
    }

    fn allocate_from_tlab(&self, words: usize) -> Option<Address> {
        let mut tlab = self.tlab.get();
        if tlab.epoch != self.heap.gc_epoch() {
            self.tlab.set(Tlab::EMPTY);
            return None;
        }
        if tlab.free_words() < words {
            return None;
        }
        let obj = tlab.top;
        tlab.top = obj.offset(words);
        self.tlab.set(tlab);
        Some(obj)
    }

    fn allocate_outside_tlab(&self, words: usize) -> Result<Address, AllocError> {
        let (obj, _) = self.heap.mem_allocate(AllocRequest::Small {
            node: self.node,
            min_words: words,
            desired_words: words,
        })?;
        Ok(obj)
    }

    /// Retire the current TLAB and carve `words` out of a fresh one
    fn refill_tlab(&self, words: usize) -> Result<Address, AllocError> {
        self.retire_tlab();
        let (start, size) = self.heap.mem_allocate(AllocRequest::Small {
            node: self.node,
            min_words: words,
            desired_words: self.heap.config.tlab_size_words.max(words),
        })?;
        // The allocation may have run a pause; the new TLAB belongs to the epoch after it.
        self.tlab.set(Tlab {
            top: start.offset(words),
            end: start.offset(size),
            epoch: self.heap.gc_epoch(),
        });
        Ok(start)
    }

    fn retire_tlab(&self) {
        let tlab = self.tlab.replace(Tlab::EMPTY);
        if tlab.epoch == self.heap.gc_epoch() {
            self.heap.fill_with_dummy_object(tlab.top, tlab.free_words());
        }
    }

    /// Keep `obj` reachable across pauses; the handle follows it when it moves
    pub fn root(&self, obj: Address) -> Root<'_> {
        Root::new(&self.heap.roots, obj)
    }

    /// Reference field `index` of `obj`
    pub fn read_ref(&self, obj: Address, index: usize) -> Address {
        debug_assert!(index < self.heap.storage.shape(obj).ref_fields);
        self.heap.storage.load_ref(HeapStorage::ref_slot(obj, index))
    }

    /// Store `value` into reference field `index` of `obj`
    pub fn write_ref(&self, obj: Address, index: usize, value: Address) {
        debug_assert!(index < self.heap.storage.shape(obj).ref_fields);
        let slot = HeapStorage::ref_slot(obj, index);
        self.heap.storage.store_ref(slot, value);
        if !value.is_null() {
            self.heap.remset.record_reference(&self.heap, slot, value);
        }
    }

    fn data_slot(&self, obj: Address, index: usize) -> Address {
        let shape = self.heap.storage.shape(obj);
        debug_assert!(index < shape.data_words());
        obj.offset(HEADER_WORDS + shape.ref_fields + index)
    }

    /// Primitive word `index` of `obj`
    pub fn read_word(&self, obj: Address, index: usize) -> u64 {
        self.heap.storage.load(self.data_slot(obj, index))
    }

    /// Store primitive word `index` of `obj`
    pub fn write_word(&self, obj: Address, index: usize, value: u64) {
        self.heap.storage.store(self.data_slot(obj, index), value);
    }

    /// Identity hash of `obj`, assigned on first use and kept across moves
    pub fn identity_hash(&self, obj: Address) -> u32 {
        let storage = &self.heap.storage;
        loop {
            let current = storage.mark(obj);
            let MarkWord::Normal { age, hash } = current else {
                unreachable!("object {obj} has a transient mark outside a pause");
            };
            if hash != 0 {
                return hash;
            }
            let hash = self.heap.next_identity_hash();
            if storage
                .cas_mark(obj, current, MarkWord::Normal { age, hash })
                .is_ok()
            {
                return hash;
            }
        }
    }

    /// Pin `obj` in place; its region is not evacuated while the guard lives
    pub fn pin(&self, obj: Address) -> PinGuard<'_> {
        let region = self.heap.region_containing(obj);
        let index = region.humongous_start_region().unwrap_or(region.index());
        self.heap.region(index).increment_pinned();
        PinGuard {
            heap: &self.heap,
            region: index,
        }
    }

    /// Enter a GC-locker critical section; pauses are skipped while it lasts
    pub fn critical(&self) -> CriticalGuard<'_> {
        self.heap.gc_locker.enter_critical();
        CriticalGuard { heap: &self.heap }
    }

    /// Request a young pause; `None` if it was skipped
    pub fn collect(&self) -> Option<PauseRecord> {
        self.tlab.set(Tlab::EMPTY);
        self.heap.collect_from_mutator(GcCause::Explicit)
    }

    /// Block at a pending safepoint
    pub fn poll(&self) {
        self.heap.safepoint.poll();
    }

    /// Run `f` without being registered as running; pauses may happen meanwhile
    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        self.heap.safepoint.leave_running();
        let result = f();
        self.heap.safepoint.enter_running();
        result
    }

    /// Verify the heap at a safepoint
    pub fn verify_heap(&self) -> Result<(), crate::error::VerifyError> {
        self.heap.safepoint.leave_running();
        let _safepoint = self.heap.safepoint.begin(true);
        self.heap.verify()
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.retire_tlab();
        self.heap.safepoint.leave_running();
    }
}

/// Keeps a region pinned
pub struct PinGuard<'a> {
    heap: &'a Heap,
    region: u32,
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.heap.region(self.region).decrement_pinned();
    }
}

/// Keeps a GC-locker critical section open
pub struct CriticalGuard<'a> {
    heap: &'a Heap,
}

impl Drop for CriticalGuard<'_> {
    fn drop(&mut self) {
        self.heap.gc_locker.exit_critical();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;

    fn heap() -> Arc<Heap> {
        Heap::builder(GcConfig {
            region_size_bytes: 64 * 1024,
            initial_heap_bytes: 1024 * 1024,
            max_heap_bytes: 4 * 1024 * 1024,
            parallel_gc_threads: 2,
            ..Default::default()
        })
        .service_thread(false)
        .build()
        .unwrap()
    }

    #[test]
    fn test_tlab_allocation_is_contiguous() {
        let heap = heap();
        let m = heap.attach_mutator();
        let a = m.allocate_instance(1, 2).unwrap();
        let b = m.allocate_instance(0, 1).unwrap();
        assert_eq!(b, a.offset(HEADER_WORDS + 3));
        assert!(heap.region_containing(a).is_eden());
        assert_eq!(heap.storage().shape(b), ObjectShape::instance(0, 1));
    }

    #[test]
    fn test_large_objects_bypass_tlab() {
        let heap = heap();
        let m = heap.attach_mutator();
        let small = m.allocate_instance(0, 1).unwrap();
        let big = m.allocate_type_array(600).unwrap();
        let next = m.allocate_instance(0, 1).unwrap();
        assert_eq!(next, small.offset(HEADER_WORDS + 1));
        assert!(heap.region_containing(big).is_eden());

        let huge = m.allocate_type_array(heap.geometry().humongous_threshold_words).unwrap();
        assert!(heap.region_containing(huge).is_starts_humongous());
    }

    #[test]
    fn test_fields_and_hash_survive_collection() {
        let heap = heap();
        let m = heap.attach_mutator();
        let parent = m.allocate_instance(1, 1).unwrap();
        let child = m.allocate_type_array(3).unwrap();
        m.write_ref(parent, 0, child);
        m.write_word(parent, 0, 42);
        m.write_word(child, 2, 7);
        let hash = m.identity_hash(parent);
        assert_eq!(m.identity_hash(parent), hash);

        let from_region = heap.region_containing(parent).index();
        let root = m.root(parent);
        let record = m.collect().unwrap();
        assert_eq!(record.cause, GcCause::Explicit.name());

        let moved = root.get();
        assert_ne!(moved, parent);
        let parent = moved;
        let child = m.read_ref(parent, 0);
        assert_eq!(m.read_word(parent, 0), 42);
        assert_eq!(m.read_word(child, 2), 7);
        assert_eq!(m.identity_hash(parent), hash);
        // Survivor regions are relabeled eden for the next pause.
        assert_ne!(heap.region_containing(parent).index(), from_region);
        drop(root);
        m.verify_heap().unwrap();
    }

    #[test]
    fn test_tlab_is_dropped_after_pause() {
        let heap = heap();
        let m = heap.attach_mutator();
        let a = m.allocate_instance(0, 1).unwrap();
        let epoch = heap.gc_epoch();
        m.collect().unwrap();
        assert!(heap.gc_epoch() > epoch);
        let b = m.allocate_instance(0, 1).unwrap();
        assert_ne!(b, a.offset(HEADER_WORDS + 1));
    }

    #[test]
    fn test_pin_guard_balances() {
        let heap = heap();
        let m = heap.attach_mutator();
        let obj = m.allocate_instance(0, 1).unwrap();
        let region = heap.region_containing(obj).index();
        {
            let _pin = m.pin(obj);
            assert_eq!(heap.region(region).pinned_count(), 1);
        }
        assert_eq!(heap.region(region).pinned_count(), 0);
    }

    #[test]
    fn test_critical_guard_balances() {
        let heap = heap();
        let m = heap.attach_mutator();
        let before = heap.total_collections();
        {
            let _critical = m.critical();
            assert!(heap.gc_locker().is_active());
        }
        assert!(!heap.gc_locker().is_active());
        m.collect().unwrap();
        assert_eq!(heap.total_collections(), before + 1);
    }

    #[test]
    fn test_drop_leaves_running() {
        let heap = heap();
        let m = heap.attach_mutator();
        assert_eq!(heap.safepoint().running(), 1);
        drop(m);
        assert_eq!(heap.safepoint().running(), 0);
        heap.collect().unwrap();
    }

    #[test]
    fn test_invalid_shape_is_rejected() {
        let heap = heap();
        let m = heap.attach_mutator();
        let shape = ObjectShape {
            kind: crate::object::ObjKind::Instance,
            ref_fields: 4,
            size_words: 3,
        };
        assert!(matches!(m.allocate(shape), Err(AllocError::InvalidShape(_))));
    }
}
