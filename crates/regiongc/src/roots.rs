//! Mutator root handles
//!
//! A `Root` keeps one object alive and tracks it across collections: the
//! pause updates the slot when the object moves. Slots are recycled through
//! a free list when handles are dropped.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::address::Address;

/// Table of root slots
#[derive(Default)]
pub struct RootSet {
    slots: RwLock<Vec<AtomicUsize>>,
    free: Mutex<Vec<usize>>,
}

impl RootSet {
    /// Empty root table
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a slot holding `value`
    pub fn register(&self, value: Address) -> usize {
        if let Some(index) = self.free.lock().pop() {
            self.slots.read()[index].store(value.as_usize(), Ordering::Release);
            return index;
        }
        let mut slots = self.slots.write();
        slots.push(AtomicUsize::new(value.as_usize()));
        slots.len() - 1
    }

    /// Release slot `index`
    pub fn unregister(&self, index: usize) {
        self.slots.read()[index].store(0, Ordering::Release);
        self.free.lock().push(index);
    }

    /// Value of slot `index`
    #[inline]
    pub fn get(&self, index: usize) -> Address {
        Address::new(self.slots.read()[index].load(Ordering::Acquire))
    }

    /// Overwrite slot `index`
    #[inline]
    pub fn set(&self, index: usize, value: Address) {
        self.slots.read()[index].store(value.as_usize(), Ordering::Release);
    }

    /// Number of slots ever allocated, including free ones
    pub fn capacity(&self) -> usize {
        self.slots.read().len()
    }

    /// Slots currently in use
    pub fn len(&self) -> usize {
        self.capacity() - self.free.lock().len()
    }

    /// Whether no slot is in use
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `f` with every non-null root value
    pub fn for_each(&self, mut f: impl FnMut(Address)) {
        for slot in self.slots.read().iter() {
            let value = Address::new(slot.load(Ordering::Acquire));
            if !value.is_null() {
                f(value);
            }
        }
    }
}

/// RAII handle to a root slot
pub struct Root<'a> {
    roots: &'a RootSet,
    index: usize,
}

impl<'a> Root<'a> {
    pub(crate) fn new(roots: &'a RootSet, value: Address) -> Self {
        let index = roots.register(value);
        Self { roots, index }
    }

    /// Current address of the rooted object
    #[inline]
    pub fn get(&self) -> Address {
        self.roots.get(self.index)
    }

    /// Point the root at another object
    pub fn set(&self, value: Address) {
        self.roots.set(self.index, value);
    }

    /// Slot index in the root table
    pub fn index(&self) -> usize {
        self.index
    }
}

impl std::fmt::Debug for Root<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Root")
            .field("index", &self.index)
            .field("value", &self.get())
            .finish()
    }
}

impl Drop for Root<'_> {
    fn drop(&mut self) {
        self.roots.unregister(self.index);
    }
}
