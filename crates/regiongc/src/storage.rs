//! Backing word storage for the reserved heap
//!
//! The whole reserved range is one array of atomic words. Committing and
//! uncommitting regions is bookkeeping in the region manager; uncommitted
//! ranges are zeroed so stale objects never reappear.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::Address;
use crate::object::{HEADER_WORDS, MarkWord, ONE_WORD_FILLER, ObjKind, ObjectShape};

/// Reserved heap words
pub struct HeapStorage {
    base: Address,
    words: Box<[AtomicU64]>,
}

impl HeapStorage {
    /// Reserve `len` zeroed words starting at `base`
    pub fn new(base: Address, len: usize) -> Self {
        let words = (0..len).map(|_| AtomicU64::new(0)).collect();
        Self { base, words }
    }

    #[inline]
    fn word(&self, addr: Address) -> &AtomicU64 {
        &self.words[addr.words_from(self.base)]
    }

    /// Load a word
    #[inline]
    pub fn load(&self, addr: Address) -> u64 {
        self.word(addr).load(Ordering::Relaxed)
    }

    /// Store a word
    #[inline]
    pub fn store(&self, addr: Address, value: u64) {
        self.word(addr).store(value, Ordering::Relaxed);
    }

    /// Copy `len` words from `from` to `to`; ranges must not overlap
    pub fn copy_words(&self, from: Address, to: Address, len: usize) {
        for i in 0..len {
            self.store(to.offset(i), self.load(from.offset(i)));
        }
    }

    /// Zero `len` words starting at `start`
    pub fn zero(&self, start: Address, len: usize) {
        for i in 0..len {
            self.store(start.offset(i), 0);
        }
    }

    /// Load a reference slot
    #[inline]
    pub fn load_ref(&self, slot: Address) -> Address {
        Address::new(self.word(slot).load(Ordering::Acquire) as usize)
    }

    /// Store a reference slot
    #[inline]
    pub fn store_ref(&self, slot: Address, value: Address) {
        self.word(slot)
            .store(value.as_usize() as u64, Ordering::Release);
    }

    /// Decoded mark word of `obj`
    #[inline]
    pub fn mark(&self, obj: Address) -> MarkWord {
        MarkWord::decode(self.word(obj).load(Ordering::Acquire))
    }

    /// Overwrite the mark word of `obj`
    #[inline]
    pub fn set_mark(&self, obj: Address, mark: MarkWord) {
        self.word(obj).store(mark.encode(), Ordering::Release);
    }

    /// Install `new` if the mark word still equals `current`.
    ///
    /// Returns the mark word found on failure.
    #[inline]
    pub fn cas_mark(&self, obj: Address, current: MarkWord, new: MarkWord) -> Result<(), MarkWord> {
        self.word(obj)
            .compare_exchange(
                current.encode(),
                new.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(MarkWord::decode)
    }

    /// Layout of the object at `obj`
    #[inline]
    pub fn shape(&self, obj: Address) -> ObjectShape {
        ObjectShape::decode(self.load(obj.offset(1)))
    }

    /// Size in words of the block starting at `addr` (objects and fillers)
    #[inline]
    pub fn block_size(&self, addr: Address) -> usize {
        if self.load(addr) == ONE_WORD_FILLER {
            1
        } else {
            self.shape(addr).size_words
        }
    }

    /// Whether the block at `addr` is dead filler space
    pub fn is_filler(&self, addr: Address) -> bool {
        self.load(addr) == ONE_WORD_FILLER || self.shape(addr).kind == ObjKind::Filler
    }

    /// Write a fresh header for `shape` at `obj` and clear its fields
    pub fn init_object(&self, obj: Address, shape: ObjectShape, layout: u64) {
        self.zero(obj.offset(HEADER_WORDS), shape.size_words - HEADER_WORDS);
        self.store(obj.offset(1), layout);
        self.set_mark(obj, MarkWord::PROTOTYPE);
    }

    /// Turn `[start, start + len)` into dead filler blocks
    pub fn fill_with_filler(&self, start: Address, len: usize) {
        match len {
            0 => {}
            1 => self.store(start, ONE_WORD_FILLER),
            _ => {
                let shape = ObjectShape::filler(len);
                // Filler shapes always encode; lengths are bounded by the region size.
                let layout = shape.encode().unwrap_or(ObjKind::Filler as u64);
                self.store(start.offset(1), layout);
                self.set_mark(start, MarkWord::PROTOTYPE);
            }
        }
    }

    /// Address of reference field `index` of `obj`
    #[inline]
    pub fn ref_slot(obj: Address, index: usize) -> Address {
        obj.offset(HEADER_WORDS + index)
    }
}
