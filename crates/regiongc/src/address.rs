//! Heap word addresses

use std::fmt;

/// Bytes per heap word
pub const WORD_SIZE: usize = 8;

/// Word index of the first heap word; region aligned for every supported region size
const HEAP_BASE_WORDS: usize = 1 << 24;

/// A word address into the managed heap.
///
/// Addresses count words, not bytes. `Address::NULL` is never inside the heap.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(usize);

impl Address {
    /// The null reference
    pub const NULL: Address = Address(0);

    /// Create an address from a raw word index
    #[inline]
    pub const fn new(word: usize) -> Self {
        Self(word)
    }

    /// Address of the first heap word
    #[inline]
    pub const fn heap_base() -> Self {
        Self(HEAP_BASE_WORDS)
    }

    /// Raw word index
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Whether this is the null reference
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `words` words above this one
    #[inline]
    pub const fn offset(self, words: usize) -> Self {
        Self(self.0 + words)
    }

    /// Words between `start` and this address
    #[inline]
    pub fn words_from(self, start: Address) -> usize {
        debug_assert!(self.0 >= start.0, "{self} below {start}");
        self.0 - start.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_and_offsets() {
        assert!(Address::NULL.is_null());
        let base = Address::heap_base();
        assert!(!base.is_null());
        assert_eq!(base.offset(10).words_from(base), 10);
        assert_eq!(format!("{}", Address::new(255)), "0xff");
    }
}
