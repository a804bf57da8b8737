//! Lock-free atomic bitmap
//!
//! Used wherever several workers may discover the same fact at once: the
//! first `par_set` of a bit returns `true`, every later one `false`.

use std::sync::atomic::{AtomicU64, Ordering};

const BITS_PER_WORD: usize = 64;
const LOG2_BITS_PER_WORD: u32 = 6;

/// Fixed-size bitmap of atomic words
pub struct AtomicBitmap {
    words: Box<[AtomicU64]>,
    len: usize,
}

impl AtomicBitmap {
    /// Bitmap with `len` cleared bits
    pub fn new(len: usize) -> Self {
        let words = (0..len.div_ceil(BITS_PER_WORD))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self { words, len }
    }

    /// Number of bits
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the bitmap has no bits
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn split(bit: usize) -> (usize, u64) {
        (bit >> LOG2_BITS_PER_WORD, 1u64 << (bit & (BITS_PER_WORD - 1)))
    }

    /// Set `bit`, returning whether this call changed it
    #[inline]
    pub fn par_set(&self, bit: usize) -> bool {
        debug_assert!(bit < self.len);
        let (word, mask) = Self::split(bit);
        self.words[word].fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    /// Clear `bit`
    #[inline]
    pub fn clear(&self, bit: usize) {
        let (word, mask) = Self::split(bit);
        self.words[word].fetch_and(!mask, Ordering::AcqRel);
    }

    /// Test `bit`
    #[inline]
    pub fn get(&self, bit: usize) -> bool {
        let (word, mask) = Self::split(bit);
        self.words[word].load(Ordering::Acquire) & mask != 0
    }

    /// Clear bits in `[from, to)`
    pub fn clear_range(&self, from: usize, to: usize) {
        let mut bit = from;
        while bit < to {
            let (word, _) = Self::split(bit);
            let offset = bit & (BITS_PER_WORD - 1);
            if offset == 0 && bit + BITS_PER_WORD <= to {
                self.words[word].store(0, Ordering::Relaxed);
                bit += BITS_PER_WORD;
            } else {
                self.clear(bit);
                bit += 1;
            }
        }
    }

    /// Index of the first set bit in `[from, to)`, or `to` if none
    pub fn find_next_set(&self, from: usize, to: usize) -> usize {
        let to = to.min(self.len);
        let mut bit = from;
        while bit < to {
            let (word, _) = Self::split(bit);
            let offset = bit & (BITS_PER_WORD - 1);
            let value = self.words[word].load(Ordering::Acquire) >> offset;
            if value != 0 {
                let found = bit + value.trailing_zeros() as usize;
                return found.min(to);
            }
            bit += BITS_PER_WORD - offset;
        }
        to
    }

    /// Whether any bit in `[from, to)` is set
    pub fn any_in_range(&self, from: usize, to: usize) -> bool {
        self.find_next_set(from, to) < to
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_first_setter_wins() {
        let bitmap = AtomicBitmap::new(100);
        assert!(bitmap.par_set(42));
        assert!(!bitmap.par_set(42));
        assert!(bitmap.get(42));
        bitmap.clear(42);
        assert!(!bitmap.get(42));
    }

    #[test]
    fn test_find_next_set() {
        let bitmap = AtomicBitmap::new(300);
        bitmap.par_set(3);
        bitmap.par_set(130);
        assert_eq!(bitmap.find_next_set(0, 300), 3);
        assert_eq!(bitmap.find_next_set(4, 300), 130);
        assert_eq!(bitmap.find_next_set(131, 300), 300);
        assert_eq!(bitmap.find_next_set(4, 100), 100);
        bitmap.clear_range(0, 300);
        assert!(!bitmap.any_in_range(0, 300));
    }

    #[test]
    fn test_concurrent_setters_counted_once() {
        let bitmap = Arc::new(AtomicBitmap::new(64));
        let winners: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let bitmap = Arc::clone(&bitmap);
                    s.spawn(move || (0..64).filter(|&bit| bitmap.par_set(bit)).count())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 64);
    }
}
