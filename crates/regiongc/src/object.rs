//! Object header layout
//!
//! Every object starts with two words:
//!
//! ```text
//! word 0: mark word    Normal { age, hash } | Forwarded(addr) | EvacFailed
//! word 1: layout word  kind:2 | ref_fields:30 | size_words:32
//! ```
//!
//! Reference fields follow the header, then primitive data words. A one-word
//! hole that cannot hold a full header is marked with `ONE_WORD_FILLER`.

use crate::address::Address;
use crate::error::AllocError;

/// Words occupied by the object header
pub const HEADER_WORDS: usize = 2;

/// Oldest representable object age
pub const MAX_AGE: u8 = 15;

/// Mark-word value of a single-word filler
pub const ONE_WORD_FILLER: u64 = 0b100;

const TAG_MASK: u64 = 0b11;
const TAG_NORMAL: u64 = 0b01;
const TAG_EVAC_FAILED: u64 = 0b10;
const TAG_FORWARDED: u64 = 0b11;
const AGE_SHIFT: u32 = 2;
const AGE_MASK: u64 = 0xF;
const HASH_SHIFT: u32 = 8;

const KIND_MASK: u64 = 0b11;
const REFS_SHIFT: u32 = 2;
const REFS_MASK: u64 = (1 << 30) - 1;
const SIZE_SHIFT: u32 = 32;

/// Decoded mark word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkWord {
    /// Regular object
    Normal {
        /// Number of pauses survived
        age: u8,
        /// Identity hash, 0 if never requested
        hash: u32,
    },
    /// Object was copied; this is the new location
    Forwarded(Address),
    /// Object failed evacuation and stays in place during this pause
    EvacFailed,
}

impl MarkWord {
    /// Mark word of a freshly allocated object
    pub const PROTOTYPE: MarkWord = MarkWord::Normal { age: 0, hash: 0 };

    /// Encode into a raw header word
    pub fn encode(self) -> u64 {
        match self {
            MarkWord::Normal { age, hash } => {
                TAG_NORMAL
                    | ((age as u64 & AGE_MASK) << AGE_SHIFT)
                    | ((hash as u64) << HASH_SHIFT)
            }
            MarkWord::Forwarded(addr) => ((addr.as_usize() as u64) << 2) | TAG_FORWARDED,
            MarkWord::EvacFailed => TAG_EVAC_FAILED,
        }
    }

    /// Decode a raw header word
    pub fn decode(raw: u64) -> MarkWord {
        match raw & TAG_MASK {
            TAG_NORMAL => MarkWord::Normal {
                age: ((raw >> AGE_SHIFT) & AGE_MASK) as u8,
                hash: (raw >> HASH_SHIFT) as u32,
            },
            TAG_FORWARDED => MarkWord::Forwarded(Address::new((raw >> 2) as usize)),
            TAG_EVAC_FAILED => MarkWord::EvacFailed,
            _ => panic!("corrupt mark word {raw:#x}"),
        }
    }

    /// Age of a normal object, 0 otherwise
    pub fn age(self) -> u8 {
        match self {
            MarkWord::Normal { age, .. } => age,
            _ => 0,
        }
    }

    /// Copy of this mark with the age incremented, saturating at `MAX_AGE`
    pub fn incr_age(self) -> MarkWord {
        match self {
            MarkWord::Normal { age, hash } => MarkWord::Normal {
                age: (age + 1).min(MAX_AGE),
                hash,
            },
            other => other,
        }
    }

    /// Whether this mark carries state that must survive an evacuation failure
    pub fn must_be_preserved(self) -> bool {
        matches!(self, MarkWord::Normal { hash, .. } if hash != 0)
    }

    /// Whether the object has been copied or failed to copy
    pub fn is_forwarded(self) -> bool {
        matches!(self, MarkWord::Forwarded(_) | MarkWord::EvacFailed)
    }
}

/// Object kind stored in the layout word
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjKind {
    /// Fixed reference fields followed by primitive data
    Instance = 0,
    /// Array of references
    ObjArray = 1,
    /// Array of primitive words
    TypeArray = 2,
    /// Dead space
    Filler = 3,
}

/// Size and reference layout of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectShape {
    /// Object kind
    pub kind: ObjKind,
    /// Number of reference fields directly after the header
    pub ref_fields: usize,
    /// Total size including header, in words
    pub size_words: usize,
}

impl ObjectShape {
    /// Instance with `ref_fields` references and `data_words` primitive words
    pub fn instance(ref_fields: usize, data_words: usize) -> Self {
        Self {
            kind: ObjKind::Instance,
            ref_fields,
            size_words: HEADER_WORDS + ref_fields + data_words,
        }
    }

    /// Array of `len` references
    pub fn obj_array(len: usize) -> Self {
        Self {
            kind: ObjKind::ObjArray,
            ref_fields: len,
            size_words: HEADER_WORDS + len,
        }
    }

    /// Array of `len` primitive words
    pub fn type_array(len: usize) -> Self {
        Self {
            kind: ObjKind::TypeArray,
            ref_fields: 0,
            size_words: HEADER_WORDS + len,
        }
    }

    /// Filler spanning `size_words` words (at least a full header)
    pub fn filler(size_words: usize) -> Self {
        debug_assert!(size_words >= HEADER_WORDS);
        Self {
            kind: ObjKind::Filler,
            ref_fields: 0,
            size_words,
        }
    }

    /// Primitive words after the reference fields
    pub fn data_words(&self) -> usize {
        self.size_words - HEADER_WORDS - self.ref_fields
    }

    /// Encode as a layout word, rejecting shapes the header cannot hold
    pub fn encode(&self) -> Result<u64, AllocError> {
        if self.ref_fields as u64 > REFS_MASK {
            return Err(AllocError::InvalidShape("too many reference fields"));
        }
        if self.size_words as u64 > u32::MAX as u64 {
            return Err(AllocError::InvalidShape("object too large"));
        }
        if self.size_words < HEADER_WORDS + self.ref_fields {
            return Err(AllocError::InvalidShape("size smaller than header and fields"));
        }
        Ok((self.kind as u64)
            | ((self.ref_fields as u64) << REFS_SHIFT)
            | ((self.size_words as u64) << SIZE_SHIFT))
    }

    /// Decode a layout word
    pub fn decode(raw: u64) -> Self {
        let kind = match raw & KIND_MASK {
            0 => ObjKind::Instance,
            1 => ObjKind::ObjArray,
            2 => ObjKind::TypeArray,
            _ => ObjKind::Filler,
        };
        Self {
            kind,
            ref_fields: ((raw >> REFS_SHIFT) & REFS_MASK) as usize,
            size_words: (raw >> SIZE_SHIFT) as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_word_encoding() {
        let marks = [
            MarkWord::PROTOTYPE,
            MarkWord::Normal { age: 7, hash: 0xdead_beef },
            MarkWord::Forwarded(Address::new(0x1234_5678)),
            MarkWord::EvacFailed,
        ];
        for mark in marks {
            assert_eq!(MarkWord::decode(mark.encode()), mark);
        }
        assert_ne!(MarkWord::EvacFailed.encode(), ONE_WORD_FILLER);
    }

    #[test]
    fn test_age_saturates() {
        let mut mark = MarkWord::PROTOTYPE;
        for _ in 0..40 {
            mark = mark.incr_age();
        }
        assert_eq!(mark.age(), MAX_AGE);
    }

    #[test]
    fn test_preservation_needs_hash() {
        assert!(!MarkWord::Normal { age: 3, hash: 0 }.must_be_preserved());
        assert!(MarkWord::Normal { age: 0, hash: 9 }.must_be_preserved());
        assert!(!MarkWord::EvacFailed.must_be_preserved());
    }

    #[test]
    fn test_layout_word() {
        let shape = ObjectShape::instance(3, 5);
        assert_eq!(shape.size_words, 10);
        assert_eq!(shape.data_words(), 5);
        assert_eq!(ObjectShape::decode(shape.encode().unwrap()), shape);

        let array = ObjectShape::type_array(100);
        assert_eq!(ObjectShape::decode(array.encode().unwrap()).kind, ObjKind::TypeArray);
    }

    #[test]
    fn test_invalid_shape() {
        let shape = ObjectShape {
            kind: ObjKind::Instance,
            ref_fields: 4,
            size_words: 3,
        };
        assert!(shape.encode().is_err());
    }
}
