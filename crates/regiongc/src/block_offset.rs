//! Block offset table
//!
//! One entry per card: how many words before the card start the block
//! covering that card start begins. Card scanning uses it to find the first
//! object overlapping a dirty card without walking from the region bottom.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::address::Address;
use crate::config::HeapGeometry;
use crate::storage::HeapStorage;

/// Block offset table for the whole reserved heap
pub struct BlockOffsetTable {
    geometry: HeapGeometry,
    entries: Box<[AtomicU32]>,
}

impl BlockOffsetTable {
    /// Table covering every card of `geometry`
    pub fn new(geometry: HeapGeometry) -> Self {
        Self {
            geometry,
            entries: (0..geometry.num_cards()).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Record that a block occupies `[start, end)`
    pub fn update_for_block(&self, start: Address, end: Address) {
        if start >= end {
            return;
        }
        let mut card = self.geometry.card_index(start);
        if self.geometry.card_start(card) < start {
            card += 1;
        }
        loop {
            let card_start = self.geometry.card_start(card);
            if card_start >= end {
                break;
            }
            self.entries[card].store(card_start.words_from(start) as u32, Ordering::Release);
            card += 1;
        }
    }

    /// Start of the block covering card `card`'s first word, from the table alone
    pub fn entry_block_start(&self, card: usize) -> Address {
        let card_start = self.geometry.card_start(card);
        let back = self.entries[card].load(Ordering::Acquire) as usize;
        Address::new(card_start.as_usize() - back)
    }

    /// Start of the block containing `addr`, walking forward from the table entry
    pub fn block_start(&self, storage: &HeapStorage, addr: Address) -> Address {
        let mut q = self.entry_block_start(self.geometry.card_index(addr));
        loop {
            let next = q.offset(storage.block_size(q));
            if next > addr {
                return q;
            }
            q = next;
        }
    }
}
