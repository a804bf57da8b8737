//! Heap verification
//!
//! Checks region set membership, humongous series, object parsability of
//! old and humongous regions, the block offset table, references into free
//! regions, transient mark words, used-byte accounting and the evacuation
//! failure bitmap. Must run while the world is stopped.

use crate::address::Address;
use crate::error::VerifyError;
use crate::heap::Heap;
use crate::object::ObjKind;
use crate::region::{Region, RegionType, SetKind};
use crate::storage::HeapStorage;

/// Per-set membership counts gathered from region tags
#[derive(Debug, Default)]
struct TagCounts {
    free: usize,
    young: usize,
    old: usize,
    humongous: usize,
}

/// Walks the heap and reports the first inconsistency
pub struct HeapVerifier<'a> {
    heap: &'a Heap,
}

impl<'a> HeapVerifier<'a> {
    /// Verifier over `heap`
    pub fn new(heap: &'a Heap) -> Self {
        Self { heap }
    }

    /// Run all checks
    pub fn verify(&self) -> Result<(), VerifyError> {
        let counts = self.verify_region_tags()?;
        self.verify_set_lengths(&counts)?;
        for region in self.heap.manager().regions() {
            if !self.heap.manager().is_available(region.index()) {
                continue;
            }
            // Only failure recovery inside a pause moves the parsable bottom.
            if !region.is_parsable() {
                return Err(VerifyError::Unparsable {
                    region: region.index(),
                    addr: region.parsable_bottom().as_usize(),
                });
            }
            match region.region_type() {
                RegionType::Old => self.verify_old_region(region)?,
                RegionType::StartsHumongous => self.verify_humongous(region)?,
                _ => {}
            }
            self.verify_failure_bitmap_clear(region)?;
        }
        self.verify_roots()?;
        self.verify_used()?;
        tracing::trace!(
            target: "regiongc::verify",
            free = counts.free,
            young = counts.young,
            old = counts.old,
            humongous = counts.humongous,
            "heap verified"
        );
        Ok(())
    }

    fn verify_region_tags(&self) -> Result<TagCounts, VerifyError> {
        let manager = self.heap.manager();
        let mut counts = TagCounts::default();
        for region in manager.regions() {
            let tag = region.containing_set();
            let ty = region.region_type();
            let expected = if manager.is_available(region.index()) {
                match ty {
                    RegionType::Free => SetKind::Free,
                    RegionType::Eden | RegionType::Survivor => SetKind::Young,
                    RegionType::Old => SetKind::Old,
                    RegionType::StartsHumongous | RegionType::ContinuesHumongous => SetKind::Humongous,
                }
            } else {
                SetKind::None
            };
            if tag != expected {
                return Err(VerifyError::WrongContainingSet {
                    region: region.index(),
                    region_type: ty.name(),
                    set: tag.name(),
                });
            }
            match tag {
                SetKind::Free => counts.free += 1,
                SetKind::Young => counts.young += 1,
                SetKind::Old => counts.old += 1,
                SetKind::Humongous => counts.humongous += 1,
                SetKind::None => {}
            }
        }
        Ok(counts)
    }

    fn verify_set_lengths(&self, counts: &TagCounts) -> Result<(), VerifyError> {
        let check = |set: SetKind, recorded: usize, tagged: usize| {
            if recorded == tagged {
                Ok(())
            } else {
                Err(VerifyError::SetLengthMismatch {
                    set: set.name(),
                    recorded,
                    tagged,
                })
            }
        };
        check(SetKind::Free, self.heap.manager().num_free_regions() as usize, counts.free)?;
        {
            let young = self.heap.young.lock();
            check(SetKind::Young, young.set.len(), counts.young)?;
            check(SetKind::Young, young.eden.len() + young.survivors.len(), counts.young)?;
        }
        let sets = self.heap.old_sets.lock();
        check(SetKind::Old, sets.old.len(), counts.old)?;
        check(SetKind::Humongous, sets.humongous.len(), counts.humongous)
    }

    fn verify_old_region(&self, region: &Region) -> Result<(), VerifyError> {
        let storage = self.heap.storage();
        let top = region.top();
        let mut objects = Vec::new();
        let mut cur = region.bottom();
        while cur < top {
            let size = storage.block_size(cur);
            if size == 0 || cur.offset(size) > top {
                return Err(VerifyError::Unparsable {
                    region: region.index(),
                    addr: cur.as_usize(),
                });
            }
            if !storage.is_filler(cur) {
                self.verify_object(cur)?;
            }
            objects.push(cur);
            cur = cur.offset(size);
        }
        self.verify_block_offsets(region, &objects, top)
    }

    fn verify_humongous(&self, start: &Region) -> Result<(), VerifyError> {
        let heap = self.heap;
        let storage = heap.storage();
        let obj = start.bottom();
        let shape = storage.shape(obj);
        let obj_end = obj.offset(shape.size_words);
        let len = heap.humongous_series_len(start.index());
        let last = heap.region(start.index() + len - 1);
        let spans = obj_end.words_from(obj).div_ceil(heap.geometry().region_words) as u32;
        if shape.kind == ObjKind::Filler || spans != len || last.top() != obj_end {
            return Err(VerifyError::BrokenHumongous(start.index()));
        }
        self.verify_object(obj)?;
        self.verify_block_offsets(start, &[obj], start.top())
    }

    /// Every card starting below `top` must resolve to the walked block covering it
    fn verify_block_offsets(&self, region: &Region, blocks: &[Address], top: Address) -> Result<(), VerifyError> {
        let heap = self.heap;
        let geometry = heap.geometry();
        let first = geometry.card_index(region.bottom());
        let last = geometry.card_index(region.end());
        let mut block = 0;
        for card in first..last {
            let card_start = geometry.card_start(card);
            if card_start >= top {
                break;
            }
            while block + 1 < blocks.len() && blocks[block + 1] <= card_start {
                block += 1;
            }
            let expected = blocks.get(block).copied().unwrap_or(Address::NULL);
            if heap.bot().block_start(heap.storage(), card_start) != expected {
                return Err(VerifyError::BlockOffset {
                    region: region.index(),
                    addr: card_start.as_usize(),
                });
            }
        }
        Ok(())
    }

    fn verify_object(&self, obj: Address) -> Result<(), VerifyError> {
        let storage = self.heap.storage();
        if storage.mark(obj).is_forwarded() {
            return Err(VerifyError::TransientMark(obj.as_usize()));
        }
        let shape = storage.shape(obj);
        for i in 0..shape.ref_fields {
            let slot = HeapStorage::ref_slot(obj, i);
            self.verify_reference(slot.as_usize(), storage.load_ref(slot))?;
        }
        Ok(())
    }

    fn verify_reference(&self, slot: usize, target: Address) -> Result<(), VerifyError> {
        if target.is_null() {
            return Ok(());
        }
        let heap = self.heap;
        let dangling = !heap.geometry().contains(target) || {
            let region = heap.region_containing(target);
            !heap.manager().is_available(region.index()) || region.is_free() || target >= region.top()
        };
        if dangling {
            return Err(VerifyError::DanglingReference {
                slot,
                target: target.as_usize(),
            });
        }
        Ok(())
    }

    fn verify_roots(&self) -> Result<(), VerifyError> {
        let mut result = Ok(());
        self.heap.roots().for_each(|target| {
            if result.is_ok() {
                result = self.verify_reference(0, target);
            }
        });
        result
    }

    fn verify_used(&self) -> Result<(), VerifyError> {
        let recorded = self.heap.used();
        let actual = self.heap.recalculate_used_bytes();
        if recorded != actual {
            return Err(VerifyError::UsedMismatch { recorded, actual });
        }
        Ok(())
    }

    fn verify_failure_bitmap_clear(&self, region: &Region) -> Result<(), VerifyError> {
        let base = self.heap.geometry().base;
        if self
            .heap
            .evac_failure_bitmap()
            .any_in_range(region.bottom().words_from(base), region.end().words_from(base))
        {
            return Err(VerifyError::StaleFailureBitmap(region.index()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::heap::AllocRequest;
    use crate::object::{MarkWord, ObjectShape};
    use std::sync::Arc;

    fn heap() -> Arc<Heap> {
        Heap::builder(GcConfig {
            region_size_bytes: 64 * 1024,
            initial_heap_bytes: 512 * 1024,
            max_heap_bytes: 1024 * 1024,
            parallel_gc_threads: 1,
            ..Default::default()
        })
        .service_thread(false)
        .build()
        .unwrap()
    }

    fn humongous(heap: &Heap, len: usize) -> Address {
        let shape = ObjectShape::obj_array(len);
        let (obj, _) = heap
            .mem_allocate(AllocRequest::Humongous {
                word_size: shape.size_words,
            })
            .unwrap();
        heap.init_object(obj, shape).unwrap();
        obj
    }

    #[test]
    fn test_fresh_heap_verifies() {
        heap().verify().unwrap();
    }

    #[test]
    fn test_humongous_series_verifies() {
        let heap = heap();
        humongous(&heap, 10_000);
        heap.verify().unwrap();
        assert_eq!(heap.humongous_regions_count(), 2);
    }

    #[test]
    fn test_transient_mark_is_reported() {
        let heap = heap();
        let obj = humongous(&heap, 5_000);
        heap.storage().set_mark(obj, MarkWord::EvacFailed);
        assert_eq!(
            heap.verify(),
            Err(VerifyError::TransientMark(obj.as_usize()))
        );
    }

    #[test]
    fn test_dangling_reference_is_reported() {
        let heap = heap();
        let obj = humongous(&heap, 5_000);
        let free = heap.manager().free_list_snapshot()[0];
        let target = heap.region(free).bottom();
        let slot = HeapStorage::ref_slot(obj, 3);
        heap.storage().store_ref(slot, target);
        assert_eq!(
            heap.verify(),
            Err(VerifyError::DanglingReference {
                slot: slot.as_usize(),
                target: target.as_usize(),
            })
        );
    }

    #[test]
    fn test_raised_parsable_bottom_is_reported() {
        let heap = heap();
        let obj = humongous(&heap, 5_000);
        let region = heap.region_containing(obj);
        region.set_parsable_bottom(region.top());
        assert_eq!(
            heap.verify(),
            Err(VerifyError::Unparsable {
                region: region.index(),
                addr: region.top().as_usize(),
            })
        );
        region.reset_parsable_bottom();
        heap.verify().unwrap();
    }

    #[test]
    fn test_stale_failure_bitmap_is_reported() {
        let heap = heap();
        let region = heap.region(0);
        heap.evac_failure_bitmap()
            .par_set(region.bottom().words_from(heap.geometry().base) + 7);
        assert_eq!(heap.verify(), Err(VerifyError::StaleFailureBitmap(0)));
    }

    #[test]
    fn test_wrong_set_tag_is_reported() {
        let heap = heap();
        let free = heap.manager().free_list_snapshot()[0];
        heap.region(free).clear_containing_set(SetKind::Free);
        heap.region(free).set_containing_set(SetKind::Old);
        assert!(matches!(
            heap.verify(),
            Err(VerifyError::WrongContainingSet { region, .. }) if region == free
        ));
    }
}
