//! Page-backed record storage for address-space bookkeeping.
//!
//! An address space cannot use the heap to track its own ranges, since the
//! heap is carved out of those ranges. Records are kept in whole frames taken
//! from the frame allocator instead, chained through their physical addresses.

use core::marker::PhantomData;

use x86_64::{PhysAddr, VirtAddr};

use crate::{
    constants::memory::FRAME_SIZE,
    memory::{error::MemoryError, physical::PhysicalMemoryManager},
};

/// A fixed-size record that can be stored in a [`RecordArena`].
pub trait Record: Copy {
    /// Marker value for an unused slot.
    const VACANT: Self;

    fn is_vacant(&self) -> bool;
}

/// One frame worth of records. `next` is the physical address of the next
/// page, or zero for the last one.
#[repr(C)]
pub struct RecordPage<T, const N: usize> {
    records: [T; N],
    next: u64,
}

pub struct RecordArena<T: Record, const N: usize> {
    first: PhysAddr,
    current: PhysAddr,
    /// Slots of the current page below this have been handed out at least once.
    cursor: usize,
    pages: usize,
    direct_map: VirtAddr,
    _marker: PhantomData<T>,
}

impl<T: Record, const N: usize> RecordArena<T, N> {
    const FITS_IN_FRAME: () = assert!(
        core::mem::size_of::<RecordPage<T, N>>() <= FRAME_SIZE,
        "record page does not fit in a frame"
    );

    pub fn new(pmm: &mut PhysicalMemoryManager) -> Result<Self, MemoryError> {
        #[allow(clippy::let_unit_value)]
        let () = Self::FITS_IN_FRAME;

        let first = Self::new_page(pmm)?;
        Ok(Self {
            first,
            current: first,
            cursor: 0,
            pages: 1,
            direct_map: pmm.direct_map_offset(),
            _marker: PhantomData,
        })
    }

    fn new_page(pmm: &mut PhysicalMemoryManager) -> Result<PhysAddr, MemoryError> {
        let frame = pmm.allocate_frame()?;
        let page = pmm.phys_to_virt(frame).as_mut_ptr::<RecordPage<T, N>>();

        // SAFETY: the frame was just allocated and is reachable through the direct map.
        unsafe {
            page.write(RecordPage {
                records: [T::VACANT; N],
                next: 0,
            });
        }
        Ok(frame)
    }

    fn page(&self, frame: PhysAddr) -> *mut RecordPage<T, N> {
        (self.direct_map + frame.as_u64()).as_mut_ptr()
    }

    /// Stores `record`, reusing vacated slots once the current page is full
    /// and chaining a new page only when none are left.
    pub fn insert(
        &mut self,
        record: T,
        pmm: &mut PhysicalMemoryManager,
    ) -> Result<(), MemoryError> {
        if self.cursor < N {
            // SAFETY: `current` is a page owned by this arena.
            unsafe { (*self.page(self.current)).records[self.cursor] = record };
            self.cursor += 1;
            return Ok(());
        }

        if let Some(slot) = self.slots_mut().find(|slot| slot.is_vacant()) {
            *slot = record;
            return Ok(());
        }

        let frame = Self::new_page(pmm)?;
        // SAFETY: both pages are owned by this arena.
        unsafe {
            (*self.page(self.current)).next = frame.as_u64();
            (*self.page(frame)).records[0] = record;
        }
        self.current = frame;
        self.cursor = 1;
        self.pages += 1;
        Ok(())
    }

    /// Every slot, vacant or not.
    fn slots_mut(&mut self) -> SlotsMut<'_, T, N> {
        SlotsMut {
            page: self.page(self.first),
            index: 0,
            direct_map: self.direct_map,
            _marker: PhantomData,
        }
    }

    /// Records in storage order.
    pub fn iter(&self) -> Records<'_, T, N> {
        Records {
            page: self.page(self.first),
            index: 0,
            direct_map: self.direct_map,
            _marker: PhantomData,
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots_mut().filter(|slot| !slot.is_vacant())
    }

    /// The first record matching `predicate`.
    pub fn find_mut(&mut self, predicate: impl Fn(&T) -> bool) -> Option<&mut T> {
        self.iter_mut().find(|record| predicate(record))
    }

    /// Vacates the first record matching `predicate` and returns it.
    pub fn remove(&mut self, predicate: impl Fn(&T) -> bool) -> Option<T> {
        let slot = self.find_mut(predicate)?;
        let record = *slot;
        *slot = T::VACANT;
        Some(record)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Frames currently holding records.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Hands every page back to the frame allocator.
    pub fn release(self, pmm: &mut PhysicalMemoryManager) -> Result<(), MemoryError> {
        let mut frame = self.first;
        while !frame.is_null() {
            // SAFETY: the chain only holds pages owned by this arena.
            let next = unsafe { (*self.page(frame)).next };
            pmm.free_frame(frame)?;
            frame = PhysAddr::new(next);
        }
        Ok(())
    }
}

pub struct Records<'a, T, const N: usize> {
    page: *mut RecordPage<T, N>,
    index: usize,
    direct_map: VirtAddr,
    _marker: PhantomData<&'a T>,
}

impl<'a, T: Record, const N: usize> Iterator for Records<'a, T, N> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        while !self.page.is_null() {
            if self.index == N {
                // SAFETY: `page` is a live page of the arena borrowed for `'a`.
                let next = unsafe { (*self.page).next };
                self.page = if next == 0 {
                    core::ptr::null_mut()
                } else {
                    (self.direct_map + next).as_mut_ptr()
                };
                self.index = 0;
                continue;
            }

            // SAFETY: as above.
            let record = unsafe { &(*self.page).records[self.index] };
            self.index += 1;
            if !record.is_vacant() {
                return Some(record);
            }
        }
        None
    }
}

struct SlotsMut<'a, T, const N: usize> {
    page: *mut RecordPage<T, N>,
    index: usize,
    direct_map: VirtAddr,
    _marker: PhantomData<&'a mut T>,
}

impl<'a, T: Record, const N: usize> Iterator for SlotsMut<'a, T, N> {
    type Item = &'a mut T;

    fn next(&mut self) -> Option<&'a mut T> {
        while !self.page.is_null() {
            if self.index == N {
                // SAFETY: `page` is a live page of the arena borrowed mutably for `'a`.
                let next = unsafe { (*self.page).next };
                self.page = if next == 0 {
                    core::ptr::null_mut()
                } else {
                    (self.direct_map + next).as_mut_ptr()
                };
                self.index = 0;
                continue;
            }

            // SAFETY: each slot is yielded at most once.
            let slot = unsafe { &mut (*self.page).records[self.index] };
            self.index += 1;
            return Some(slot);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimulatedMemory;
    use alloc::vec::Vec;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Range {
        start: u64,
        size: u64,
    }

    impl Record for Range {
        const VACANT: Self = Range { start: 0, size: 0 };

        fn is_vacant(&self) -> bool {
            self.size == 0
        }
    }

    fn range(start: u64) -> Range {
        Range { start, size: 0x1000 }
    }

    #[test]
    fn test_insert_and_iterate_in_order() {
        let memory = SimulatedMemory::new(16);
        let mut pmm = memory.pmm();
        let mut arena = RecordArena::<Range, 4>::new(&mut pmm).unwrap();

        for start in 1..=3 {
            arena.insert(range(start), &mut pmm).unwrap();
        }

        let starts: Vec<u64> = arena.iter().map(|r| r.start).collect();
        assert_eq!(starts, [1, 2, 3]);
        assert_eq!(arena.pages(), 1);
    }

    #[test]
    fn test_full_page_reuses_vacant_slot_before_chaining() {
        let memory = SimulatedMemory::new(16);
        let mut pmm = memory.pmm();
        let mut arena = RecordArena::<Range, 4>::new(&mut pmm).unwrap();

        for start in 1..=4 {
            arena.insert(range(start), &mut pmm).unwrap();
        }
        assert_eq!(arena.remove(|r| r.start == 2), Some(range(2)));
        assert_eq!(arena.len(), 3);

        let used = pmm.memory_used();
        arena.insert(range(9), &mut pmm).unwrap();
        assert_eq!(arena.pages(), 1);
        assert_eq!(pmm.memory_used(), used);

        arena.insert(range(10), &mut pmm).unwrap();
        assert_eq!(arena.pages(), 2);

        let starts: Vec<u64> = arena.iter().map(|r| r.start).collect();
        assert_eq!(starts, [1, 9, 3, 4, 10]);
    }

    #[test]
    fn test_find_mut_updates_in_place() {
        let memory = SimulatedMemory::new(16);
        let mut pmm = memory.pmm();
        let mut arena = RecordArena::<Range, 4>::new(&mut pmm).unwrap();

        arena.insert(range(7), &mut pmm).unwrap();
        arena.find_mut(|r| r.start == 7).unwrap().size = 0x3000;
        assert_eq!(arena.iter().next().unwrap().size, 0x3000);
        assert!(arena.find_mut(|r| r.start == 8).is_none());
    }

    #[test]
    fn test_release_frees_every_page() {
        let memory = SimulatedMemory::new(16);
        let mut pmm = memory.pmm();
        let free = pmm.free_frames();

        let mut arena = RecordArena::<Range, 2>::new(&mut pmm).unwrap();
        for start in 1..=5 {
            arena.insert(range(start), &mut pmm).unwrap();
        }
        assert_eq!(arena.pages(), 3);

        arena.release(&mut pmm).unwrap();
        assert_eq!(pmm.free_frames(), free);
    }
}
