//! Per-address-space virtual memory manager.
//!
//! Every address space hands out page-granular ranges between a start address
//! and a ceiling. Ranges come from a free list of reclaimed space first and
//! from a monotonic watermark otherwise, and are backed with fresh frames
//! unless the caller asks for a bare reservation.

use core::mem::size_of;

use x86_64::{PhysAddr, VirtAddr};

use crate::{
    constants::memory::{
        FRAME_SIZE, HIGHER_HALF_DIRECT_MAP, KERNEL_PML4_START, KERNEL_SPACE_END, PAGE_SIZE,
        PAGE_TABLE_ENTRIES, USER_SPACE_END, USER_SPACE_START, VMM_RESERVED,
    },
    memory::{
        address::{check_aligned, checked_align_to_page},
        chunk_region::{Record, RecordArena, RecordPage, Records},
        error::MemoryError,
        heap::HeapSource,
        paging::{self, PageFlags, RESERVE, SHARED},
        physical::PhysicalMemoryManager,
        with_physical_memory_manager,
    },
};

/// A range handed out by a [`VirtualMemoryManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct VirtualMemoryChunk {
    pub start_address: u64,
    pub size: usize,
    pub flags: PageFlags,
}

impl VirtualMemoryChunk {
    pub fn end_address(&self) -> u64 {
        self.start_address + self.size as u64
    }

    pub fn contains(&self, address: u64) -> bool {
        (self.start_address..self.end_address()).contains(&address)
    }

    /// Whether freeing the range also frees its frames.
    pub fn owns_frames(&self) -> bool {
        !self.flags.intersects(RESERVE | SHARED)
    }
}

impl Record for VirtualMemoryChunk {
    const VACANT: Self = Self {
        start_address: 0,
        size: 0,
        flags: PageFlags::empty(),
    };

    fn is_vacant(&self) -> bool {
        self.size == 0
    }
}

/// A reclaimed range waiting to be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct FreeChunk {
    pub start_address: u64,
    pub size: usize,
}

impl FreeChunk {
    pub fn end_address(&self) -> u64 {
        self.start_address + self.size as u64
    }
}

impl Record for FreeChunk {
    const VACANT: Self = Self {
        start_address: 0,
        size: 0,
    };

    fn is_vacant(&self) -> bool {
        self.size == 0
    }
}

/// Chunk records per bookkeeping page, leaving room for the link to the next page.
pub const CHUNKS_PER_PAGE: usize = FRAME_SIZE / size_of::<VirtualMemoryChunk>() - 1;
pub const FREE_CHUNKS_PER_PAGE: usize = FRAME_SIZE / size_of::<FreeChunk>() - 1;

/// One page of chunk records.
pub type VirtualMemoryRegion = RecordPage<VirtualMemoryChunk, CHUNKS_PER_PAGE>;

pub struct VirtualMemoryManager {
    pml4_root: PhysAddr,
    is_kernel: bool,
    chunks: RecordArena<VirtualMemoryChunk, CHUNKS_PER_PAGE>,
    free_chunks: RecordArena<FreeChunk, FREE_CHUNKS_PER_PAGE>,
    first_address: u64,
    next_available_address: u64,
    ceiling: u64,
    memory_used: usize,
}

impl VirtualMemoryManager {
    /// Manager for the kernel half. Uses the PMM's PML4 and starts past the
    /// direct map of all physical memory.
    pub fn new_kernel(pmm: &mut PhysicalMemoryManager) -> Result<Self, MemoryError> {
        let direct_map_end = HIGHER_HALF_DIRECT_MAP + pmm.memory_size() + PAGE_SIZE;
        let first_address = direct_map_end.next_multiple_of(PAGE_SIZE) + VMM_RESERVED;
        Self::with_root(pmm.pml4_root(), true, first_address, KERNEL_SPACE_END, pmm)
    }

    /// Manager for a fresh user address space. The kernel half of the new PML4
    /// is shared with the kernel's.
    pub fn new_user(pmm: &mut PhysicalMemoryManager) -> Result<Self, MemoryError> {
        let root = pmm.allocate_frame()?;
        pmm.clean_page_table(root);

        let direct_map = pmm.direct_map_offset();
        // SAFETY: both frames hold PML4s and are distinct.
        unsafe {
            let kernel = paging::table_at(direct_map, pmm.pml4_root());
            let user = paging::table_at(direct_map, root);
            for index in KERNEL_PML4_START..PAGE_TABLE_ENTRIES {
                user[index] = kernel[index].clone();
            }
        }

        match Self::with_root(root, false, USER_SPACE_START, USER_SPACE_END, pmm) {
            Ok(vmm) => Ok(vmm),
            Err(err) => {
                pmm.free_frame(root)?;
                Err(err)
            }
        }
    }

    fn with_root(
        pml4_root: PhysAddr,
        is_kernel: bool,
        first_address: u64,
        ceiling: u64,
        pmm: &mut PhysicalMemoryManager,
    ) -> Result<Self, MemoryError> {
        let chunks = RecordArena::new(pmm)?;
        let free_chunks = match RecordArena::new(pmm) {
            Ok(free_chunks) => free_chunks,
            Err(err) => {
                chunks.release(pmm)?;
                return Err(err);
            }
        };

        log::debug!(
            "New {} address space at {:?}, window {:#x}..{:#x}",
            if is_kernel { "kernel" } else { "user" },
            pml4_root,
            first_address,
            ceiling
        );

        Ok(Self {
            pml4_root,
            is_kernel,
            chunks,
            free_chunks,
            first_address,
            next_available_address: first_address,
            ceiling,
            memory_used: 0,
        })
    }

    pub fn pml4_root(&self) -> PhysAddr {
        self.pml4_root
    }

    /// The PML4 as seen through the kernel's direct map.
    pub fn pml4_root_address(&self) -> VirtAddr {
        VirtAddr::new(HIGHER_HALF_DIRECT_MAP + self.pml4_root.as_u64())
    }

    pub fn is_kernel(&self) -> bool {
        self.is_kernel
    }

    pub fn first_address(&self) -> u64 {
        self.first_address
    }

    pub fn next_available_address(&self) -> u64 {
        self.next_available_address
    }

    /// Bytes in ranges currently handed out.
    pub fn memory_used(&self) -> usize {
        self.memory_used
    }

    pub fn chunks(&self) -> Records<'_, VirtualMemoryChunk, CHUNKS_PER_PAGE> {
        self.chunks.iter()
    }

    pub fn free_ranges(&self) -> Records<'_, FreeChunk, FREE_CHUNKS_PER_PAGE> {
        self.free_chunks.iter()
    }

    /// Flags actually written for pages of this address space.
    fn page_flags(&self, flags: PageFlags) -> PageFlags {
        if self.is_kernel {
            flags
        } else {
            flags | PageFlags::USER_ACCESSIBLE
        }
    }

    /// Hands out `size` bytes (rounded up to whole pages) anywhere in the window.
    pub fn allocate(
        &mut self,
        size: usize,
        flags: PageFlags,
        pmm: &mut PhysicalMemoryManager,
    ) -> Result<VirtAddr, MemoryError> {
        if size == 0 {
            return Err(MemoryError::ZeroSize);
        }
        let size = checked_align_to_page(size).ok_or(MemoryError::OutOfVirtualSpace)?;

        let start = match self.take_free_range(size) {
            Some(start) => start,
            None => {
                let start = self.next_available_address;
                let end = start
                    .checked_add(size as u64)
                    .filter(|&end| end <= self.ceiling)
                    .ok_or(MemoryError::OutOfVirtualSpace)?;
                self.next_available_address = end;
                start
            }
        };

        if let Err(err) = self.commit(start, size, flags, pmm) {
            self.release_range(start, size, pmm)?;
            return Err(err);
        }
        Ok(VirtAddr::new(start))
    }

    /// Hands out `size` bytes at a fixed, page-aligned address. Fails with
    /// [`MemoryError::AlreadyMapped`] if any part of the range is in use.
    pub fn allocate_at(
        &mut self,
        address: VirtAddr,
        size: usize,
        flags: PageFlags,
        pmm: &mut PhysicalMemoryManager,
    ) -> Result<VirtAddr, MemoryError> {
        if size == 0 {
            return Err(MemoryError::ZeroSize);
        }
        let start = address.as_u64();
        if !check_aligned(start) {
            return Err(MemoryError::AlignmentViolation);
        }
        if start == 0 {
            return Err(MemoryError::InvalidAddress);
        }

        let size = checked_align_to_page(size).ok_or(MemoryError::OutOfVirtualSpace)?;
        let end = start
            .checked_add(size as u64)
            .filter(|&end| end <= self.ceiling)
            .ok_or(MemoryError::OutOfVirtualSpace)?;

        if self
            .chunks
            .iter()
            .any(|chunk| chunk.start_address < end && start < chunk.end_address())
        {
            return Err(MemoryError::AlreadyMapped);
        }

        self.carve_free_ranges(start, end, pmm)?;
        if end > self.next_available_address {
            if start > self.next_available_address {
                let gap = self.next_available_address;
                self.release_range(gap, (start - gap) as usize, pmm)?;
            }
            self.next_available_address = end;
        }

        if let Err(err) = self.commit(start, size, flags, pmm) {
            self.release_range(start, size, pmm)?;
            return Err(err);
        }
        Ok(address)
    }

    /// Releases the range containing `address`: its pages are unmapped, its
    /// frames freed unless they are borrowed, and the range joins the free list.
    pub fn free(
        &mut self,
        address: VirtAddr,
        pmm: &mut PhysicalMemoryManager,
    ) -> Result<(), MemoryError> {
        let address = address.as_u64();
        let chunk = self
            .chunks
            .remove(|chunk| chunk.contains(address))
            .ok_or(MemoryError::InvalidFree)?;

        self.unback_range(chunk.start_address, chunk.size, chunk.owns_frames(), pmm);
        self.memory_used -= chunk.size;
        self.release_range(chunk.start_address, chunk.size, pmm)
    }

    /// Maps existing physical memory into this address space without taking
    /// ownership of the frames.
    pub fn load_physical_into_address_space(
        &mut self,
        physical: PhysAddr,
        size: usize,
        flags: PageFlags,
        pmm: &mut PhysicalMemoryManager,
    ) -> Result<VirtAddr, MemoryError> {
        if !check_aligned(physical.as_u64()) {
            return Err(MemoryError::AlignmentViolation);
        }

        let address = self.allocate(size, flags | RESERVE, pmm)?;
        let length = checked_align_to_page(size).ok_or(MemoryError::OutOfVirtualSpace)?;
        let result = pmm.map_area(
            self.pml4_root,
            physical,
            address,
            length,
            self.page_flags(flags),
        );

        if let Err(err) = result {
            self.free(address, pmm)?;
            return Err(err);
        }
        Ok(address)
    }

    /// Maps a shared-memory block read/write.
    pub fn load_shared_memory(
        &mut self,
        physical: PhysAddr,
        size: usize,
        pmm: &mut PhysicalMemoryManager,
    ) -> Result<VirtAddr, MemoryError> {
        self.load_physical_into_address_space(
            physical,
            size,
            PageFlags::PRESENT | PageFlags::WRITABLE | SHARED,
            pmm,
        )
    }

    /// Tears the address space down, returning every owned frame, the
    /// bookkeeping pages and, for user spaces, the page tables.
    pub fn destroy(mut self, pmm: &mut PhysicalMemoryManager) -> Result<(), MemoryError> {
        while let Some(chunk) = self.chunks.remove(|_| true) {
            self.unback_range(chunk.start_address, chunk.size, chunk.owns_frames(), pmm);
        }

        self.chunks.release(pmm)?;
        self.free_chunks.release(pmm)?;
        if !self.is_kernel {
            pmm.free_user_tables(self.pml4_root)?;
        }

        log::debug!("Destroyed address space at {:?}", self.pml4_root);
        Ok(())
    }

    /// Records a range and backs it with frames unless it is a reservation.
    fn commit(
        &mut self,
        start: u64,
        size: usize,
        flags: PageFlags,
        pmm: &mut PhysicalMemoryManager,
    ) -> Result<(), MemoryError> {
        let reserve_only = flags.contains(RESERVE);
        if !reserve_only {
            self.back_range(start, size, flags, pmm)?;
        }

        let chunk = VirtualMemoryChunk {
            start_address: start,
            size,
            flags,
        };
        if let Err(err) = self.chunks.insert(chunk, pmm) {
            if !reserve_only {
                self.unback_range(start, size, true, pmm);
            }
            return Err(err);
        }

        self.memory_used += size;
        Ok(())
    }

    /// Maps a zeroed frame behind every page of the range.
    fn back_range(
        &mut self,
        start: u64,
        size: usize,
        flags: PageFlags,
        pmm: &mut PhysicalMemoryManager,
    ) -> Result<(), MemoryError> {
        let flags = self.page_flags(flags);
        for page in 0..size / FRAME_SIZE {
            let address = VirtAddr::new(start + (page * FRAME_SIZE) as u64);
            match pmm.map_anonymous_in(self.pml4_root, address, flags) {
                Ok(frame) => {
                    // SAFETY: the frame was just allocated for this page.
                    unsafe {
                        pmm.phys_to_virt(frame)
                            .as_mut_ptr::<u8>()
                            .write_bytes(0, FRAME_SIZE);
                    }
                }
                Err(err) => {
                    self.unback_range(start, page * FRAME_SIZE, true, pmm);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Unmaps every page of the range, freeing the frames when `owned`.
    fn unback_range(
        &mut self,
        start: u64,
        size: usize,
        owned: bool,
        pmm: &mut PhysicalMemoryManager,
    ) {
        for page in 0..size / FRAME_SIZE {
            let address = VirtAddr::new(start + (page * FRAME_SIZE) as u64);
            match pmm.unmap_in(self.pml4_root, address) {
                Ok(frame) if owned => {
                    if let Err(err) = pmm.free_frame(frame) {
                        log::warn!("Failed to free frame {:?} behind {:?}: {}", frame, address, err);
                    }
                }
                Ok(_) | Err(_) => {}
            }
        }
    }

    /// First-fit take from the free list, leaving any remainder in place.
    fn take_free_range(&mut self, size: usize) -> Option<u64> {
        let chunk = self.free_chunks.find_mut(|chunk| chunk.size >= size)?;
        let start = chunk.start_address;
        if chunk.size == size {
            *chunk = FreeChunk::VACANT;
        } else {
            chunk.start_address += size as u64;
            chunk.size -= size;
        }
        Some(start)
    }

    /// Puts a range on the free list, merging it with free neighbours.
    fn release_range(
        &mut self,
        start: u64,
        size: usize,
        pmm: &mut PhysicalMemoryManager,
    ) -> Result<(), MemoryError> {
        let end = start + size as u64;
        let mut merged = FreeChunk {
            start_address: start,
            size,
        };

        if let Some(left) = self.free_chunks.remove(|chunk| chunk.end_address() == start) {
            merged.start_address = left.start_address;
            merged.size += left.size;
        }
        if let Some(right) = self.free_chunks.remove(|chunk| chunk.start_address == end) {
            merged.size += right.size;
        }

        self.free_chunks.insert(merged, pmm)
    }

    /// Removes [start, end) from every free range overlapping it.
    fn carve_free_ranges(
        &mut self,
        start: u64,
        end: u64,
        pmm: &mut PhysicalMemoryManager,
    ) -> Result<(), MemoryError> {
        let mut right_remainder = None;
        for chunk in self.free_chunks.iter_mut() {
            let chunk_end = chunk.end_address();
            if chunk.start_address >= end || chunk_end <= start {
                continue;
            }

            if chunk.start_address < start {
                chunk.size = (start - chunk.start_address) as usize;
                if chunk_end > end {
                    right_remainder = Some(FreeChunk {
                        start_address: end,
                        size: (chunk_end - end) as usize,
                    });
                }
            } else if chunk_end > end {
                chunk.start_address = end;
                chunk.size = (chunk_end - end) as usize;
            } else {
                *chunk = FreeChunk::VACANT;
            }
        }

        match right_remainder {
            Some(remainder) => self.free_chunks.insert(remainder, pmm),
            None => Ok(()),
        }
    }
}

impl HeapSource for VirtualMemoryManager {
    fn grow(&mut self, size: usize) -> Result<VirtAddr, MemoryError> {
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::NO_EXECUTE;
        with_physical_memory_manager(|pmm| self.allocate(size, flags, pmm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimulatedMemory;
    use alloc::vec::Vec;

    const RW: PageFlags = PageFlags::PRESENT.union(PageFlags::WRITABLE);

    #[test]
    fn test_record_pages_fit_a_frame() {
        assert_eq!(CHUNKS_PER_PAGE, 169);
        assert!(size_of::<VirtualMemoryRegion>() <= FRAME_SIZE);
    }

    #[test]
    fn test_kernel_window_starts_past_direct_map() {
        let memory = SimulatedMemory::new(64);
        let mut pmm = memory.pmm();
        let vmm = VirtualMemoryManager::new_kernel(&mut pmm).unwrap();

        assert!(vmm.is_kernel());
        assert_eq!(vmm.pml4_root(), pmm.pml4_root());
        assert!(vmm.first_address() > HIGHER_HALF_DIRECT_MAP + pmm.memory_size() + VMM_RESERVED);
        assert!(check_aligned(vmm.first_address()));
        assert_eq!(vmm.next_available_address(), vmm.first_address());
    }

    #[test]
    fn test_watermark_allocations_never_overlap() {
        let memory = SimulatedMemory::new(128);
        let mut pmm = memory.pmm();
        let mut vmm = VirtualMemoryManager::new_user(&mut pmm).unwrap();

        let mut ranges = Vec::new();
        let mut watermark = vmm.next_available_address();
        for size in [1, FRAME_SIZE, 3 * FRAME_SIZE + 5, 2 * FRAME_SIZE] {
            let address = vmm.allocate(size, RW, &mut pmm).unwrap();
            assert!(vmm.next_available_address() >= watermark);
            watermark = vmm.next_available_address();
            ranges.push((address.as_u64(), checked_align_to_page(size).unwrap() as u64));
        }

        for (i, &(a, a_len)) in ranges.iter().enumerate() {
            for &(b, b_len) in &ranges[i + 1..] {
                assert!(a + a_len <= b || b + b_len <= a);
            }
        }
        assert_eq!(ranges[0].0, USER_SPACE_START);
        assert_eq!(vmm.memory_used(), 8 * FRAME_SIZE);
        assert_eq!(vmm.chunks().count(), 4);
    }

    #[test]
    fn test_allocation_is_backed_zeroed_and_user_accessible() {
        let memory = SimulatedMemory::new(128);
        let mut pmm = memory.pmm();
        let mut vmm = VirtualMemoryManager::new_user(&mut pmm).unwrap();

        let address = vmm.allocate(2 * FRAME_SIZE, RW, &mut pmm).unwrap();
        for page in 0..2u64 {
            let page_address = address + page * PAGE_SIZE;
            let frame = pmm.translate_in(vmm.pml4_root(), page_address).unwrap();
            let entry = pmm.entry(page_address, vmm.pml4_root()).unwrap();
            assert!(entry.flags().contains(RW | PageFlags::USER_ACCESSIBLE));

            let bytes = pmm.phys_to_virt(frame).as_ptr::<u8>();
            assert!((0..FRAME_SIZE).all(|i| unsafe { *bytes.add(i) } == 0));
        }
    }

    #[test]
    fn test_free_list_is_reused_and_split() {
        let memory = SimulatedMemory::new(128);
        let mut pmm = memory.pmm();
        let mut vmm = VirtualMemoryManager::new_user(&mut pmm).unwrap();

        let big = vmm.allocate(4 * FRAME_SIZE, RW, &mut pmm).unwrap();
        let _guard = vmm.allocate(FRAME_SIZE, RW, &mut pmm).unwrap();
        let watermark = vmm.next_available_address();
        let free = pmm.free_frames();

        vmm.free(big, &mut pmm).unwrap();
        assert_eq!(pmm.free_frames(), free + 4);
        assert_eq!(pmm.translate_in(vmm.pml4_root(), big), None);

        let small = vmm.allocate(FRAME_SIZE, RW, &mut pmm).unwrap();
        assert_eq!(small, big);
        let remainder: Vec<FreeChunk> = vmm.free_ranges().copied().collect();
        assert_eq!(
            remainder,
            [FreeChunk {
                start_address: big.as_u64() + PAGE_SIZE,
                size: 3 * FRAME_SIZE,
            }]
        );
        assert_eq!(vmm.next_available_address(), watermark);
    }

    #[test]
    fn test_adjacent_frees_coalesce() {
        let memory = SimulatedMemory::new(128);
        let mut pmm = memory.pmm();
        let mut vmm = VirtualMemoryManager::new_user(&mut pmm).unwrap();

        let a = vmm.allocate(FRAME_SIZE, RW, &mut pmm).unwrap();
        let b = vmm.allocate(FRAME_SIZE, RW, &mut pmm).unwrap();
        let c = vmm.allocate(FRAME_SIZE, RW, &mut pmm).unwrap();
        vmm.allocate(FRAME_SIZE, RW, &mut pmm).unwrap();

        vmm.free(a, &mut pmm).unwrap();
        vmm.free(c, &mut pmm).unwrap();
        vmm.free(b, &mut pmm).unwrap();

        let free: Vec<FreeChunk> = vmm.free_ranges().copied().collect();
        assert_eq!(
            free,
            [FreeChunk {
                start_address: a.as_u64(),
                size: 3 * FRAME_SIZE,
            }]
        );
        assert_eq!(vmm.allocate(3 * FRAME_SIZE, RW, &mut pmm), Ok(a));
    }

    #[test]
    fn test_invalid_and_double_free() {
        let memory = SimulatedMemory::new(64);
        let mut pmm = memory.pmm();
        let mut vmm = VirtualMemoryManager::new_user(&mut pmm).unwrap();

        let address = vmm.allocate(FRAME_SIZE, RW, &mut pmm).unwrap();
        assert_eq!(
            vmm.free(address + 0x10_0000u64, &mut pmm),
            Err(MemoryError::InvalidFree)
        );
        vmm.free(address + 8u64, &mut pmm).unwrap();
        assert_eq!(vmm.free(address, &mut pmm), Err(MemoryError::InvalidFree));
        assert_eq!(vmm.memory_used(), 0);
    }

    #[test]
    fn test_zero_size_and_window_exhaustion() {
        let memory = SimulatedMemory::new(64);
        let mut pmm = memory.pmm();
        let mut vmm = VirtualMemoryManager::new_user(&mut pmm).unwrap();

        assert_eq!(vmm.allocate(0, RW, &mut pmm), Err(MemoryError::ZeroSize));
        assert_eq!(
            vmm.allocate(usize::MAX, RW, &mut pmm),
            Err(MemoryError::OutOfVirtualSpace)
        );
        assert_eq!(
            vmm.allocate(USER_SPACE_END as usize, RESERVE, &mut pmm),
            Err(MemoryError::OutOfVirtualSpace)
        );
    }

    #[test]
    fn test_out_of_frames_rolls_back() {
        let memory = SimulatedMemory::new(24);
        let mut pmm = memory.pmm();
        let mut vmm = VirtualMemoryManager::new_user(&mut pmm).unwrap();

        let free = pmm.free_frames();
        assert_eq!(
            vmm.allocate(64 * FRAME_SIZE, RW, &mut pmm),
            Err(MemoryError::OutOfMemory)
        );
        assert_eq!(vmm.memory_used(), 0);
        assert_eq!(vmm.chunks().count(), 0);

        // Only the page tables created on the way stay allocated.
        assert_eq!(pmm.free_frames(), free - 3);
        let address = vmm.allocate(FRAME_SIZE, RW, &mut pmm).unwrap();
        assert_eq!(address.as_u64(), USER_SPACE_START);
    }

    #[test]
    fn test_reservation_is_not_backed() {
        let memory = SimulatedMemory::new(64);
        let mut pmm = memory.pmm();
        let mut vmm = VirtualMemoryManager::new_user(&mut pmm).unwrap();

        let free = pmm.free_frames();
        let address = vmm.allocate(16 * FRAME_SIZE, RW | RESERVE, &mut pmm).unwrap();
        assert_eq!(pmm.free_frames(), free);
        assert_eq!(pmm.translate_in(vmm.pml4_root(), address), None);
        assert_eq!(vmm.memory_used(), 16 * FRAME_SIZE);

        vmm.free(address, &mut pmm).unwrap();
        assert_eq!(pmm.free_frames(), free);
    }

    #[test]
    fn test_fixed_address_allocation() {
        let memory = SimulatedMemory::new(128);
        let mut pmm = memory.pmm();
        let mut vmm = VirtualMemoryManager::new_user(&mut pmm).unwrap();

        let fixed = VirtAddr::new(0x40_0000);
        assert_eq!(vmm.allocate_at(fixed, 2 * FRAME_SIZE, RW, &mut pmm), Ok(fixed));
        assert!(pmm.translate_in(vmm.pml4_root(), fixed + PAGE_SIZE).is_some());
        assert_eq!(vmm.next_available_address(), 0x40_2000);

        // The skipped space below the fixed range is reusable.
        let free: Vec<FreeChunk> = vmm.free_ranges().copied().collect();
        assert_eq!(
            free,
            [FreeChunk {
                start_address: USER_SPACE_START,
                size: (0x40_0000 - USER_SPACE_START) as usize,
            }]
        );

        assert_eq!(
            vmm.allocate_at(fixed + PAGE_SIZE, FRAME_SIZE, RW, &mut pmm),
            Err(MemoryError::AlreadyMapped)
        );
        assert_eq!(
            vmm.allocate_at(VirtAddr::new(0x3F_F000), 2 * FRAME_SIZE, RW, &mut pmm),
            Err(MemoryError::AlreadyMapped)
        );
        assert_eq!(
            vmm.allocate_at(VirtAddr::new(0x1234), FRAME_SIZE, RW, &mut pmm),
            Err(MemoryError::AlignmentViolation)
        );
        assert_eq!(
            vmm.allocate_at(VirtAddr::zero(), FRAME_SIZE, RW, &mut pmm),
            Err(MemoryError::InvalidAddress)
        );
    }

    #[test]
    fn test_fixed_allocation_carves_free_list() {
        let memory = SimulatedMemory::new(128);
        let mut pmm = memory.pmm();
        let mut vmm = VirtualMemoryManager::new_user(&mut pmm).unwrap();

        let range = vmm.allocate(8 * FRAME_SIZE, RW, &mut pmm).unwrap();
        vmm.allocate(FRAME_SIZE, RW, &mut pmm).unwrap();
        vmm.free(range, &mut pmm).unwrap();

        let fixed = range + 2 * PAGE_SIZE;
        vmm.allocate_at(fixed, 2 * FRAME_SIZE, RW, &mut pmm).unwrap();

        let mut free: Vec<FreeChunk> = vmm.free_ranges().copied().collect();
        free.sort_by_key(|chunk| chunk.start_address);
        assert_eq!(
            free,
            [
                FreeChunk {
                    start_address: range.as_u64(),
                    size: 2 * FRAME_SIZE,
                },
                FreeChunk {
                    start_address: range.as_u64() + 4 * PAGE_SIZE,
                    size: 4 * FRAME_SIZE,
                },
            ]
        );
    }

    #[test]
    fn test_load_physical_borrows_frames() {
        let memory = SimulatedMemory::new(128);
        let mut pmm = memory.pmm();
        let mut first = VirtualMemoryManager::new_user(&mut pmm).unwrap();
        let mut second = VirtualMemoryManager::new_user(&mut pmm).unwrap();

        let block = pmm.allocate_area(PhysAddr::zero(), 2 * FRAME_SIZE).unwrap();
        let a = first.load_shared_memory(block, 2 * FRAME_SIZE, &mut pmm).unwrap();
        let b = second.load_shared_memory(block, 2 * FRAME_SIZE, &mut pmm).unwrap();

        assert_eq!(pmm.translate_in(first.pml4_root(), a + PAGE_SIZE), Some(block + PAGE_SIZE));
        assert_eq!(pmm.translate_in(second.pml4_root(), b), Some(block));

        first.free(a, &mut pmm).unwrap();
        assert!(pmm.is_frame_used(block));
        assert!(pmm.is_frame_used(block + PAGE_SIZE));
        assert_eq!(pmm.translate_in(second.pml4_root(), b), Some(block));

        assert_eq!(
            first.load_physical_into_address_space(block + 8u64, FRAME_SIZE, RW, &mut pmm),
            Err(MemoryError::AlignmentViolation)
        );
    }

    #[test]
    fn test_user_space_shares_kernel_half() {
        let memory = SimulatedMemory::new(128);
        let mut pmm = memory.pmm();

        let kernel_page = VirtAddr::new(0xFFFF_9000_0000_0000);
        let frame = pmm.allocate_frame().unwrap();
        pmm.map(frame, kernel_page, RW).unwrap();

        let vmm = VirtualMemoryManager::new_user(&mut pmm).unwrap();
        assert_ne!(vmm.pml4_root(), pmm.pml4_root());
        assert_eq!(pmm.translate_in(vmm.pml4_root(), kernel_page), Some(frame));
    }

    #[test]
    fn test_destroy_returns_every_frame() {
        let memory = SimulatedMemory::new(128);
        let mut pmm = memory.pmm();
        let free = pmm.free_frames();

        let mut vmm = VirtualMemoryManager::new_user(&mut pmm).unwrap();
        let shared = pmm.allocate_frame().unwrap();
        vmm.allocate(3 * FRAME_SIZE, RW, &mut pmm).unwrap();
        vmm.allocate_at(VirtAddr::new(0x1000_0000), FRAME_SIZE, RW, &mut pmm)
            .unwrap();
        vmm.load_shared_memory(shared, FRAME_SIZE, &mut pmm).unwrap();
        let freed = vmm.allocate(FRAME_SIZE, RW, &mut pmm).unwrap();
        vmm.free(freed, &mut pmm).unwrap();

        vmm.destroy(&mut pmm).unwrap();
        assert!(pmm.is_frame_used(shared));
        pmm.free_frame(shared).unwrap();
        assert_eq!(pmm.free_frames(), free);
    }

    #[test]
    fn test_chunk_records_spill_into_new_pages() {
        let memory = SimulatedMemory::new(64);
        let mut pmm = memory.pmm();
        let mut vmm = VirtualMemoryManager::new_user(&mut pmm).unwrap();

        for _ in 0..CHUNKS_PER_PAGE + 1 {
            vmm.allocate(FRAME_SIZE, RESERVE, &mut pmm).unwrap();
        }
        assert_eq!(vmm.chunks().count(), CHUNKS_PER_PAGE + 1);
        assert_eq!(vmm.chunks.pages(), 2);
    }

    #[test]
    fn test_heap_growth_draws_on_global_frames() {
        let _lock = crate::testing::lock_global_state();
        let memory = SimulatedMemory::new(64);
        *crate::memory::PHYSICAL_MEMORY_MANAGER.lock() = Some(memory.pmm());

        let mut vmm = with_physical_memory_manager(VirtualMemoryManager::new_user).unwrap();
        let start = vmm.grow(2 * FRAME_SIZE).unwrap();
        assert_eq!(vmm.memory_used(), 2 * FRAME_SIZE);

        let root = vmm.pml4_root();
        let entry = with_physical_memory_manager(|pmm| pmm.entry(start, root)).unwrap();
        assert!(entry.flags().contains(PageFlags::WRITABLE | PageFlags::USER_ACCESSIBLE));

        with_physical_memory_manager(|pmm| vmm.destroy(pmm)).unwrap();
        *crate::memory::PHYSICAL_MEMORY_MANAGER.lock() = None;
    }
}
