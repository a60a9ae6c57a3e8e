//! Physical memory manager.
//!
//! Owns the frame bitmap and the kernel's PML4, and performs every page table
//! walk in the system. Tables are reached through a direct map of physical
//! memory, so the walk never depends on the address space being active.

use x86_64::{
    structures::paging::{
        page_table::PageTableEntry, FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB,
    },
    PhysAddr, VirtAddr,
};

use crate::{
    constants::memory::{
        FRAME_SIZE, HIGHER_HALF_DIRECT_MAP, KERNEL_PML4_START, PAGE_SIZE, PAGE_TABLE_ENTRIES,
    },
    memory::{
        address::{check_aligned, size_to_frames},
        bitmap_frame_allocator::FrameBitmap,
        boot_memory_map::BootMemoryMap,
        error::MemoryError,
        paging::{self, PageFlags},
        tlb,
    },
};

const SIZE_1GIB: u64 = 0x4000_0000;
const SIZE_2MIB: u64 = 0x20_0000;

pub struct PhysicalMemoryManager {
    frames: FrameBitmap,
    memory_size: u64,
    direct_map: VirtAddr,
    pml4_root: PhysAddr,
    nx_enabled: bool,
}

impl PhysicalMemoryManager {
    /// Builds the frame bitmap from the boot memory map and takes ownership of
    /// `pml4_root`, or allocates a fresh PML4 when none is given.
    ///
    /// # Safety
    /// `direct_map` must map all physical memory described by `memory_map`,
    /// and every usable region must really be free.
    pub unsafe fn new(
        memory_map: &BootMemoryMap,
        direct_map: VirtAddr,
        pml4_root: Option<PhysAddr>,
    ) -> Result<Self, MemoryError> {
        let memory_size = memory_map.top_of_usable();
        let total_frames = (memory_size as usize).div_ceil(FRAME_SIZE);
        if total_frames == 0 {
            return Err(MemoryError::OutOfMemory);
        }

        let entries = FrameBitmap::entries_for(total_frames);
        let bitmap_bytes = (entries * core::mem::size_of::<u64>()) as u64;

        // The bitmap goes in the first usable region that fits it, skipping frame 0.
        let bitmap_address = memory_map
            .usable_regions()
            .map(|region| {
                let base = region.base.max(PAGE_SIZE).next_multiple_of(PAGE_SIZE);
                (base, region.end())
            })
            .find(|&(base, end)| base + bitmap_bytes <= end)
            .map(|(base, _)| base)
            .ok_or(MemoryError::OutOfMemory)?;

        let words = core::slice::from_raw_parts_mut(
            (direct_map + bitmap_address).as_mut_ptr::<u64>(),
            entries,
        );
        let mut frames = FrameBitmap::new(words, total_frames);
        for region in memory_map.usable_regions() {
            frames.free_region(region.base, region.length);
        }
        frames.reserve_region(0, PAGE_SIZE);
        frames.reserve_region(bitmap_address, bitmap_bytes);

        let mut pmm = Self {
            frames,
            memory_size,
            direct_map,
            pml4_root: PhysAddr::zero(),
            nx_enabled: false,
        };

        pmm.pml4_root = match pml4_root {
            Some(root) => root,
            None => {
                let root = pmm.allocate_frame()?;
                pmm.clean_page_table(root);
                root
            }
        };

        log::info!(
            "Physical memory: {} KiB, {} of {} frames free, bitmap at {:#x}",
            memory_size / 1024,
            pmm.frames.free_frames(),
            total_frames,
            bitmap_address
        );

        Ok(pmm)
    }

    /// Top of usable physical memory in bytes.
    pub fn memory_size(&self) -> u64 {
        self.memory_size
    }

    pub fn memory_used(&self) -> u64 {
        (self.frames.used_frames() * FRAME_SIZE) as u64
    }

    pub fn total_frames(&self) -> usize {
        self.frames.total_frames()
    }

    pub fn free_frames(&self) -> usize {
        self.frames.free_frames()
    }

    pub fn is_frame_used(&self, frame: PhysAddr) -> bool {
        self.frames.is_frame_used(frame.as_u64() as usize / FRAME_SIZE)
    }

    pub fn pml4_root(&self) -> PhysAddr {
        self.pml4_root
    }

    pub fn direct_map_offset(&self) -> VirtAddr {
        self.direct_map
    }

    /// Where `physical` can be read and written by the kernel.
    pub fn phys_to_virt(&self, physical: PhysAddr) -> VirtAddr {
        self.direct_map + physical.as_u64()
    }

    pub fn set_nx_enabled(&mut self, enabled: bool) {
        self.nx_enabled = enabled;
    }

    /// Claims the lowest free frame.
    pub fn allocate_frame(&mut self) -> Result<PhysAddr, MemoryError> {
        let frame_index = self.frames.allocate().ok_or(MemoryError::OutOfMemory)?;
        Ok(PhysAddr::new((frame_index * FRAME_SIZE) as u64))
    }

    pub fn free_frame(&mut self, address: PhysAddr) -> Result<(), MemoryError> {
        if !check_aligned(address.as_u64()) {
            return Err(MemoryError::AlignmentViolation);
        }
        self.frames.release(address.as_u64() as usize / FRAME_SIZE)
    }

    /// Claims enough consecutive frames for `size` bytes, at or above `start`.
    pub fn allocate_area(&mut self, start: PhysAddr, size: usize) -> Result<PhysAddr, MemoryError> {
        if size == 0 {
            return Err(MemoryError::ZeroSize);
        }

        let from = start.as_u64() as usize / FRAME_SIZE;
        let frame_index = self
            .frames
            .allocate_contiguous(size_to_frames(size), from)
            .ok_or(MemoryError::OutOfMemory)?;
        Ok(PhysAddr::new((frame_index * FRAME_SIZE) as u64))
    }

    /// Frees every frame of an area. Frames that fail to free are skipped and
    /// the first error is reported once the rest are released.
    pub fn free_area(&mut self, start: PhysAddr, size: usize) -> Result<(), MemoryError> {
        if !check_aligned(start.as_u64()) {
            return Err(MemoryError::AlignmentViolation);
        }

        let mut result = Ok(());
        for frame in 0..size_to_frames(size) {
            let address = start + (frame * FRAME_SIZE) as u64;
            if let Err(err) = self.free_frame(address) {
                result = result.and(Err(err));
            }
        }
        result
    }

    /// Marks a physical range as in use so it is never handed out.
    pub fn reserve(&mut self, address: PhysAddr, size: usize) {
        self.frames.reserve_region(address.as_u64(), size as u64);
    }

    /// Zeroes a page table frame.
    pub fn clean_page_table(&mut self, table: PhysAddr) {
        // SAFETY: every frame handed to the walk comes from this allocator and
        // is covered by the direct map.
        unsafe { paging::clear_table(self.direct_map, table) }
    }

    /// Returns the next-level table behind `index` in `table`, creating and
    /// zeroing it when the entry is not present.
    fn next_table_or_create(
        &mut self,
        table: PhysAddr,
        index: usize,
        leaf: PageFlags,
    ) -> Result<PhysAddr, MemoryError> {
        // SAFETY: `table` is a live page table of this hierarchy.
        let entry = unsafe { &mut paging::table_at(self.direct_map, table)[index] };
        let flags = entry.flags();

        if flags.contains(PageFlags::PRESENT) {
            if flags.contains(PageFlags::HUGE_PAGE) {
                return Err(MemoryError::HugePageConflict);
            }
            if leaf.contains(PageFlags::USER_ACCESSIBLE)
                && !flags.contains(PageFlags::USER_ACCESSIBLE)
            {
                entry.set_flags(flags | PageFlags::USER_ACCESSIBLE);
            }
            return Ok(entry.addr());
        }

        let next = self.allocate_frame()?;
        self.clean_page_table(next);

        // SAFETY: as above; the previous borrow ended before the allocation.
        let entry = unsafe { &mut paging::table_at(self.direct_map, table)[index] };
        entry.set_addr(next, paging::table_flags(leaf));
        Ok(next)
    }

    /// Follows an existing entry to the next-level table.
    fn next_table(&self, table: PhysAddr, index: usize) -> Result<PhysAddr, MemoryError> {
        // SAFETY: `table` is a live page table of this hierarchy.
        let entry = unsafe { &paging::table_at(self.direct_map, table)[index] };
        let flags = entry.flags();
        if !flags.contains(PageFlags::PRESENT) {
            return Err(MemoryError::NotMapped);
        }
        if flags.contains(PageFlags::HUGE_PAGE) {
            return Err(MemoryError::HugePageConflict);
        }
        Ok(entry.addr())
    }

    /// The leaf entry for `virtual_address`, if all of its tables exist.
    fn leaf_entry_mut(
        &mut self,
        virtual_address: VirtAddr,
        root: PhysAddr,
    ) -> Result<&mut PageTableEntry, MemoryError> {
        let [p4, p3, p2, p1] = paging::table_indices(virtual_address);
        let pdpt = self.next_table(root, p4)?;
        let pd = self.next_table(pdpt, p3)?;
        let pt = self.next_table(pd, p2)?;

        // SAFETY: `pt` is a live page table and the borrow is tied to `self`.
        Ok(unsafe { &mut paging::table_at(self.direct_map, pt)[p1] })
    }

    /// Maps `virtual_address` to `physical` in the hierarchy rooted at `root`,
    /// creating missing tables on the way down.
    ///
    /// Remapping a page to the frame it already maps only updates its flags.
    pub fn map_in(
        &mut self,
        root: PhysAddr,
        physical: PhysAddr,
        virtual_address: VirtAddr,
        flags: PageFlags,
    ) -> Result<VirtAddr, MemoryError> {
        if !check_aligned(physical.as_u64()) || !check_aligned(virtual_address.as_u64()) {
            return Err(MemoryError::AlignmentViolation);
        }

        let flags = paging::leaf_flags(flags, self.nx_enabled);
        let [p4, p3, p2, p1] = paging::table_indices(virtual_address);
        let pdpt = self.next_table_or_create(root, p4, flags)?;
        let pd = self.next_table_or_create(pdpt, p3, flags)?;
        let pt = self.next_table_or_create(pd, p2, flags)?;

        // SAFETY: `pt` was just resolved in this hierarchy.
        let entry = unsafe { &mut paging::table_at(self.direct_map, pt)[p1] };
        if entry.flags().contains(PageFlags::PRESENT) {
            if entry.addr() != physical {
                return Err(MemoryError::AlreadyMapped);
            }
            entry.set_flags(flags);
            tlb::flush_page(virtual_address);
            return Ok(virtual_address);
        }

        entry.set_addr(physical, flags);
        Ok(virtual_address)
    }

    /// Maps a page in the kernel address space.
    pub fn map(
        &mut self,
        physical: PhysAddr,
        virtual_address: VirtAddr,
        flags: PageFlags,
    ) -> Result<VirtAddr, MemoryError> {
        self.map_in(self.pml4_root, physical, virtual_address, flags)
    }

    /// Backs `virtual_address` with a fresh frame.
    pub fn map_anonymous_in(
        &mut self,
        root: PhysAddr,
        virtual_address: VirtAddr,
        flags: PageFlags,
    ) -> Result<PhysAddr, MemoryError> {
        let frame = self.allocate_frame()?;
        if let Err(err) = self.map_in(root, frame, virtual_address, flags) {
            self.free_frame(frame)?;
            return Err(err);
        }
        Ok(frame)
    }

    /// Maps `physical` at the same virtual address.
    pub fn identity_map(
        &mut self,
        physical: PhysAddr,
        flags: PageFlags,
    ) -> Result<VirtAddr, MemoryError> {
        self.map(physical, VirtAddr::new(physical.as_u64()), flags)
    }

    /// Maps `length` bytes of contiguous physical memory, page by page.
    pub fn map_area(
        &mut self,
        root: PhysAddr,
        physical: PhysAddr,
        virtual_address: VirtAddr,
        length: usize,
        flags: PageFlags,
    ) -> Result<VirtAddr, MemoryError> {
        for page in 0..size_to_frames(length) {
            let offset = (page * FRAME_SIZE) as u64;
            self.map_in(root, physical + offset, virtual_address + offset, flags)?;
        }
        Ok(virtual_address)
    }

    /// Unmaps `virtual_address`, returning the frame it pointed at.
    /// Tables are never freed here.
    pub fn unmap_in(
        &mut self,
        root: PhysAddr,
        virtual_address: VirtAddr,
    ) -> Result<PhysAddr, MemoryError> {
        let entry = self.leaf_entry_mut(virtual_address, root)?;
        let flags = entry.flags();
        if !flags.contains(PageFlags::PRESENT) {
            return Err(MemoryError::NotMapped);
        }

        let physical = entry.addr();
        entry.set_flags(flags.difference(PageFlags::PRESENT));
        tlb::flush_page(virtual_address);
        Ok(physical)
    }

    /// Unmaps a page in the kernel address space.
    pub fn unmap(&mut self, virtual_address: VirtAddr) -> Result<PhysAddr, MemoryError> {
        self.unmap_in(self.pml4_root, virtual_address)
    }

    /// Unmaps every page of a range; pages that were never mapped are skipped.
    pub fn unmap_area(&mut self, root: PhysAddr, virtual_address: VirtAddr, length: usize) {
        for page in 0..size_to_frames(length) {
            let address = virtual_address + (page * FRAME_SIZE) as u64;
            if let Err(err) = self.unmap_in(root, address) {
                log::trace!("Skipping unmap of {:?}: {}", address, err);
            }
        }
    }

    /// Resolves `virtual_address` through the hierarchy at `root`,
    /// honouring 1 GiB and 2 MiB leaves.
    pub fn translate_in(&self, root: PhysAddr, virtual_address: VirtAddr) -> Option<PhysAddr> {
        let [p4, p3, p2, p1] = paging::table_indices(virtual_address);
        let address = virtual_address.as_u64();

        let pdpt = self.next_table(root, p4).ok()?;

        // SAFETY: tables reached by the walk are live page tables.
        let pdpt_entry = unsafe { &paging::table_at(self.direct_map, pdpt)[p3] };
        if !pdpt_entry.flags().contains(PageFlags::PRESENT) {
            return None;
        }
        if pdpt_entry.flags().contains(PageFlags::HUGE_PAGE) {
            return Some(pdpt_entry.addr() + (address & (SIZE_1GIB - 1)));
        }

        let pd_entry = unsafe { &paging::table_at(self.direct_map, pdpt_entry.addr())[p2] };
        if !pd_entry.flags().contains(PageFlags::PRESENT) {
            return None;
        }
        if pd_entry.flags().contains(PageFlags::HUGE_PAGE) {
            return Some(pd_entry.addr() + (address & (SIZE_2MIB - 1)));
        }

        let entry = unsafe { &paging::table_at(self.direct_map, pd_entry.addr())[p1] };
        if !entry.flags().contains(PageFlags::PRESENT) {
            return None;
        }
        Some(entry.addr() + (address & (PAGE_SIZE - 1)))
    }

    /// Resolves `virtual_address` in the kernel address space.
    pub fn translate(&self, virtual_address: VirtAddr) -> Option<PhysAddr> {
        self.translate_in(self.pml4_root, virtual_address)
    }

    /// Resolves `virtual_address` in the hierarchy at `root`.
    pub fn get_physical_address(
        &self,
        virtual_address: VirtAddr,
        root: PhysAddr,
    ) -> Option<PhysAddr> {
        self.translate_in(root, virtual_address)
    }

    /// Whether `virtual_address` currently maps to `physical`.
    pub fn is_mapped(&self, physical: PhysAddr, virtual_address: VirtAddr, root: PhysAddr) -> bool {
        self.translate_in(root, virtual_address) == Some(physical)
    }

    /// Copy of the 4 KiB leaf entry, present or not, if its tables exist.
    pub fn entry(&self, virtual_address: VirtAddr, root: PhysAddr) -> Option<PageTableEntry> {
        let [p4, p3, p2, p1] = paging::table_indices(virtual_address);
        let pdpt = self.next_table(root, p4).ok()?;
        let pd = self.next_table(pdpt, p3).ok()?;
        let pt = self.next_table(pd, p2).ok()?;

        // SAFETY: `pt` is a live page table.
        Some(unsafe { paging::table_at(self.direct_map, pt)[p1].clone() })
    }

    /// Rewrites the flags of an existing mapping, keeping its frame.
    pub fn change_page_flags(
        &mut self,
        virtual_address: VirtAddr,
        flags: PageFlags,
        root: PhysAddr,
    ) -> Result<(), MemoryError> {
        let flags = paging::leaf_flags(flags, self.nx_enabled);
        if flags.contains(PageFlags::USER_ACCESSIBLE) {
            // Intermediate entries must allow user access as well.
            let [p4, p3, p2, _] = paging::table_indices(virtual_address);
            let pdpt = self.next_table_or_create(root, p4, flags)?;
            let pd = self.next_table_or_create(pdpt, p3, flags)?;
            self.next_table_or_create(pd, p2, flags)?;
        }

        let entry = self.leaf_entry_mut(virtual_address, root)?;
        if !entry.flags().contains(PageFlags::PRESENT) {
            return Err(MemoryError::NotMapped);
        }
        entry.set_flags(flags);
        tlb::flush_page(virtual_address);
        Ok(())
    }

    /// Makes sure every kernel-half PML4 slot points at a table, so address
    /// spaces created later share all kernel mappings.
    pub fn populate_kernel_half(&mut self) -> Result<usize, MemoryError> {
        let root = self.pml4_root;
        let mut created = 0;
        for index in KERNEL_PML4_START..PAGE_TABLE_ENTRIES {
            // SAFETY: the kernel PML4 is a live page table.
            let present = unsafe { paging::table_at(self.direct_map, root)[index].flags() }
                .contains(PageFlags::PRESENT);
            if !present {
                self.next_table_or_create(root, index, PageFlags::PRESENT)?;
                created += 1;
            }
        }
        Ok(created)
    }

    /// Frees the lower-half tables of a user hierarchy and its PML4.
    /// Leaf frames belong to the address space and must be freed beforehand.
    pub fn free_user_tables(&mut self, root: PhysAddr) -> Result<(), MemoryError> {
        if root == self.pml4_root {
            return Err(MemoryError::InvalidFree);
        }

        for index in 0..KERNEL_PML4_START {
            if let Ok(pdpt) = self.next_table(root, index) {
                self.free_table_tree(pdpt, 3)?;
            }
        }
        self.free_frame(root)
    }

    /// Frees `table` and the tables below it. `level` is 3 for a PDPT.
    fn free_table_tree(&mut self, table: PhysAddr, level: u8) -> Result<(), MemoryError> {
        if level > 1 {
            for index in 0..PAGE_TABLE_ENTRIES {
                if let Ok(child) = self.next_table(table, index) {
                    self.free_table_tree(child, level - 1)?;
                }
            }
        }
        self.free_frame(table)
    }

    /// Maps all tracked physical memory at [`HIGHER_HALF_DIRECT_MAP`] in the
    /// kernel address space. Returns the number of pages mapped.
    pub fn map_direct_region(&mut self) -> Result<usize, MemoryError> {
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::NO_EXECUTE;
        let root = self.pml4_root;
        for frame in 0..self.total_frames() {
            let physical = PhysAddr::new((frame * FRAME_SIZE) as u64);
            let virtual_address = VirtAddr::new(HIGHER_HALF_DIRECT_MAP + physical.as_u64());
            self.map_in(root, physical, virtual_address, flags)?;
        }

        log::info!(
            "Direct map covers {} frames at {:#x}",
            self.total_frames(),
            HIGHER_HALF_DIRECT_MAP
        );
        Ok(self.total_frames())
    }

    /// Switches table access over to the kernel's own direct map.
    ///
    /// # Safety
    /// [`Self::map_direct_region`] must have succeeded and the kernel PML4
    /// must be the active one.
    pub unsafe fn use_direct_map(&mut self) {
        self.direct_map = VirtAddr::new(HIGHER_HALF_DIRECT_MAP);
    }
}

unsafe impl FrameAllocator<Size4KiB> for PhysicalMemoryManager {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        PhysicalMemoryManager::allocate_frame(self)
            .ok()
            .map(PhysFrame::containing_address)
    }
}

impl FrameDeallocator<Size4KiB> for PhysicalMemoryManager {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        if let Err(err) = self.free_frame(frame.start_address()) {
            log::warn!("Failed to free frame {:?}: {}", frame, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::paging::{RESERVE, SHARED},
        testing::SimulatedMemory,
    };

    #[test]
    fn test_first_frame_and_bitmap_are_reserved() {
        let memory = SimulatedMemory::new(64);
        let pmm = memory.pmm();

        assert!(pmm.is_frame_used(PhysAddr::new(0)));
        // Frame 1 holds the bitmap, frame 2 the fresh PML4.
        assert!(pmm.is_frame_used(PhysAddr::new(0x1000)));
        assert!(pmm.is_frame_used(PhysAddr::new(0x2000)));
        assert_eq!(pmm.free_frames(), 61);
        assert_eq!(pmm.memory_size(), 64 * PAGE_SIZE);
        assert_eq!(pmm.memory_used(), 3 * PAGE_SIZE);
    }

    #[test]
    fn test_freed_frame_is_reused_first() {
        let memory = SimulatedMemory::new(64);
        let mut pmm = memory.pmm();

        let a = pmm.allocate_frame().unwrap();
        let b = pmm.allocate_frame().unwrap();
        let c = pmm.allocate_frame().unwrap();
        assert!(a < b && b < c);

        pmm.free_frame(b).unwrap();
        assert_eq!(pmm.allocate_frame(), Ok(b));
    }

    #[test]
    fn test_exhaustion_reports_out_of_memory() {
        let memory = SimulatedMemory::new(16);
        let mut pmm = memory.pmm();

        let free = pmm.free_frames();
        for _ in 0..free {
            let frame = pmm.allocate_frame().unwrap();
            assert_ne!(frame.as_u64(), 0);
        }
        assert_eq!(pmm.allocate_frame(), Err(MemoryError::OutOfMemory));
        assert_eq!(pmm.free_frames(), 0);
    }

    #[test]
    fn test_free_frame_errors() {
        let memory = SimulatedMemory::new(16);
        let mut pmm = memory.pmm();

        let frame = pmm.allocate_frame().unwrap();
        pmm.free_frame(frame).unwrap();
        assert_eq!(pmm.free_frame(frame), Err(MemoryError::InvalidFree));
        assert_eq!(
            pmm.free_frame(PhysAddr::new(0x1234)),
            Err(MemoryError::AlignmentViolation)
        );
        assert_eq!(
            pmm.free_frame(PhysAddr::new(0x100_0000)),
            Err(MemoryError::InvalidFrame)
        );
    }

    #[test]
    fn test_map_creates_missing_tables() {
        let memory = SimulatedMemory::new(64);
        let mut pmm = memory.pmm();
        let root = pmm.pml4_root();

        let frame = pmm.allocate_frame().unwrap();
        let used = pmm.memory_used();
        let page = VirtAddr::new(0x4000_0000_0000);
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER_ACCESSIBLE;

        assert_eq!(pmm.map_in(root, frame, page, flags), Ok(page));
        // PDPT, PD and PT were all created.
        assert_eq!(pmm.memory_used(), used + 3 * PAGE_SIZE);
        assert_eq!(pmm.translate_in(root, page), Some(frame));
        assert_eq!(pmm.translate_in(root, page + 0x123u64), Some(frame + 0x123u64));
        assert!(pmm.is_mapped(frame, page, root));

        let entry = pmm.entry(page, root).unwrap();
        assert_eq!(entry.addr(), frame);
        assert_eq!(entry.flags(), flags);

        // A neighbouring page reuses the same tables.
        let other = pmm.allocate_frame().unwrap();
        let used = pmm.memory_used();
        pmm.map_in(root, other, page + PAGE_SIZE, flags).unwrap();
        assert_eq!(pmm.memory_used(), used);
    }

    #[test]
    fn test_unmap_clears_present() {
        let memory = SimulatedMemory::new(64);
        let mut pmm = memory.pmm();

        let frame = pmm.allocate_frame().unwrap();
        let page = VirtAddr::new(0xFFFF_8000_1000_0000);
        pmm.map(frame, page, PageFlags::WRITABLE).unwrap();

        assert_eq!(pmm.unmap(page), Ok(frame));
        let entry = pmm.entry(page, pmm.pml4_root()).unwrap();
        assert!(!entry.flags().contains(PageFlags::PRESENT));
        assert_eq!(pmm.translate(page), None);
        assert_eq!(pmm.unmap(page), Err(MemoryError::NotMapped));
        assert_eq!(
            pmm.unmap(VirtAddr::new(0x7000_0000_0000)),
            Err(MemoryError::NotMapped)
        );
    }

    #[test]
    fn test_map_rejects_conflicts_and_misalignment() {
        let memory = SimulatedMemory::new(64);
        let mut pmm = memory.pmm();

        let a = pmm.allocate_frame().unwrap();
        let b = pmm.allocate_frame().unwrap();
        let page = VirtAddr::new(0x20_0000);

        pmm.map(a, page, PageFlags::WRITABLE).unwrap();
        assert_eq!(pmm.map(a, page, PageFlags::empty()), Ok(page));
        assert!(!pmm
            .entry(page, pmm.pml4_root())
            .unwrap()
            .flags()
            .contains(PageFlags::WRITABLE));
        assert_eq!(
            pmm.map(b, page, PageFlags::WRITABLE),
            Err(MemoryError::AlreadyMapped)
        );
        assert_eq!(
            pmm.map(b, page + 8u64, PageFlags::WRITABLE),
            Err(MemoryError::AlignmentViolation)
        );
    }

    #[test]
    fn test_software_flags_and_nx_are_filtered() {
        let memory = SimulatedMemory::new(64);
        let mut pmm = memory.pmm();
        let root = pmm.pml4_root();

        let frame = pmm.allocate_frame().unwrap();
        let page = VirtAddr::new(0x40_0000);
        let flags = PageFlags::WRITABLE | PageFlags::NO_EXECUTE | RESERVE | SHARED;
        pmm.map(frame, page, flags).unwrap();
        assert_eq!(
            pmm.entry(page, root).unwrap().flags(),
            PageFlags::PRESENT | PageFlags::WRITABLE
        );

        pmm.set_nx_enabled(true);
        pmm.change_page_flags(page, flags, root).unwrap();
        assert_eq!(
            pmm.entry(page, root).unwrap().flags(),
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::NO_EXECUTE
        );
    }

    #[test]
    fn test_change_page_flags_grants_user_access_to_tables() {
        let memory = SimulatedMemory::new(64);
        let mut pmm = memory.pmm();
        let root = pmm.pml4_root();

        let frame = pmm.allocate_frame().unwrap();
        let page = VirtAddr::new(0x60_0000);
        pmm.map(frame, page, PageFlags::WRITABLE).unwrap();
        pmm.change_page_flags(page, PageFlags::USER_ACCESSIBLE, root)
            .unwrap();

        let [p4, _, _, _] = paging::table_indices(page);
        let top = unsafe { &paging::table_at(pmm.direct_map_offset(), root)[p4] };
        assert!(top.flags().contains(PageFlags::USER_ACCESSIBLE));
        assert_eq!(
            pmm.change_page_flags(VirtAddr::new(0x61_0000), PageFlags::empty(), root),
            Err(MemoryError::NotMapped)
        );
    }

    #[test]
    fn test_identity_map_and_area() {
        let memory = SimulatedMemory::new(64);
        let mut pmm = memory.pmm();
        let root = pmm.pml4_root();

        let frame = PhysAddr::new(0x30_000);
        pmm.reserve(frame, 0x3000);
        assert!(pmm.is_frame_used(frame + 0x2000u64));

        assert_eq!(
            pmm.identity_map(frame, PageFlags::WRITABLE),
            Ok(VirtAddr::new(0x30_000))
        );
        assert_eq!(pmm.translate(VirtAddr::new(0x30_000)), Some(frame));

        let base = VirtAddr::new(0xFFFF_8000_0000_0000);
        pmm.map_area(root, frame, base, 0x3000, PageFlags::WRITABLE)
            .unwrap();
        assert_eq!(pmm.translate(base + 0x2fffu64), Some(frame + 0x2fffu64));

        pmm.unmap_area(root, base, 0x4000);
        assert_eq!(pmm.translate(base), None);
    }

    #[test]
    fn test_translate_honours_huge_pages() {
        let memory = SimulatedMemory::new(64);
        let mut pmm = memory.pmm();
        let root = pmm.pml4_root();

        // Build a 2 MiB leaf by hand: map one page, then turn its PD entry huge.
        let frame = pmm.allocate_frame().unwrap();
        let page = VirtAddr::new(0x8000_0000);
        pmm.map(frame, page, PageFlags::WRITABLE).unwrap();

        let [p4, p3, p2, _] = paging::table_indices(page);
        let direct_map = pmm.direct_map_offset();
        unsafe {
            let pdpt = paging::table_at(direct_map, root)[p4].addr();
            let pd = paging::table_at(direct_map, pdpt)[p3].addr();
            paging::table_at(direct_map, pd)[p2].set_addr(
                PhysAddr::new(0x4000_0000),
                PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::HUGE_PAGE,
            );
        }

        assert_eq!(
            pmm.translate(page + 0x12_3456u64),
            Some(PhysAddr::new(0x4012_3456))
        );
        assert_eq!(
            pmm.map(frame, page + PAGE_SIZE, PageFlags::WRITABLE),
            Err(MemoryError::HugePageConflict)
        );
    }

    #[test]
    fn test_allocate_and_free_area() {
        let memory = SimulatedMemory::new(64);
        let mut pmm = memory.pmm();

        let area = pmm.allocate_area(PhysAddr::new(0x10_000), 3 * FRAME_SIZE).unwrap();
        assert_eq!(area, PhysAddr::new(0x10_000));
        assert!(pmm.is_frame_used(area + 0x2000u64));
        assert_eq!(pmm.allocate_area(area, 0), Err(MemoryError::ZeroSize));

        pmm.free_area(area, 3 * FRAME_SIZE).unwrap();
        assert!(!pmm.is_frame_used(area));
        assert_eq!(
            pmm.free_area(area, FRAME_SIZE),
            Err(MemoryError::InvalidFree)
        );
    }

    #[test]
    fn test_free_user_tables_returns_every_table() {
        let memory = SimulatedMemory::new(64);
        let mut pmm = memory.pmm();

        let free = pmm.free_frames();
        let root = pmm.allocate_frame().unwrap();
        pmm.clean_page_table(root);

        let frame = pmm.allocate_frame().unwrap();
        pmm.map_in(root, frame, VirtAddr::new(0x1000), PageFlags::USER_ACCESSIBLE)
            .unwrap();
        pmm.map_in(root, frame, VirtAddr::new(0x80_0000_0000), PageFlags::USER_ACCESSIBLE)
            .unwrap();

        pmm.unmap_in(root, VirtAddr::new(0x1000)).unwrap();
        pmm.unmap_in(root, VirtAddr::new(0x80_0000_0000)).unwrap();
        pmm.free_frame(frame).unwrap();
        pmm.free_user_tables(root).unwrap();

        assert_eq!(pmm.free_frames(), free);
        assert_eq!(
            pmm.free_user_tables(pmm.pml4_root()),
            Err(MemoryError::InvalidFree)
        );
    }

    #[test]
    fn test_populate_kernel_half() {
        let memory = SimulatedMemory::new(512);
        let mut pmm = memory.pmm();

        assert_eq!(pmm.populate_kernel_half(), Ok(256));
        assert_eq!(pmm.populate_kernel_half(), Ok(0));
    }

    #[test]
    fn test_frame_allocator_traits() {
        let memory = SimulatedMemory::new(16);
        let mut pmm = memory.pmm();

        let frame = FrameAllocator::<Size4KiB>::allocate_frame(&mut pmm).unwrap();
        assert!(pmm.is_frame_used(frame.start_address()));
        unsafe { pmm.deallocate_frame(frame) };
        assert!(!pmm.is_frame_used(frame.start_address()));
    }
}
