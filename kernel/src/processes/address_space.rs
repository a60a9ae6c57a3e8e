//! Address space of a user process: its page tables, virtual ranges and heap.

use x86_64::{PhysAddr, VirtAddr};

use crate::{
    constants::memory::{FRAME_SIZE, PAGE_SIZE, PROCESS_STACK_SIZE},
    memory::{
        address::{align_direct_to_page, checked_align_to_page},
        error::MemoryError,
        heap::{self, Heap, LockedMemoryManager, MemoryManager},
        paging::{PageFlags, STACK},
        physical::PhysicalMemoryManager,
        virtual_memory::VirtualMemoryManager,
        with_physical_memory_manager, without_interrupts,
    },
};

pub type ProcessHeap = LockedMemoryManager<VirtualMemoryManager>;

pub struct ProcessAddressSpace {
    pml4_root: PhysAddr,
    heap: ProcessHeap,
}

impl ProcessAddressSpace {
    pub fn new(pmm: &mut PhysicalMemoryManager) -> Result<Self, MemoryError> {
        let vmm = VirtualMemoryManager::new_user(pmm)?;
        let pml4_root = vmm.pml4_root();
        log::debug!("Created process address space at {:?}", pml4_root);

        Ok(Self {
            pml4_root,
            heap: LockedMemoryManager::new(MemoryManager::new(vmm)),
        })
    }

    /// Builds an address space from the global frame allocator.
    pub fn create() -> Result<Self, MemoryError> {
        with_physical_memory_manager(Self::new)
    }

    pub fn pml4_root(&self) -> PhysAddr {
        self.pml4_root
    }

    pub fn heap(&self) -> &ProcessHeap {
        &self.heap
    }

    /// Makes this the address space and heap of the current core.
    ///
    /// # Safety
    /// `self` must stay in place until another address space is activated,
    /// and its kernel half must map the running kernel.
    pub unsafe fn activate(&self) {
        #[cfg(target_os = "none")]
        {
            use x86_64::{
                registers::control::{Cr3, Cr3Flags},
                structures::paging::PhysFrame,
            };
            Cr3::write(PhysFrame::containing_address(self.pml4_root), Cr3Flags::empty());
        }

        heap::set_active_memory_manager(Some(&self.heap));
    }

    /// Whether this space's heap is the one serving `malloc`.
    pub fn is_active(&self) -> bool {
        heap::is_active_memory_manager(&self.heap as &dyn Heap)
    }

    /// Runs `f` on this space's VMM and the global frame allocator.
    ///
    /// The heap lock is taken before the frame allocator, the same order heap
    /// growth uses.
    fn with_vmm<R>(
        &self,
        f: impl FnOnce(&mut VirtualMemoryManager, &mut PhysicalMemoryManager) -> R,
    ) -> R {
        without_interrupts(|| {
            let mut heap = self.heap.lock();
            with_physical_memory_manager(|pmm| f(heap.source_mut(), pmm))
        })
    }

    /// Allocates a user stack and returns its top.
    pub fn allocate_stack(&self, size: usize) -> Result<VirtAddr, MemoryError> {
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::NO_EXECUTE | STACK;
        let size = checked_align_to_page(size).ok_or(MemoryError::OutOfVirtualSpace)?;
        let base = self.with_vmm(|vmm, pmm| vmm.allocate(size, flags, pmm))?;
        Ok(base + size as u64)
    }

    /// Allocates a stack of [`PROCESS_STACK_SIZE`] bytes.
    pub fn allocate_default_stack(&self) -> Result<VirtAddr, MemoryError> {
        self.allocate_stack(PROCESS_STACK_SIZE)
    }

    /// Places a loadable segment at its link address: `memory_size` bytes
    /// starting at `address`, the first `data.len()` of them copied from
    /// `data` and the rest zeroed. `flags` are applied once the copy is done.
    pub fn load_segment(
        &self,
        address: VirtAddr,
        data: &[u8],
        memory_size: usize,
        flags: PageFlags,
    ) -> Result<VirtAddr, MemoryError> {
        if data.len() > memory_size {
            return Err(MemoryError::InvalidAddress);
        }

        let base = align_direct_to_page(address.as_u64());
        let offset = (address.as_u64() - base) as usize;
        let length = offset
            .checked_add(memory_size)
            .and_then(checked_align_to_page)
            .ok_or(MemoryError::OutOfVirtualSpace)?;
        let root = self.pml4_root;

        self.with_vmm(|vmm, pmm| -> Result<(), MemoryError> {
            let writable = PageFlags::PRESENT | PageFlags::WRITABLE;
            vmm.allocate_at(VirtAddr::new(base), length, writable, pmm)?;

            // Pages are zeroed when backed, so only the file image is copied.
            let mut copied = 0;
            while copied < data.len() {
                let target = address + copied as u64;
                let in_page = FRAME_SIZE - (target.as_u64() % PAGE_SIZE) as usize;
                let count = in_page.min(data.len() - copied);

                let frame = pmm.translate_in(root, target).ok_or(MemoryError::NotMapped)?;
                // SAFETY: the frame was just mapped for this segment and is reached
                // through the direct map.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        data[copied..].as_ptr(),
                        pmm.phys_to_virt(frame).as_mut_ptr::<u8>(),
                        count,
                    );
                }
                copied += count;
            }

            let flags = flags | PageFlags::PRESENT | PageFlags::USER_ACCESSIBLE;
            for page in 0..length / FRAME_SIZE {
                let page_address = VirtAddr::new(base + (page * FRAME_SIZE) as u64);
                pmm.change_page_flags(page_address, flags, root)?;
            }
            Ok(())
        })?;

        log::debug!(
            "Loaded segment at {:?}: {:#x} bytes from image, {:#x} in memory",
            address,
            data.len(),
            memory_size
        );
        Ok(address)
    }

    /// Returns every frame and table of this address space to the global
    /// frame allocator.
    pub fn teardown(self) -> Result<(), MemoryError> {
        if self.is_active() {
            // SAFETY: clearing the active heap never leaves a dangling handle.
            unsafe { heap::set_active_memory_manager(None) };
        }

        let root = self.pml4_root;
        let vmm = self.heap.into_inner().into_source();
        with_physical_memory_manager(|pmm| vmm.destroy(pmm))?;
        log::debug!("Tore down process address space at {:?}", root);
        Ok(())
    }
}
