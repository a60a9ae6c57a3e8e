//! Physical frames, address spaces and heaps.
//!
//! Bring-up order is fixed: the [`PhysicalMemoryManager`] is built from the
//! boot memory map, the kernel's [`VirtualMemoryManager`] on top of it, and
//! the kernel heap on top of that.
//!
//! Locks are taken in one order: a heap, then the frame allocator. Heap
//! growth takes the frame allocator, so nothing may allocate from a heap
//! while holding it.

pub mod address;
pub mod bitmap_frame_allocator;
pub mod boot_memory_map;
pub mod chunk_region;
pub mod error;
pub mod heap;
pub mod mmio;
pub mod paging;
pub mod physical;
pub mod tlb;
pub mod virtual_memory;

pub use error::MemoryError;

use boot_memory_map::BootMemoryMap;
use heap::KernelHeap;
use physical::PhysicalMemoryManager;
use spin::Mutex;
use virtual_memory::VirtualMemoryManager;
use x86_64::{PhysAddr, VirtAddr};

/// The one frame allocator. `None` until [`init`] runs.
pub static PHYSICAL_MEMORY_MANAGER: Mutex<Option<PhysicalMemoryManager>> = Mutex::new(None);

/// Runs `f` on the global frame allocator with interrupts masked.
///
/// `f` must not allocate from a heap or lock one.
///
/// # Panics
/// If [`init`] has not run yet.
pub fn with_physical_memory_manager<F, R>(f: F) -> R
where
    F: FnOnce(&mut PhysicalMemoryManager) -> R,
{
    without_interrupts(|| {
        let mut guard = PHYSICAL_MEMORY_MANAGER.lock();
        if let Some(ref mut pmm) = *guard {
            f(pmm)
        } else {
            panic!("Physical memory manager does not exist.");
        }
    })
}

/// Runs `f` with interrupts disabled. A plain call off bare metal.
#[inline]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    #[cfg(target_os = "none")]
    {
        x86_64::instructions::interrupts::without_interrupts(f)
    }

    #[cfg(not(target_os = "none"))]
    {
        f()
    }
}

/// Brings up memory management on the bootstrap core.
///
/// `direct_map` is the boot loader's mapping of all physical memory and
/// `pml4_root` the active top-level table. Afterwards table access goes
/// through the kernel's own direct map window.
///
/// # Safety
/// Must run once, before anything allocates, with `direct_map` and
/// `pml4_root` describing the live paging state.
pub unsafe fn init(
    memory_map: &BootMemoryMap,
    direct_map: VirtAddr,
    pml4_root: PhysAddr,
) -> Result<&'static KernelHeap, MemoryError> {
    let nx_enabled = enable_no_execute();

    let mut pmm = PhysicalMemoryManager::new(memory_map, direct_map, Some(pml4_root))?;
    pmm.set_nx_enabled(nx_enabled);

    let tables = pmm.populate_kernel_half()?;
    log::debug!("Created {} kernel PML4 slots", tables);

    pmm.map_direct_region()?;
    pmm.use_direct_map();

    let vmm = VirtualMemoryManager::new_kernel(&mut pmm)?;
    without_interrupts(|| *PHYSICAL_MEMORY_MANAGER.lock() = Some(pmm));

    Ok(heap::init_kernel_heap(vmm))
}

/// Turns on no-execute support where the hardware has it.
fn enable_no_execute() -> bool {
    #[cfg(target_os = "none")]
    {
        use x86_64::registers::model_specific::{Efer, EferFlags};

        // SAFETY: long mode and paging are already active.
        unsafe {
            Efer::update(|flags| {
                flags.insert(EferFlags::NO_EXECUTE_ENABLE);
            });
        }
        Efer::read().contains(EferFlags::NO_EXECUTE_ENABLE)
    }

    #[cfg(not(target_os = "none"))]
    {
        false
    }
}
