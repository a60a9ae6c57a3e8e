//! Host-side fixtures for unit tests.
//!
//! Physical memory is simulated by a page-aligned buffer; its address doubles
//! as the direct-map offset, so "physical" address `p` lives at `base + p`.

use std::alloc::{alloc_zeroed, dealloc, Layout};

use spin::{Mutex, MutexGuard};
use x86_64::{PhysAddr, VirtAddr};

use crate::{
    constants::memory::FRAME_SIZE,
    memory::{
        boot_memory_map::{BootMemoryMap, MemoryRegion, MemoryRegionKind},
        error::MemoryError,
        heap::HeapSource,
        physical::PhysicalMemoryManager,
        PHYSICAL_MEMORY_MANAGER,
    },
};

/// Serialises tests that touch the global memory managers.
static GLOBAL_STATE: Mutex<()> = Mutex::new(());

pub fn lock_global_state() -> MutexGuard<'static, ()> {
    GLOBAL_STATE.lock()
}

pub struct SimulatedMemory {
    base: *mut u8,
    layout: Layout,
}

impl SimulatedMemory {
    /// Zeroed physical memory of `frames` frames.
    pub fn new(frames: usize) -> Self {
        let layout = Layout::from_size_align(frames * FRAME_SIZE, FRAME_SIZE).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null());
        Self { base, layout }
    }

    pub fn direct_map(&self) -> VirtAddr {
        VirtAddr::new(self.base as u64)
    }

    /// A memory map reporting the whole buffer as usable.
    pub fn memory_map(&self) -> BootMemoryMap {
        let mut map = BootMemoryMap::new();
        map.push(MemoryRegion::new(
            0,
            self.layout.size() as u64,
            MemoryRegionKind::Usable,
        ));
        map
    }

    /// A frame allocator over this memory with a fresh kernel PML4.
    /// The manager must not outlive `self`.
    pub fn pmm(&self) -> PhysicalMemoryManager {
        unsafe { PhysicalMemoryManager::new(&self.memory_map(), self.direct_map(), None) }.unwrap()
    }

    /// Leaks the buffer for tests whose managers end up in `'static` globals.
    pub fn leak(self) -> VirtAddr {
        let direct_map = self.direct_map();
        core::mem::forget(self);
        direct_map
    }
}

impl Drop for SimulatedMemory {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}

/// Simulated memory installed as the global frame allocator until dropped.
/// Hold [`lock_global_state`] for as long as it lives.
pub struct GlobalMemory {
    _memory: SimulatedMemory,
}

impl GlobalMemory {
    pub fn install(frames: usize) -> Self {
        let memory = SimulatedMemory::new(frames);
        *PHYSICAL_MEMORY_MANAGER.lock() = Some(memory.pmm());
        Self { _memory: memory }
    }
}

impl Drop for GlobalMemory {
    fn drop(&mut self) {
        *PHYSICAL_MEMORY_MANAGER.lock() = None;
    }
}

/// Heap source taking contiguous frames from the global frame allocator and
/// handing them out through the direct map, the way a kernel heap grows.
///
/// Growing while the frame allocator is locked fails instead of spinning.
pub struct GlobalFrameSource {
    pub grows: usize,
}

impl HeapSource for GlobalFrameSource {
    fn grow(&mut self, size: usize) -> Result<VirtAddr, MemoryError> {
        let mut guard = PHYSICAL_MEMORY_MANAGER
            .try_lock()
            .ok_or(MemoryError::OutOfMemory)?;
        let pmm = guard.as_mut().ok_or(MemoryError::OutOfMemory)?;

        let physical = pmm.allocate_area(PhysAddr::zero(), size)?;
        self.grows += 1;
        Ok(pmm.phys_to_virt(physical))
    }
}

/// Heap source handing out consecutive slices of a host buffer.
pub struct BufferSource {
    base: *mut u8,
    layout: Layout,
    used: usize,
    pub grows: usize,
}

unsafe impl Send for BufferSource {}

impl BufferSource {
    pub fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, FRAME_SIZE).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null());
        Self {
            base,
            layout,
            used: 0,
            grows: 0,
        }
    }

    pub fn base(&self) -> usize {
        self.base as usize
    }

    /// Skips `size` bytes so the next range is not adjacent to the last one.
    pub fn skip(&mut self, size: usize) {
        self.used += size;
    }
}

impl HeapSource for BufferSource {
    fn grow(&mut self, size: usize) -> Result<VirtAddr, MemoryError> {
        if self.used + size > self.layout.size() {
            return Err(MemoryError::OutOfMemory);
        }

        let start = self.base as u64 + self.used as u64;
        self.used += size;
        self.grows += 1;
        Ok(VirtAddr::new(start))
    }
}

impl Drop for BufferSource {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}
