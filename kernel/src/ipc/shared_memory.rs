//! Named blocks of physical memory mapped into several address spaces.

use alloc::{collections::BTreeMap, string::String};

use x86_64::{PhysAddr, VirtAddr};

use crate::{
    constants::memory::FRAME_SIZE,
    memory::{
        address::size_to_frames, error::MemoryError, virtual_memory::VirtualMemoryManager,
        with_physical_memory_manager,
    },
};

#[derive(Debug)]
pub struct SharedMemory {
    name: String,
    physical: PhysAddr,
    size: usize,
    /// Where each process has the block mapped, by pid.
    mappings: BTreeMap<u64, VirtAddr>,
    released: bool,
}

impl SharedMemory {
    /// Allocates a zeroed block of `size` bytes of contiguous physical memory.
    ///
    /// Takes the global frame allocator, so the caller must not hold it.
    pub fn new(name: &str, size: usize) -> Result<Self, MemoryError> {
        let name = String::from(name);
        let physical = with_physical_memory_manager(|pmm| -> Result<PhysAddr, MemoryError> {
            let physical = pmm.allocate_area(PhysAddr::zero(), size)?;
            // SAFETY: the area was just allocated and is covered by the direct map.
            unsafe {
                pmm.phys_to_virt(physical)
                    .as_mut_ptr::<u8>()
                    .write_bytes(0, size_to_frames(size) * FRAME_SIZE);
            }
            Ok(physical)
        })?;

        log::debug!("Shared memory '{}': {:#x} bytes at {:?}", name, size, physical);
        Ok(Self {
            name,
            physical,
            size,
            mappings: BTreeMap::new(),
            released: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn physical_address(&self) -> PhysAddr {
        self.physical
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of processes with the block mapped.
    pub fn reference_count(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Maps the block into `pid`'s address space. Opening twice returns the
    /// existing mapping.
    pub fn open(
        &mut self,
        pid: u64,
        vmm: &mut VirtualMemoryManager,
    ) -> Result<VirtAddr, MemoryError> {
        if self.released {
            return Err(MemoryError::InvalidAddress);
        }
        if let Some(&address) = self.mappings.get(&pid) {
            return Ok(address);
        }

        let (physical, size) = (self.physical, self.size);
        let address =
            with_physical_memory_manager(|pmm| vmm.load_shared_memory(physical, size, pmm))?;
        self.mappings.insert(pid, address);
        Ok(address)
    }

    pub fn mapping_for(&self, pid: u64) -> Option<VirtAddr> {
        self.mappings.get(&pid).copied()
    }

    /// Unmaps the block from `pid`'s address space. The physical memory is
    /// freed with the last mapping, in which case `true` is returned.
    pub fn close(
        &mut self,
        pid: u64,
        vmm: &mut VirtualMemoryManager,
    ) -> Result<bool, MemoryError> {
        let address = self.mappings.remove(&pid).ok_or(MemoryError::InvalidFree)?;
        let last = self.mappings.is_empty();
        let (physical, size) = (self.physical, self.size);

        with_physical_memory_manager(|pmm| -> Result<(), MemoryError> {
            vmm.free(address, pmm)?;
            if last {
                pmm.free_area(physical, size)?;
            }
            Ok(())
        })?;

        if last {
            self.released = true;
            log::debug!("Shared memory '{}' released", self.name);
        }
        Ok(last)
    }
}
