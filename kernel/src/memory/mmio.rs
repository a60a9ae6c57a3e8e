//! Device memory access.
//!
//! Device registers are mapped uncached into the I/O window at the bottom of
//! the higher half and accessed with volatile reads and writes only.

use core::{marker::PhantomData, ptr};

use x86_64::{PhysAddr, VirtAddr};

use crate::{
    constants::memory::{FRAME_SIZE, PAGE_SIZE},
    memory::{
        address::{align_direct_to_page, checked_align_to_page, size_to_frames, to_io_region},
        error::MemoryError,
        paging::PageFlags,
        physical::PhysicalMemoryManager,
    },
};

/// A device register of width `T`.
pub struct MemIo<T> {
    address: *mut T,
    _marker: PhantomData<T>,
}

impl<T: Copy> MemIo<T> {
    /// # Safety
    /// `address` must be a mapped, suitably aligned register that stays
    /// mapped for the lifetime of the value.
    pub unsafe fn new(address: VirtAddr) -> Self {
        Self {
            address: address.as_u64() as *mut T,
            _marker: PhantomData,
        }
    }

    pub fn address(&self) -> VirtAddr {
        VirtAddr::from_ptr(self.address)
    }

    pub fn read(&self) -> T {
        // SAFETY: guaranteed by the constructor.
        unsafe { ptr::read_volatile(self.address) }
    }

    pub fn write(&mut self, value: T) {
        // SAFETY: guaranteed by the constructor.
        unsafe { ptr::write_volatile(self.address, value) }
    }

    /// Read-modify-write of the register.
    pub fn update(&mut self, f: impl FnOnce(T) -> T) {
        let value = self.read();
        self.write(f(value));
    }
}

/// Maps `size` bytes of device memory at `physical` uncached into the I/O
/// window of the kernel address space, returning the address of `physical`.
///
/// Pages the boot loader already maps there with large pages are left as they are.
pub fn map_io_region(
    pmm: &mut PhysicalMemoryManager,
    physical: PhysAddr,
    size: usize,
) -> Result<VirtAddr, MemoryError> {
    if size == 0 {
        return Err(MemoryError::ZeroSize);
    }

    let base = align_direct_to_page(physical.as_u64());
    let offset = physical.as_u64() - base;
    let length = size
        .checked_add(offset as usize)
        .and_then(checked_align_to_page)
        .ok_or(MemoryError::InvalidAddress)?;
    let flags = PageFlags::PRESENT
        | PageFlags::WRITABLE
        | PageFlags::NO_CACHE
        | PageFlags::WRITE_THROUGH
        | PageFlags::NO_EXECUTE;

    for page in 0..size_to_frames(length) {
        let frame = PhysAddr::new(base + (page * FRAME_SIZE) as u64);
        let virtual_address = VirtAddr::new(to_io_region(frame.as_u64()));

        match pmm.map(frame, virtual_address, flags) {
            Ok(_) => {}
            Err(MemoryError::HugePageConflict) if pmm.translate(virtual_address) == Some(frame) => {
                log::debug!("I/O page {:?} already covered by a large page", frame);
            }
            Err(err) => return Err(err),
        }
    }

    log::debug!(
        "Mapped {} I/O pages for {:?} at {:#x}",
        length / PAGE_SIZE as usize,
        physical,
        to_io_region(base)
    );
    Ok(VirtAddr::new(to_io_region(physical.as_u64())))
}
