//! `ALLOCATE_MEMORY` and `FREE_MEMORY`: the calling process's own heap.

use core::ptr::NonNull;

use crate::{constants::syscalls::SYSCALL_ERROR, memory::heap};

/// Returns the address of a fresh block of `size` bytes, or zero.
pub fn sys_allocate_memory(size: u64) -> u64 {
    match heap::malloc(size as usize) {
        Ok(block) => block.as_ptr() as u64,
        Err(err) => {
            log::debug!("ALLOCATE_MEMORY of {:#x} bytes failed: {}", size, err);
            0
        }
    }
}

/// Frees a block returned by [`sys_allocate_memory`]. Returns zero on success.
pub fn sys_free_memory(address: u64) -> u64 {
    let Some(block) = NonNull::new(address as *mut u8) else {
        return SYSCALL_ERROR;
    };

    match heap::free(block) {
        Ok(()) => 0,
        Err(err) => {
            log::error!("FREE_MEMORY of {:#x} failed: {}", address, err);
            SYSCALL_ERROR
        }
    }
}
