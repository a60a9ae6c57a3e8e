//! Inter-process communication over the memory subsystem.

pub mod shared_memory;

use core::ptr::NonNull;

use crate::memory::{
    error::MemoryError,
    heap::{self, Heap},
};

pub use shared_memory::SharedMemory;

/// Copies `message` into the receiver's heap and returns the copy.
///
/// The receiver's heap must be addressable from the current address space,
/// which holds for the kernel heap and for the heap of the active process.
pub fn deliver_message(
    receiver: &(dyn Heap + 'static),
    message: &[u8],
) -> Result<NonNull<u8>, MemoryError> {
    heap::with_memory_manager(receiver, || {
        let copy = heap::malloc(message.len())?;
        // SAFETY: the allocation is at least `message.len()` bytes long.
        unsafe {
            core::ptr::copy_nonoverlapping(message.as_ptr(), copy.as_ptr(), message.len());
        }
        Ok(copy)
    })
}
