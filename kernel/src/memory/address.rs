//! Address arithmetic shared by the memory managers.
//!
//! The kernel sees physical memory through three windows in the higher half:
//! the kernel image at [`HIGHER_HALF_KERNEL_OFFSET`], the I/O window at
//! [`HIGHER_HALF_MEM_OFFSET`] and the direct map at [`HIGHER_HALF_DIRECT_MAP`].

use crate::constants::memory::{
    FRAME_SIZE, HIGHER_HALF_DIRECT_MAP, HIGHER_HALF_KERNEL_OFFSET, HIGHER_HALF_MEM_OFFSET,
    HIGHER_HALF_OFFSET, PAGE_SIZE,
};

/// Number of frames needed to hold `size` bytes.
pub const fn size_to_frames(size: usize) -> usize {
    size.div_ceil(FRAME_SIZE)
}

/// Rounds `size` up to a whole number of pages.
pub const fn align_to_page(size: usize) -> usize {
    align_up_to_page(size, FRAME_SIZE)
}

/// Rounds `size` up to a multiple of `page_size`, which must be a power of two.
pub const fn align_up_to_page(size: usize, page_size: usize) -> usize {
    (size + page_size - 1) & !(page_size - 1)
}

/// Like [`align_to_page`] but reports overflow instead of wrapping.
pub const fn checked_align_to_page(size: usize) -> Option<usize> {
    match size.checked_add(FRAME_SIZE - 1) {
        Some(padded) => Some(padded & !(FRAME_SIZE - 1)),
        None => None,
    }
}

/// Rounds an address down to the start of its page.
pub const fn align_direct_to_page(address: u64) -> u64 {
    address & !(PAGE_SIZE - 1)
}

pub const fn check_aligned(address: u64) -> bool {
    address & (PAGE_SIZE - 1) == 0
}

/// Kernel image address of a low physical address.
pub const fn to_higher_region(physical: u64) -> u64 {
    if physical < HIGHER_HALF_KERNEL_OFFSET {
        physical + HIGHER_HALF_KERNEL_OFFSET
    } else {
        physical
    }
}

/// Inverse of [`to_higher_region`].
pub const fn to_lower_region(virtual_address: u64) -> u64 {
    if virtual_address >= HIGHER_HALF_KERNEL_OFFSET {
        virtual_address - HIGHER_HALF_KERNEL_OFFSET
    } else {
        virtual_address
    }
}

/// I/O window address of a physical address.
pub const fn to_io_region(physical: u64) -> u64 {
    if physical < HIGHER_HALF_MEM_OFFSET {
        physical + HIGHER_HALF_MEM_OFFSET
    } else {
        physical
    }
}

/// Direct-map address of a physical address.
pub const fn to_dm_region(physical: u64) -> u64 {
    if physical < HIGHER_HALF_OFFSET {
        physical + HIGHER_HALF_DIRECT_MAP
    } else {
        physical
    }
}

/// Physical address behind a direct-map address.
pub const fn from_dm_region(virtual_address: u64) -> u64 {
    if virtual_address >= HIGHER_HALF_DIRECT_MAP && virtual_address < HIGHER_HALF_KERNEL_OFFSET {
        virtual_address - HIGHER_HALF_DIRECT_MAP
    } else {
        virtual_address
    }
}

/// Whether the address sits in the higher half.
pub const fn in_higher_region(virtual_address: u64) -> bool {
    virtual_address & (1 << 62) != 0
}
