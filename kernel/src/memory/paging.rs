//! Page table entry flags and the raw table accessors used by the page walk.

use x86_64::{
    structures::paging::{PageTable, PageTableFlags},
    PhysAddr, VirtAddr,
};

pub use x86_64::structures::paging::PageTableFlags as PageFlags;

/// Reserve the virtual range without backing it with frames.
pub const RESERVE: PageFlags = PageFlags::BIT_9;
/// The frames belong to someone else and are never freed by the address space.
pub const SHARED: PageFlags = PageFlags::BIT_10;
/// The range is a stack.
pub const STACK: PageFlags = PageFlags::BIT_11;

/// Bookkeeping flags that never reach a page table entry.
pub const SOFTWARE_FLAGS: PageFlags = RESERVE.union(SHARED).union(STACK);

/// Page table indices of `address`, PML4 first.
pub fn table_indices(address: VirtAddr) -> [usize; 4] {
    [
        usize::from(address.p4_index()),
        usize::from(address.p3_index()),
        usize::from(address.p2_index()),
        usize::from(address.p1_index()),
    ]
}

/// Flags written into a leaf entry: software flags stripped, PRESENT forced,
/// and NO_EXECUTE dropped unless the CPU has it enabled.
pub fn leaf_flags(flags: PageFlags, nx_enabled: bool) -> PageFlags {
    let mut flags = flags.difference(SOFTWARE_FLAGS) | PageFlags::PRESENT;
    if !nx_enabled {
        flags.remove(PageFlags::NO_EXECUTE);
    }
    flags
}

/// Flags for an intermediate table entry leading to a leaf with `leaf` flags.
pub fn table_flags(leaf: PageFlags) -> PageFlags {
    let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    if leaf.contains(PageTableFlags::USER_ACCESSIBLE) {
        flags |= PageTableFlags::USER_ACCESSIBLE;
    }
    flags
}

/// Pointer to the table stored in `frame`.
pub fn table_ptr(direct_map: VirtAddr, frame: PhysAddr) -> *mut PageTable {
    (direct_map + frame.as_u64()).as_mut_ptr()
}

/// Table stored in `frame`, reached through the direct map.
///
/// # Safety
/// `frame` must hold a page table, the direct map must cover it, and no other
/// reference to the same table may be live.
pub unsafe fn table_at<'a>(direct_map: VirtAddr, frame: PhysAddr) -> &'a mut PageTable {
    &mut *table_ptr(direct_map, frame)
}

/// Zeroes the table in `frame`.
///
/// # Safety
/// Same as [`table_at`]; any mappings the table held are lost.
pub unsafe fn clear_table(direct_map: VirtAddr, frame: PhysAddr) {
    table_ptr(direct_map, frame).write_bytes(0, 1);
}
