//! Memory layout and allocator tuning.

pub const PAGE_SIZE: u64 = 0x1000;
pub const FRAME_SIZE: usize = 4096;

pub const BITMAP_ENTRY_SIZE: usize = 64;
pub const FULL_BITMAP_ENTRY: u64 = 0xFFFFFFFFFFFFFFFF;

/// Entries in one page table at any level.
pub const PAGE_TABLE_ENTRIES: usize = 512;
/// First PML4 slot of the kernel half; slots from here up are shared by every address space.
pub const KERNEL_PML4_START: usize = 256;

/// Where the kernel image is linked.
pub const HIGHER_HALF_KERNEL_OFFSET: u64 = 0xFFFF_FFFF_8000_0000;
/// Start of the higher half, also the base of the I/O window.
pub const HIGHER_HALF_MEM_OFFSET: u64 = 0xFFFF_8000_0000_0000;
/// Space reserved for the I/O window (10 GiB).
pub const HIGHER_HALF_MEM_RESERVED: u64 = 0x2_8000_0000;
pub const HIGHER_HALF_OFFSET: u64 = HIGHER_HALF_MEM_OFFSET + HIGHER_HALF_MEM_RESERVED;
/// Base of the kernel's own direct map of physical memory.
pub const HIGHER_HALF_DIRECT_MAP: u64 = HIGHER_HALF_OFFSET + PAGE_SIZE;

/// Gap between the end of the direct map and the kernel VMM window.
pub const VMM_RESERVED: u64 = 0x1_3800_0000;

/// User address spaces never hand out the null page.
pub const USER_SPACE_START: u64 = PAGE_SIZE;
/// One past the highest canonical lower-half address.
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;
pub const KERNEL_SPACE_END: u64 = HIGHER_HALF_KERNEL_OFFSET;

/// Heap chunk sizes are rounded up to this.
pub const CHUNK_ALIGNMENT: usize = 8;
/// Smallest range a heap requests from its source when it grows.
pub const HEAP_GROWTH: usize = 64 * 1024;

pub const PROCESS_STACK_SIZE: usize = 64 * 1024;

/// Regions kept from the bootloader memory map.
pub const MAX_MEMORY_REGIONS: usize = 128;
