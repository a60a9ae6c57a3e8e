/// Failures reported by the frame allocator, the address-space managers and the heaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// No free physical frame (or heap range) satisfies the request.
    OutOfMemory,
    /// The address-space window has no room left for the range.
    OutOfVirtualSpace,
    /// The address was never handed out, or was already released.
    InvalidFree,
    /// An address or size that must be page aligned was not.
    AlignmentViolation,
    /// The frame lies outside the memory tracked by the frame bitmap.
    InvalidFrame,
    /// The target range is already mapped or allocated.
    AlreadyMapped,
    /// The page walk hit a missing table or a non-present entry.
    NotMapped,
    /// The walk ran into a large-page entry where a table was expected.
    HugePageConflict,
    /// A zero-byte allocation was requested.
    ZeroSize,
    /// The address cannot be handed out, e.g. the null page.
    InvalidAddress,
}

impl core::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MemoryError::OutOfMemory => write!(f, "Out of memory"),
            MemoryError::OutOfVirtualSpace => write!(f, "Out of virtual address space"),
            MemoryError::InvalidFree => write!(f, "Free of an address that is not allocated"),
            MemoryError::AlignmentViolation => write!(f, "Address is not page aligned"),
            MemoryError::InvalidFrame => write!(f, "Frame is outside of physical memory"),
            MemoryError::AlreadyMapped => write!(f, "Range is already mapped"),
            MemoryError::NotMapped => write!(f, "Address is not mapped"),
            MemoryError::HugePageConflict => write!(f, "Walk hit a huge page entry"),
            MemoryError::ZeroSize => write!(f, "Zero sized allocation"),
            MemoryError::InvalidAddress => write!(f, "Address cannot be allocated"),
        }
    }
}
