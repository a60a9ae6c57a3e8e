// Syscall numbers
pub const SYSCALL_KLOG: u32 = 0;
pub const SYSCALL_ALLOCATE_MEMORY: u32 = 1;
pub const SYSCALL_FREE_MEMORY: u32 = 2;

/// Returned in rax when a syscall fails.
pub const SYSCALL_ERROR: u64 = u64::MAX;
