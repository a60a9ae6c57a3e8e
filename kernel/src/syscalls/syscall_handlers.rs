use crate::{
    constants::syscalls::{
        SYSCALL_ALLOCATE_MEMORY, SYSCALL_ERROR, SYSCALL_FREE_MEMORY, SYSCALL_KLOG,
    },
    syscalls::memory::{sys_allocate_memory, sys_free_memory},
};

/// Raw argument registers of a system call.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyscallArgs {
    pub arg0: u64,
    pub arg1: u64,
    pub arg2: u64,
    pub arg3: u64,
    pub arg4: u64,
    pub arg5: u64,
}

/// Runs system call `number` and returns the value for rax.
///
/// # Safety
/// Pointer arguments must be readable in the active address space.
pub unsafe fn dispatch_syscall(number: u32, args: &SyscallArgs) -> u64 {
    match number {
        SYSCALL_KLOG => sys_klog(args.arg0, args.arg1),
        SYSCALL_ALLOCATE_MEMORY => sys_allocate_memory(args.arg0),
        SYSCALL_FREE_MEMORY => sys_free_memory(args.arg0),
        _ => {
            log::warn!("Unknown syscall: {}", number);
            SYSCALL_ERROR
        }
    }
}

/// Logs `length` bytes of UTF-8 text at `message`.
unsafe fn sys_klog(message: u64, length: u64) -> u64 {
    if message == 0 {
        return SYSCALL_ERROR;
    }

    let bytes = core::slice::from_raw_parts(message as *const u8, length as usize);
    match core::str::from_utf8(bytes) {
        Ok(text) => {
            log::info!("{}", text);
            0
        }
        Err(_) => SYSCALL_ERROR,
    }
}
