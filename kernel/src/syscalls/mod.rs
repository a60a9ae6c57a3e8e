//! System call entry points.

pub mod memory;
pub mod syscall_handlers;

pub use syscall_handlers::{dispatch_syscall, SyscallArgs};
