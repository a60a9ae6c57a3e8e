//! System-wide constants and hardware-specific values.

pub mod memory;
pub mod ports;
pub mod syscalls;
