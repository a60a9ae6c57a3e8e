//! Process-side users of the memory subsystem.

pub mod address_space;

pub use address_space::ProcessAddressSpace;
