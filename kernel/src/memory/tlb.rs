//! TLB maintenance after a mapping in the active address space changes.
//!
//! Only the local core is flushed; other cores pick up changes on their next
//! address-space switch.

use x86_64::VirtAddr;

/// Drops any cached translation for `address` on this core.
#[inline]
pub fn flush_page(address: VirtAddr) {
    #[cfg(target_os = "none")]
    x86_64::instructions::tlb::flush(address);

    #[cfg(not(target_os = "none"))]
    let _ = address;
}

/// Drops every non-global cached translation on this core.
#[inline]
pub fn flush_all() {
    #[cfg(target_os = "none")]
    x86_64::instructions::tlb::flush_all();
}
