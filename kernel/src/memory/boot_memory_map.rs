//! A heap-free copy of the bootloader memory map.

use arrayvec::ArrayVec;
use limine::{memory_map::EntryType, response::MemoryMapResponse};

use crate::constants::memory::MAX_MEMORY_REGIONS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    BadMemory,
    BootloaderReclaimable,
    Framebuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self { base, length, kind }
    }

    pub const fn end(&self) -> u64 {
        self.base + self.length
    }

    pub fn is_usable(&self) -> bool {
        self.kind == MemoryRegionKind::Usable
    }
}

/// Regions reported at boot. Only usable regions are ever released to the
/// frame allocator, so regions that do not fit are dropped with a warning.
#[derive(Debug, Clone, Default)]
pub struct BootMemoryMap {
    regions: ArrayVec<MemoryRegion, MAX_MEMORY_REGIONS>,
}

impl BootMemoryMap {
    pub const fn new() -> Self {
        Self {
            regions: ArrayVec::new_const(),
        }
    }

    /// Copies the Limine memory map.
    pub fn from_limine(response: &MemoryMapResponse) -> Self {
        let mut map = Self::new();
        for entry in response.entries().iter() {
            map.push(MemoryRegion::new(
                entry.base,
                entry.length,
                Self::kind_of(entry.entry_type),
            ));
        }
        map
    }

    fn kind_of(entry_type: EntryType) -> MemoryRegionKind {
        if entry_type == EntryType::USABLE {
            MemoryRegionKind::Usable
        } else if entry_type == EntryType::ACPI_RECLAIMABLE {
            MemoryRegionKind::AcpiReclaimable
        } else if entry_type == EntryType::ACPI_NVS {
            MemoryRegionKind::AcpiNvs
        } else if entry_type == EntryType::BAD_MEMORY {
            MemoryRegionKind::BadMemory
        } else if entry_type == EntryType::BOOTLOADER_RECLAIMABLE {
            MemoryRegionKind::BootloaderReclaimable
        } else if entry_type == EntryType::FRAMEBUFFER {
            MemoryRegionKind::Framebuffer
        } else {
            MemoryRegionKind::Reserved
        }
    }

    pub fn push(&mut self, region: MemoryRegion) {
        if region.length == 0 {
            return;
        }
        if self.regions.try_push(region).is_err() {
            log::warn!(
                "Memory map full, dropping region {:#x}..{:#x}",
                region.base,
                region.end()
            );
        }
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn usable_regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter().filter(|region| region.is_usable())
    }

    /// End of the highest usable region, which bounds the frame bitmap.
    pub fn top_of_usable(&self) -> u64 {
        self.usable_regions()
            .map(MemoryRegion::end)
            .max()
            .unwrap_or(0)
    }

    pub fn usable_bytes(&self) -> u64 {
        self.usable_regions().map(|region| region.length).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_of_usable_ignores_reserved() {
        let mut map = BootMemoryMap::new();
        map.push(MemoryRegion::new(0, 0x9_f000, MemoryRegionKind::Usable));
        map.push(MemoryRegion::new(
            0x10_0000,
            0x70_0000,
            MemoryRegionKind::Usable,
        ));
        map.push(MemoryRegion::new(
            0xFD00_0000,
            0x30_0000,
            MemoryRegionKind::Framebuffer,
        ));

        assert_eq!(map.regions().len(), 3);
        assert_eq!(map.top_of_usable(), 0x80_0000);
        assert_eq!(map.usable_bytes(), 0x9_f000 + 0x70_0000);
    }

    #[test]
    fn test_overflowing_map_keeps_first_regions() {
        let mut map = BootMemoryMap::new();
        for i in 0..(MAX_MEMORY_REGIONS as u64 + 4) {
            map.push(MemoryRegion::new(
                i * 0x2000,
                0x1000,
                MemoryRegionKind::Usable,
            ));
        }
        map.push(MemoryRegion::new(0, 0, MemoryRegionKind::Reserved));

        assert_eq!(map.regions().len(), MAX_MEMORY_REGIONS);
        assert_eq!(map.regions()[0].base, 0);
    }
}
