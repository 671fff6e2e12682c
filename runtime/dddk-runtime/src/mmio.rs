//! Register client over a mapped BAR

use cap_broker::MmioHandle;
use pci_sim::AccessWidth;

/// MMIO register accessor
///
/// Cheap to clone; clones share the underlying mapping and become unusable
/// together when it is unmapped.
#[derive(Clone)]
pub struct MmioRegion {
    handle: MmioHandle,
}

impl MmioRegion {
    pub fn new(handle: MmioHandle) -> Self {
        Self { handle }
    }

    fn check(&self, offset: usize, width: usize) {
        assert!(
            offset % width == 0,
            "unaligned {}-byte MMIO access at {:#x}",
            width,
            offset
        );
        assert!(
            offset + width <= self.handle.size(),
            "MMIO offset {:#x} outside {:#x}-byte region",
            offset,
            self.handle.size()
        );
    }

    /// Read a 32-bit value from offset
    ///
    /// # Panics
    /// On an unaligned or out-of-range offset, or if the region was unmapped.
    pub fn read32(&self, offset: usize) -> u32 {
        self.check(offset, 4);
        self.handle.read(offset, AccessWidth::Dword) as u32
    }

    /// Write a 32-bit value to offset
    ///
    /// # Panics
    /// On an unaligned or out-of-range offset, or if the region was unmapped.
    pub fn write32(&self, offset: usize, value: u32) {
        self.check(offset, 4);
        self.handle.write(offset, AccessWidth::Dword, u64::from(value));
    }

    /// Read a 16-bit value from offset
    pub fn read16(&self, offset: usize) -> u16 {
        self.check(offset, 2);
        self.handle.read(offset, AccessWidth::Word) as u16
    }

    /// Read an 8-bit value from offset
    pub fn read8(&self, offset: usize) -> u8 {
        self.check(offset, 1);
        self.handle.read(offset, AccessWidth::Byte) as u8
    }

    /// Get size
    pub fn size(&self) -> usize {
        self.handle.size()
    }

    /// Whether the mapping is still in place
    pub fn is_mapped(&self) -> bool {
        self.handle.is_live()
    }
}
