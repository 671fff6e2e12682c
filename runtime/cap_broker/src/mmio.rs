//! MMIO Mapping - Memory-Mapped I/O region management
//!
//! This module hands out virtual ranges for device BARs from a fixed window
//! and routes accesses through those ranges to the physical bus.
//!
//! A [`MappedRegion`] is the single owner of a mapping and is consumed by
//! [`MmioMapper::unmap_region`]. Any number of [`MmioHandle`]s may point at
//! the same mapping; once it is unmapped every access through them panics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pci_sim::{AccessWidth, PciAddress, PhysBus};

use crate::{BrokerError, MapFailure, Result};

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// State shared by a mapping and its handles
struct MmioWindow {
    owner: PciAddress,
    vaddr: usize,
    paddr: u64,
    size: usize,
    live: AtomicBool,
    bus: Arc<dyn PhysBus>,
}

impl MmioWindow {
    fn check(&self, offset: usize, width: AccessWidth) {
        assert!(
            self.live.load(Ordering::Acquire),
            "MMIO access through unmapped window {:#x} ({})",
            self.vaddr,
            self.owner
        );
        assert!(
            offset
                .checked_add(width.bytes() as usize)
                .is_some_and(|end| end <= self.size),
            "MMIO offset {:#x} outside {:#x}-byte window",
            offset,
            self.size
        );
    }
}

/// Memory-mapped I/O region, owned by whoever mapped it
pub struct MappedRegion {
    window: Arc<MmioWindow>,
}

impl MappedRegion {
    /// Virtual address where region is mapped
    pub fn vaddr(&self) -> usize {
        self.window.vaddr
    }

    /// Physical address of the region
    pub fn paddr(&self) -> u64 {
        self.window.paddr
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.window.size
    }

    /// Device the region belongs to
    pub fn owner(&self) -> PciAddress {
        self.window.owner
    }

    /// Access handle that can be cloned into interrupt handlers
    pub fn handle(&self) -> MmioHandle {
        MmioHandle {
            window: Arc::clone(&self.window),
        }
    }
}

impl core::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("owner", &self.window.owner)
            .field("vaddr", &format_args!("{:#x}", self.window.vaddr))
            .field("paddr", &format_args!("{:#x}", self.window.paddr))
            .field("size", &self.window.size)
            .finish()
    }
}

/// Shared access path into a mapped region
#[derive(Clone)]
pub struct MmioHandle {
    window: Arc<MmioWindow>,
}

impl MmioHandle {
    /// Size of the window in bytes
    pub fn size(&self) -> usize {
        self.window.size
    }

    /// Whether the mapping behind this handle still exists
    pub fn is_live(&self) -> bool {
        self.window.live.load(Ordering::Acquire)
    }

    /// Read `width` bytes at `offset`
    ///
    /// # Panics
    /// If the region was unmapped or the access leaves the window.
    pub fn read(&self, offset: usize, width: AccessWidth) -> u64 {
        self.window.check(offset, width);
        self.window
            .bus
            .read(self.window.paddr + offset as u64, width)
    }

    /// Write `width` bytes at `offset`
    ///
    /// # Panics
    /// If the region was unmapped or the access leaves the window.
    pub fn write(&self, offset: usize, width: AccessWidth, value: u64) {
        self.window.check(offset, width);
        self.window
            .bus
            .write(self.window.paddr + offset as u64, width, value);
    }
}

/// MMIO mapper - hands out virtual ranges for device memory
pub struct MmioMapper {
    /// Base virtual address for MMIO region
    mmio_base: usize,

    /// Size of MMIO region
    mmio_size: usize,

    /// Free virtual ranges as `(vaddr, size)`, sorted and coalesced
    free: Vec<(usize, usize)>,
}

impl MmioMapper {
    /// Create a new MMIO mapper
    ///
    /// # Arguments
    /// * `base` - Base virtual address for MMIO mappings
    /// * `size` - Total size available for MMIO
    pub fn new(base: usize, size: usize) -> Self {
        let base = align_up(base);
        let size = align_down(size);
        Self {
            mmio_base: base,
            mmio_size: size,
            free: if size > 0 { vec![(base, size)] } else { Vec::new() },
        }
    }

    /// Map a physical MMIO region into virtual memory
    ///
    /// The in-page offset of `paddr` is preserved in the returned address.
    ///
    /// # Errors
    /// `MapFailed` with `WindowExhausted` if no free range is large enough.
    pub fn map_region(
        &mut self,
        owner: PciAddress,
        bar: u8,
        paddr: u64,
        size: usize,
        bus: Arc<dyn PhysBus>,
    ) -> Result<MappedRegion> {
        let start_offset = (paddr % PAGE_SIZE as u64) as usize;
        let aligned_size = pages_needed(size + start_offset) * PAGE_SIZE;

        let vaddr = self.reserve(aligned_size).ok_or(BrokerError::MapFailed {
            address: owner,
            bar,
            reason: MapFailure::WindowExhausted {
                requested: aligned_size,
            },
        })?;

        Ok(MappedRegion {
            window: Arc::new(MmioWindow {
                owner,
                vaddr: vaddr + start_offset,
                paddr,
                size,
                live: AtomicBool::new(true),
                bus,
            }),
        })
    }

    /// Unmap a previously mapped MMIO region
    ///
    /// Consumes the region; handles that outlive it panic on access.
    pub fn unmap_region(&mut self, region: MappedRegion) {
        let window = region.window;
        window.live.store(false, Ordering::Release);

        let start = align_down(window.vaddr);
        let len = pages_needed(window.size + (window.vaddr - start)) * PAGE_SIZE;
        self.release(start, len);
    }

    fn reserve(&mut self, size: usize) -> Option<usize> {
        let index = self.free.iter().position(|&(_, len)| len >= size)?;
        let (vaddr, len) = self.free[index];
        if len == size {
            self.free.remove(index);
        } else {
            self.free[index] = (vaddr + size, len - size);
        }
        Some(vaddr)
    }

    fn release(&mut self, vaddr: usize, size: usize) {
        let index = self.free.partition_point(|&(base, _)| base < vaddr);
        self.free.insert(index, (vaddr, size));

        // Merge with the following range, then with the preceding one
        if index + 1 < self.free.len() && vaddr + size == self.free[index + 1].0 {
            self.free[index].1 += self.free[index + 1].1;
            self.free.remove(index + 1);
        }
        if index > 0 && self.free[index - 1].0 + self.free[index - 1].1 == vaddr {
            self.free[index - 1].1 += self.free[index].1;
            self.free.remove(index);
        }
    }

    /// Get remaining virtual address space
    pub fn available_space(&self) -> usize {
        self.free.iter().map(|&(_, len)| len).sum()
    }

    /// Total size of the window
    pub fn window_size(&self) -> usize {
        self.mmio_size
    }

    /// Base of the window
    pub fn window_base(&self) -> usize {
        self.mmio_base
    }
}

/// Helper to calculate number of pages needed
pub fn pages_needed(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

/// Helper to align address down to page boundary
pub fn align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Helper to align address up to page boundary
pub fn align_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Helper to check if address is page-aligned
pub fn is_aligned(addr: usize) -> bool {
    addr % PAGE_SIZE == 0
}
