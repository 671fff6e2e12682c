//! PCI bus: slots, BAR placement and physical address routing

use core::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::device::{DeviceSpec, SimPciDevice};
use crate::irq::InterruptController;
use crate::regs::{AccessWidth, WINDOW_SIZE};

/// Default base of the MMIO aperture BARs are carved from
pub const DEFAULT_MMIO_APERTURE: u64 = 0xFEBF_0000;

/// Slots per bus
pub const MAX_SLOTS: u8 = 32;

/// Bus/device/function triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// Bus errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("{address}: already enabled by another driver")]
    AlreadyEnabled { address: PciAddress },

    #[error("no device at {address}")]
    NoSuchDevice { address: PciAddress },

    #[error("slot {address} already occupied")]
    SlotOccupied { address: PciAddress },

    #[error("slot {slot} out of range")]
    InvalidSlot { slot: u8 },

    #[error("MMIO aperture exhausted")]
    ApertureExhausted,
}

/// Physical memory bus as seen from the CPU side
///
/// Accesses that no enabled BAR claims behave like a master abort: reads
/// return all-ones, writes are dropped.
pub trait PhysBus: Send + Sync {
    fn read(&self, paddr: u64, width: AccessWidth) -> u64;
    fn write(&self, paddr: u64, width: AccessWidth, value: u64);
}

/// Bus 0 of the simulated machine
pub struct PciBus {
    /// Kept sorted by address
    devices: Vec<Arc<SimPciDevice>>,
    irq: Arc<InterruptController>,
    next_bar: u64,
}

impl PciBus {
    pub fn new(irq: Arc<InterruptController>) -> Self {
        Self::with_aperture(irq, DEFAULT_MMIO_APERTURE)
    }

    /// Create a bus whose BARs are allocated upwards from `aperture`
    pub fn with_aperture(irq: Arc<InterruptController>, aperture: u64) -> Self {
        Self {
            devices: Vec::new(),
            irq,
            next_bar: aperture.next_multiple_of(WINDOW_SIZE),
        }
    }

    /// Plug a function into `slot` and assign its BAR0
    pub fn attach(&mut self, slot: u8, spec: DeviceSpec) -> Result<PciAddress, BusError> {
        if slot >= MAX_SLOTS {
            return Err(BusError::InvalidSlot { slot });
        }
        let address = PciAddress::new(0, slot, 0);
        let index = match self.devices.binary_search_by_key(&address, |d| d.address()) {
            Ok(_) => return Err(BusError::SlotOccupied { address }),
            Err(index) => index,
        };

        let base = self.next_bar;
        self.next_bar = base
            .checked_add(WINDOW_SIZE)
            .ok_or(BusError::ApertureExhausted)?;

        let device = SimPciDevice::realize(address, spec, base, Arc::clone(&self.irq));
        self.devices.insert(index, Arc::new(device));
        Ok(address)
    }

    /// Functions in address order
    pub fn devices(&self) -> impl Iterator<Item = &Arc<SimPciDevice>> {
        self.devices.iter()
    }

    pub fn device(&self, address: PciAddress) -> Option<&Arc<SimPciDevice>> {
        self.devices.iter().find(|d| d.address() == address)
    }

    pub fn irq_controller(&self) -> &Arc<InterruptController> {
        &self.irq
    }

    fn route(&self, paddr: u64) -> Option<(&SimPciDevice, u64)> {
        self.devices.iter().find_map(|dev| {
            let bar = dev.bar(0)?;
            (dev.is_enabled() && bar.contains(paddr)).then(|| (dev.as_ref(), paddr - bar.base))
        })
    }
}

impl PhysBus for PciBus {
    fn read(&self, paddr: u64, width: AccessWidth) -> u64 {
        match self.route(paddr) {
            Some((dev, offset)) => dev.mmio_read(offset, width),
            None => {
                log::trace!("pci-bus: master abort reading {:#x}", paddr);
                width.mask()
            }
        }
    }

    fn write(&self, paddr: u64, width: AccessWidth, value: u64) {
        match self.route(paddr) {
            Some((dev, offset)) => dev.mmio_write(offset, width, value),
            None => log::trace!("pci-bus: master abort writing {:#x}", paddr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::{MAGIC, REG_MAGIC};

    fn bus() -> PciBus {
        PciBus::new(Arc::new(InterruptController::new()))
    }

    #[test]
    fn test_address_display() {
        assert_eq!(PciAddress::new(0, 4, 0).to_string(), "00:04.0");
        assert_eq!(PciAddress::new(1, 0x1f, 7).to_string(), "01:1f.7");
    }

    #[test]
    fn test_devices_sorted_and_bars_disjoint() {
        let mut bus = bus();
        bus.attach(4, DeviceSpec::my_pci_dev(11)).unwrap();
        bus.attach(2, DeviceSpec::std_vga(10)).unwrap();

        let addrs: Vec<_> = bus.devices().map(|d| d.address().device).collect();
        assert_eq!(addrs, [2, 4]);

        let bars: Vec<_> = bus.devices().filter_map(|d| d.bar(0)).collect();
        assert!(bars[0].base + bars[0].size <= bars[1].base || bars[1].base + bars[1].size <= bars[0].base);
    }

    #[test]
    fn test_slot_occupied() {
        let mut bus = bus();
        bus.attach(4, DeviceSpec::my_pci_dev(11)).unwrap();
        assert_eq!(
            bus.attach(4, DeviceSpec::std_vga(11)),
            Err(BusError::SlotOccupied {
                address: PciAddress::new(0, 4, 0)
            })
        );
        assert_eq!(
            bus.attach(MAX_SLOTS, DeviceSpec::std_vga(11)),
            Err(BusError::InvalidSlot { slot: MAX_SLOTS })
        );
    }

    #[test]
    fn test_decode_requires_enable() {
        let mut bus = bus();
        let addr = bus.attach(4, DeviceSpec::my_pci_dev(11)).unwrap();
        let dev = Arc::clone(bus.device(addr).unwrap());
        let base = dev.bar(0).unwrap().base;

        assert_eq!(bus.read(base + REG_MAGIC, AccessWidth::Dword), 0xFFFF_FFFF);

        dev.enable().unwrap();
        assert_eq!(bus.read(base + REG_MAGIC, AccessWidth::Dword), MAGIC as u64);

        dev.disable();
        assert_eq!(bus.read(base + REG_MAGIC, AccessWidth::Byte), 0xFF);
    }
}
