//! Machine assembly
//!
//! Wires an interrupt controller and a bus together and plugs functions in.

use std::sync::Arc;

use crate::bus::{BusError, PciBus, DEFAULT_MMIO_APERTURE};
use crate::device::DeviceSpec;
use crate::irq::{InterruptController, DEFAULT_STORM_THRESHOLD};

/// Slot the std VGA function occupies on a default QEMU machine
pub const VGA_SLOT: u8 = 2;

/// Slot the tutorial function is plugged into
pub const MY_PCI_SLOT: u8 = 4;

/// Interrupt line of the tutorial function
pub const MY_PCI_IRQ: u32 = 11;

/// A built machine
pub struct Machine {
    bus: Arc<PciBus>,
}

impl Machine {
    pub fn builder() -> MachineBuilder {
        MachineBuilder::default()
    }

    /// VGA at 00:02.0 and the tutorial function at 00:04.0 on IRQ 11
    pub fn tutorial() -> Result<Self, BusError> {
        Self::builder()
            .device(VGA_SLOT, DeviceSpec::std_vga(MY_PCI_IRQ))
            .device(MY_PCI_SLOT, DeviceSpec::my_pci_dev(MY_PCI_IRQ))
            .build()
    }

    pub fn bus(&self) -> &Arc<PciBus> {
        &self.bus
    }

    pub fn irq(&self) -> &Arc<InterruptController> {
        self.bus.irq_controller()
    }
}

/// Builder for [`Machine`]
#[derive(Debug, Clone)]
pub struct MachineBuilder {
    aperture: u64,
    storm_threshold: u32,
    devices: Vec<(u8, DeviceSpec)>,
}

impl Default for MachineBuilder {
    fn default() -> Self {
        Self {
            aperture: DEFAULT_MMIO_APERTURE,
            storm_threshold: DEFAULT_STORM_THRESHOLD,
            devices: Vec::new(),
        }
    }
}

impl MachineBuilder {
    pub fn aperture(mut self, base: u64) -> Self {
        self.aperture = base;
        self
    }

    pub fn storm_threshold(mut self, rounds: u32) -> Self {
        self.storm_threshold = rounds;
        self
    }

    pub fn device(mut self, slot: u8, spec: DeviceSpec) -> Self {
        self.devices.push((slot, spec));
        self
    }

    pub fn build(self) -> Result<Machine, BusError> {
        let irq = Arc::new(InterruptController::with_storm_threshold(self.storm_threshold));
        let mut bus = PciBus::with_aperture(irq, self.aperture);
        for (slot, spec) in self.devices {
            bus.attach(slot, spec)?;
        }
        Ok(Machine { bus: Arc::new(bus) })
    }
}
