//! Simulated PCI function
//!
//! One function with a single 4 KiB memory BAR and an INTx line. The register
//! file sits behind its own lock, which is what serializes "the register
//! bus". The line level is updated under that lock, but handlers only run
//! after it is released, so a handler on the same thread can write the
//! acknowledge register.

use std::sync::Arc;

use bitflags::bitflags;
use spin::Mutex;

use crate::bus::{BusError, PciAddress};
use crate::decoder::{DecoderState, LineEffect};
use crate::irq::InterruptController;
use crate::register_file::RegisterFile;
use crate::regs::{AccessWidth, MAGIC, WINDOW_SIZE};

/// QEMU's vendor id, shared by the tutorial function and the std VGA
pub const VENDOR_QEMU: u16 = 0x1234;

/// Device id of the tutorial function
pub const DEVICE_MY_PCI: u16 = 0x1111;

/// "Other" class code (base class 0xff)
pub const CLASS_OTHERS: u32 = 0xFF_0000;

/// VGA-compatible display controller
pub const CLASS_DISPLAY_VGA: u32 = 0x03_0000;

bitflags! {
    /// Bits of the PCI command register the model cares about
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PciCommand: u16 {
        const IO_SPACE = 1 << 0;
        const MEMORY_SPACE = 1 << 1;
        const BUS_MASTER = 1 << 2;
        const INTX_DISABLE = 1 << 10;
    }
}

/// Description of a function to plug into the bus
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct DeviceSpec {
    pub name: String,
    #[cfg_attr(feature = "serde", serde(rename = "vendor"))]
    pub vendor_id: u16,
    #[cfg_attr(feature = "serde", serde(rename = "device"))]
    pub device_id: u16,
    #[cfg_attr(feature = "serde", serde(default = "default_class"))]
    pub class: u32,
    /// Value of the identity register; functions without one read zero
    #[cfg_attr(feature = "serde", serde(default))]
    pub magic: Option<u32>,
    #[cfg_attr(feature = "serde", serde(rename = "irq"))]
    pub irq_line: u32,
    /// Whether a command raises the interrupt line or is only logged
    #[cfg_attr(feature = "serde", serde(default))]
    pub interrupt_capable: bool,
}

#[cfg(feature = "serde")]
fn default_class() -> u32 {
    CLASS_OTHERS
}

impl DeviceSpec {
    /// The tutorial function: magic register plus an interrupt line
    pub fn my_pci_dev(irq_line: u32) -> Self {
        Self {
            name: "my-pci-dev".into(),
            vendor_id: VENDOR_QEMU,
            device_id: DEVICE_MY_PCI,
            class: CLASS_OTHERS,
            magic: Some(MAGIC),
            irq_line,
            interrupt_capable: true,
        }
    }

    /// The print-only variant: same registers, never raises its line
    pub fn my_pci_dev_polled(irq_line: u32) -> Self {
        Self {
            interrupt_capable: false,
            ..Self::my_pci_dev(irq_line)
        }
    }

    /// Std VGA: same 1234:1111 identity, no magic register
    pub fn std_vga(irq_line: u32) -> Self {
        Self {
            name: "VGA".into(),
            vendor_id: VENDOR_QEMU,
            device_id: DEVICE_MY_PCI,
            class: CLASS_DISPLAY_VGA,
            magic: None,
            irq_line,
            interrupt_capable: false,
        }
    }
}

/// Memory BAR placement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bar {
    pub base: u64,
    pub size: u64,
}

impl Bar {
    pub fn contains(&self, paddr: u64) -> bool {
        paddr >= self.base && paddr - self.base < self.size
    }
}

/// A realized function on the bus
pub struct SimPciDevice {
    address: PciAddress,
    spec: DeviceSpec,
    bar0: Bar,
    regs: Mutex<RegisterFile>,
    command: Mutex<PciCommand>,
    irq: Arc<InterruptController>,
}

impl SimPciDevice {
    pub(crate) fn realize(
        address: PciAddress,
        spec: DeviceSpec,
        bar_base: u64,
        irq: Arc<InterruptController>,
    ) -> Self {
        log::info!(
            "pci-sim: {} ({:04x}:{:04x}) plugged in at {}, BAR0 {:#x}",
            spec.name,
            spec.vendor_id,
            spec.device_id,
            address,
            bar_base
        );

        Self {
            address,
            regs: Mutex::new(RegisterFile::new(spec.magic.unwrap_or(0))),
            spec,
            bar0: Bar {
                base: bar_base,
                size: WINDOW_SIZE,
            },
            command: Mutex::new(PciCommand::empty()),
            irq,
        }
    }

    pub fn address(&self) -> PciAddress {
        self.address
    }

    pub fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    /// Memory BAR `index`; only BAR0 is implemented
    pub fn bar(&self, index: u8) -> Option<Bar> {
        (index == 0).then_some(self.bar0)
    }

    pub fn command(&self) -> PciCommand {
        *self.command.lock()
    }

    /// Turn on memory decode and bus mastering
    ///
    /// # Errors
    /// `AlreadyEnabled` if another binder already owns the function.
    pub fn enable(&self) -> Result<(), BusError> {
        let mut command = self.command.lock();
        if command.contains(PciCommand::MEMORY_SPACE) {
            return Err(BusError::AlreadyEnabled {
                address: self.address,
            });
        }
        *command |= PciCommand::MEMORY_SPACE | PciCommand::BUS_MASTER;
        log::debug!("pci-sim: {} enabled", self.address);
        Ok(())
    }

    /// Turn off decode and mastering
    pub fn disable(&self) {
        self.command
            .lock()
            .remove(PciCommand::MEMORY_SPACE | PciCommand::BUS_MASTER);
        log::debug!("pci-sim: {} disabled", self.address);
    }

    pub fn is_enabled(&self) -> bool {
        self.command().contains(PciCommand::MEMORY_SPACE)
    }

    /// Read from BAR0 at `offset`
    pub fn mmio_read(&self, offset: u64, width: AccessWidth) -> u64 {
        log::debug!("pci-sim: driver reads from {:#x}", offset);
        self.regs.lock().read(offset, width)
    }

    /// Write to BAR0 at `offset`
    pub fn mmio_write(&self, offset: u64, width: AccessWidth, value: u64) {
        log::debug!("pci-sim: driver writes {:#x} to {:#x}", value, offset);

        let raised = {
            let mut regs = self.regs.lock();
            let effect = regs.write(offset, width, value);
            // Line level changes under the register lock so it always agrees
            // with the pending bit
            self.drive_line(effect)
        };

        if raised {
            self.irq.deliver(self.spec.irq_line);
        }
    }

    fn drive_line(&self, effect: LineEffect) -> bool {
        if !self.spec.interrupt_capable {
            return false;
        }
        match effect {
            LineEffect::Raise if !self.command().contains(PciCommand::INTX_DISABLE) => {
                self.irq.assert_line(self.spec.irq_line, self.address);
                true
            }
            LineEffect::Lower => {
                self.irq.lower(self.spec.irq_line, self.address);
                false
            }
            _ => false,
        }
    }

    /// Pending-interrupt bit
    pub fn pending(&self) -> bool {
        self.regs.lock().decoder().pending()
    }

    pub fn decoder_state(&self) -> DecoderState {
        self.regs.lock().decoder().state()
    }

    /// Times the pending bit was set
    pub fn assertions(&self) -> u64 {
        self.regs.lock().decoder().assertions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irq::{IrqFlags, IrqReturn};
    use crate::regs::{CMD_SENTINEL, REG_COMMAND, REG_IRQ_ACK, REG_MAGIC};
    use std::sync::atomic::{AtomicU32, Ordering};

    const ADDR: PciAddress = PciAddress::new(0, 4, 0);

    fn device(spec: DeviceSpec) -> (Arc<InterruptController>, SimPciDevice) {
        let irq = Arc::new(InterruptController::new());
        let dev = SimPciDevice::realize(ADDR, spec, 0xFEBF_1000, Arc::clone(&irq));
        (irq, dev)
    }

    #[test]
    fn test_enable_is_exclusive() {
        let (_, dev) = device(DeviceSpec::my_pci_dev(11));
        dev.enable().unwrap();
        assert!(matches!(dev.enable(), Err(BusError::AlreadyEnabled { .. })));

        dev.disable();
        assert!(!dev.is_enabled());
        dev.enable().unwrap();
    }

    #[test]
    fn test_vga_has_no_magic() {
        let (_, dev) = device(DeviceSpec::std_vga(11));
        assert_eq!(dev.mmio_read(REG_MAGIC, AccessWidth::Dword), 0);
    }

    #[test]
    fn test_command_raises_line() {
        let (irq, dev) = device(DeviceSpec::my_pci_dev(11));
        dev.mmio_write(REG_COMMAND, AccessWidth::Dword, CMD_SENTINEL as u64);
        assert!(dev.pending());
        assert_eq!(dev.decoder_state(), DecoderState::CommandIssued);
        assert!(irq.is_asserted(11));

        dev.mmio_write(REG_IRQ_ACK, AccessWidth::Dword, 1);
        assert_eq!(dev.decoder_state(), DecoderState::Idle);
        assert!(!irq.is_asserted(11));
    }

    #[test]
    fn test_polled_variant_never_raises() {
        let (irq, dev) = device(DeviceSpec::my_pci_dev_polled(11));
        dev.mmio_write(REG_COMMAND, AccessWidth::Dword, CMD_SENTINEL as u64);
        assert!(dev.pending());
        assert!(!irq.is_asserted(11));
        assert_eq!(irq.stats(11).raised, 0);
    }

    #[test]
    fn test_handler_can_ack_from_interrupt_context() {
        let irq = Arc::new(InterruptController::new());
        let dev = Arc::new(SimPciDevice::realize(
            ADDR,
            DeviceSpec::my_pci_dev(11),
            0xFEBF_1000,
            Arc::clone(&irq),
        ));
        let hits = Arc::new(AtomicU32::new(0));

        let (d, h) = (Arc::clone(&dev), Arc::clone(&hits));
        irq.request_irq(
            11,
            IrqFlags::SHARED,
            "ack",
            Box::new(move |_| {
                d.mmio_write(REG_IRQ_ACK, AccessWidth::Dword, 1);
                h.fetch_add(1, Ordering::SeqCst);
                IrqReturn::Handled
            }),
        )
        .unwrap();

        dev.mmio_write(REG_COMMAND, AccessWidth::Dword, CMD_SENTINEL as u64);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!dev.pending());
        assert_eq!(irq.stats(11).storms, 0);
    }
}
