//! my_pci - driver for the QEMU tutorial PCI function
//!
//! Binds to 1234:1111, checks the identity register, registers a shared
//! interrupt handler and sends the secret command once at probe time.
//!
//! QEMU's std VGA carries the same ids. It has no identity register, so it
//! reads back zero and is left bound in degraded mode without an interrupt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cap_broker::{DeviceBroker, DeviceHandle, PciDeviceId};
use dddk_runtime::{Binding, Driver, DriverError, DriverMetadata, MmioRegion, Result};
use pci_sim::{IrqFlags, IrqReturn};

/// Vendor ID of the tutorial function
pub const MY_VENDOR_ID: u16 = 0x1234;
/// Device ID of the tutorial function
pub const MY_DEVICE_ID: u16 = 0x1111;

/// Identity register (BAR0), read-only
const REG_MAGIC: usize = 0x00;
/// Command register, write-only
const REG_COMMAND: usize = 0x04;
/// Interrupt acknowledge register, write-only
const REG_IRQ_ACK: usize = 0x08;

/// Identity register value
const MAGIC: u32 = 0x1234_5678;

/// Commands
const CMD_SECRET: u32 = 0xCAFE_BABE;
const CMD_CLEAR: u32 = !CMD_SECRET;

pub const ID_TABLE: &[PciDeviceId] = &[PciDeviceId::new(MY_VENDOR_ID, MY_DEVICE_ID)];

/// Operating mode after probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Identity verified, interrupt registered
    Active,
    /// Wrong identity; bound but inert
    Degraded,
}

/// Counters shared with the interrupt handler
#[derive(Debug, Default)]
pub struct IrqStats {
    interrupts: AtomicU64,
}

impl IrqStats {
    /// Interrupts serviced so far
    pub fn interrupts(&self) -> u64 {
        self.interrupts.load(Ordering::SeqCst)
    }
}

/// One bound tutorial function
pub struct MyPciDevice {
    binding: Binding,
    regs: MmioRegion,
    mode: Mode,
    stats: Arc<IrqStats>,
}

impl DriverMetadata for MyPciDevice {
    fn id_table() -> &'static [PciDeviceId] {
        ID_TABLE
    }

    fn driver_name() -> &'static str {
        "my_pci"
    }
}

impl Driver for MyPciDevice {
    fn probe(broker: Arc<dyn DeviceBroker>, device: DeviceHandle) -> Result<Self> {
        log::info!("my_pci: probing {}", device);

        let mut binding = Binding::enable(broker, device)?;
        let regs = binding.map_bar(0)?;
        let stats = Arc::new(IrqStats::default());

        let magic = regs.read32(REG_MAGIC);
        log::info!("my_pci: magic value {:#010x}", magic);

        if magic != MAGIC {
            let mismatch = DriverError::IdentityMismatch {
                expected: MAGIC,
                found: magic,
            };
            log::warn!("my_pci: {} (VGA card?), staying inert", mismatch);
            return Ok(Self {
                binding,
                regs,
                mode: Mode::Degraded,
                stats,
            });
        }

        let handler_regs = regs.clone();
        let counters = Arc::clone(&stats);
        binding.request_irq(
            IrqFlags::SHARED,
            "my_pci",
            Box::new(move |line| {
                handler_regs.write32(REG_IRQ_ACK, 1);
                counters.interrupts.fetch_add(1, Ordering::SeqCst);
                log::info!("my_pci: interrupt on line {}", line);
                IrqReturn::Handled
            }),
        )?;

        regs.write32(REG_COMMAND, CMD_SECRET);

        Ok(Self {
            binding,
            regs,
            mode: Mode::Active,
            stats,
        })
    }

    fn remove(self) {
        log::info!("my_pci: removing {}", self.binding.device().address);
        self.binding.release();
    }
}

impl MyPciDevice {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn device(&self) -> &DeviceHandle {
        self.binding.device()
    }

    pub fn has_irq(&self) -> bool {
        self.binding.has_irq()
    }

    /// Handler counters; stays readable after the device is removed
    pub fn stats(&self) -> Arc<IrqStats> {
        Arc::clone(&self.stats)
    }

    /// Send the secret command (`true`) or its complement (`false`)
    ///
    /// A degraded device ignores the request.
    pub fn set_active(&self, on: bool) {
        if self.mode == Mode::Degraded {
            log::warn!("my_pci: {} is degraded, ignoring command", self.device().address);
            return;
        }

        let command = if on { CMD_SECRET } else { CMD_CLEAR };
        log::debug!("my_pci: command {:#010x}", command);
        self.regs.write32(REG_COMMAND, command);
    }
}
