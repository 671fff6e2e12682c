//! PCI Simulator - Emulated PCI function for KaaL driver development
//!
//! # Purpose
//! Models the hardware side of a tiny PCI function so drivers can be probed,
//! exercised and torn down without a VM: a 4 KiB BAR0 register window, a
//! two-state command decoder and a level-triggered interrupt line.
//!
//! # Integration Points
//! - Depends on: nothing outside this crate
//! - Provides to: cap-broker (bus + interrupt controller), tests, kaal-pci
//!
//! # Architecture
//! ```text
//!   CPU side              PciBus (PhysBus)           SimPciDevice
//!   paddr access ───▶ route to enabled BAR ───▶ RegisterFile ─▶ CommandDecoder
//!                                                      │
//!                                InterruptController ◀─┘ raise / lower
//! ```
//!
//! # Testing Strategy
//! - Unit tests: decoder transitions, register dispatch, line delivery
//! - Property tests: register-file invariants (`tests/register_props.rs`)
//! - Integration tests: bus routing plus interrupt delivery

mod bus;
mod decoder;
mod device;
mod irq;
mod machine;
mod register_file;
mod regs;

pub use bus::{BusError, PciAddress, PciBus, PhysBus, DEFAULT_MMIO_APERTURE, MAX_SLOTS};
pub use decoder::{CommandDecoder, DecoderState, LineEffect};
pub use device::{
    Bar, DeviceSpec, PciCommand, SimPciDevice, CLASS_DISPLAY_VGA, CLASS_OTHERS, DEVICE_MY_PCI,
    VENDOR_QEMU,
};
pub use irq::{
    ActionToken, InterruptController, IrqError, IrqFlags, IrqHandler, IrqReturn, LineStats,
    DEFAULT_STORM_THRESHOLD,
};
pub use machine::{Machine, MachineBuilder, MY_PCI_IRQ, MY_PCI_SLOT, VGA_SLOT};
pub use register_file::RegisterFile;
pub use regs::{AccessWidth, CMD_SENTINEL, MAGIC, REG_COMMAND, REG_IRQ_ACK, REG_MAGIC, WINDOW_SIZE};
