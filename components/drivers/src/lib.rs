//! KaaL drivers
//!
//! - `my_pci`: driver for the QEMU tutorial PCI function (1234:1111)
//! - `control`: single-opener control node that forwards commands to a
//!   bound device

pub mod control;
pub mod my_pci;

pub use control::{CommandTarget, ControlError, ControlNode, NodeState, IOCTL_SET_ACTIVE};
pub use my_pci::{IrqStats, Mode, MyPciDevice, ID_TABLE, MY_DEVICE_ID, MY_VENDOR_ID};
