//! Register layout of the simulated function
//!
//! This is the wire contract between the device model and any driver that
//! maps BAR0. All registers are 32 bits wide and naturally aligned.

use static_assertions::const_assert;

/// Size of the BAR0 register window in bytes
pub const WINDOW_SIZE: u64 = 4096;

/// Identity ("magic") register - read-only
pub const REG_MAGIC: u64 = 0x00;

/// Command register - write-only
pub const REG_COMMAND: u64 = 0x04;

/// Interrupt acknowledge register - write-only, any value clears the line
pub const REG_IRQ_ACK: u64 = 0x08;

/// Value returned by `REG_MAGIC` on the interrupt-capable function
pub const MAGIC: u32 = 0x1234_5678;

/// Command value that triggers the device's action
pub const CMD_SENTINEL: u32 = 0xCAFE_BABE;

const_assert!(REG_IRQ_ACK + 4 <= WINDOW_SIZE);
const_assert!(WINDOW_SIZE.is_power_of_two());

/// Width of a single bus access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessWidth {
    Byte,
    Word,
    Dword,
    Qword,
}

impl AccessWidth {
    /// Access size in bytes
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
            Self::Qword => 8,
        }
    }

    /// Mask covering the bits carried by an access of this width
    pub const fn mask(self) -> u64 {
        match self {
            Self::Byte => 0xFF,
            Self::Word => 0xFFFF,
            Self::Dword => 0xFFFF_FFFF,
            Self::Qword => u64::MAX,
        }
    }

    /// Map a byte count to a width, if it is one the bus supports
    pub const fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            1 => Some(Self::Byte),
            2 => Some(Self::Word),
            4 => Some(Self::Dword),
            8 => Some(Self::Qword),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_width() {
        assert_eq!(AccessWidth::from_bytes(4), Some(AccessWidth::Dword));
        assert_eq!(AccessWidth::from_bytes(3), None);
        assert_eq!(AccessWidth::from_bytes(16), None);
    }

    #[test]
    fn test_width_mask() {
        assert_eq!(MAGIC as u64 & AccessWidth::Byte.mask(), 0x78);
        assert_eq!(MAGIC as u64 & AccessWidth::Word.mask(), 0x5678);
    }
}
