//! BAR0 register file
//!
//! Offsets are dispatched through a small static table rather than a chain of
//! branches. Anything the table does not name is absorbed: reads return zero,
//! writes are dropped. Nothing here can fail, this is a memory bus.

use crate::decoder::{CommandDecoder, LineEffect};
use crate::regs::{AccessWidth, REG_COMMAND, REG_IRQ_ACK, REG_MAGIC};

type ReadFn = fn(&RegisterFile) -> u32;
type WriteFn = fn(&mut RegisterFile, u32) -> LineEffect;

/// One entry of the dispatch table
struct Register {
    offset: u64,
    name: &'static str,
    read: Option<ReadFn>,
    write: Option<WriteFn>,
}

static REGISTERS: [Register; 3] = [
    Register {
        offset: REG_MAGIC,
        name: "MAGIC",
        read: Some(read_magic),
        write: None,
    },
    Register {
        offset: REG_COMMAND,
        name: "COMMAND",
        read: None,
        write: Some(write_command),
    },
    Register {
        offset: REG_IRQ_ACK,
        name: "IRQ_ACK",
        read: None,
        write: Some(write_irq_ack),
    },
];

fn read_magic(regs: &RegisterFile) -> u32 {
    regs.identity
}

fn write_command(regs: &mut RegisterFile, value: u32) -> LineEffect {
    regs.decoder.command(value)
}

fn write_irq_ack(regs: &mut RegisterFile, _value: u32) -> LineEffect {
    regs.decoder.acknowledge()
}

fn lookup(offset: u64) -> Option<&'static Register> {
    REGISTERS.iter().find(|reg| reg.offset == offset)
}

/// Device-visible register state
#[derive(Debug)]
pub struct RegisterFile {
    identity: u32,
    decoder: CommandDecoder,
}

impl RegisterFile {
    /// Create a register file whose identity register reads `identity`
    pub fn new(identity: u32) -> Self {
        Self {
            identity,
            decoder: CommandDecoder::new(),
        }
    }

    /// Value of the identity register
    pub fn identity(&self) -> u32 {
        self.identity
    }

    /// Command decoder (and with it the pending-interrupt bit)
    pub fn decoder(&self) -> &CommandDecoder {
        &self.decoder
    }

    /// Read `width` bytes at `offset`
    ///
    /// 8-byte reads are split into two dword reads, low half first.
    pub fn read(&self, offset: u64, width: AccessWidth) -> u64 {
        if width == AccessWidth::Qword {
            let lo = self.read(offset, AccessWidth::Dword);
            let hi = self.read(offset.wrapping_add(4), AccessWidth::Dword);
            return lo | (hi << 32);
        }

        let value = match lookup(offset).and_then(|reg| reg.read) {
            Some(read) => u64::from(read(self)) & width.mask(),
            None => 0,
        };
        log::trace!("pci-sim: read  {:#05x} ({}B) -> {:#x}", offset, width.bytes(), value);
        value
    }

    /// Write `value` (`width` bytes) at `offset`
    ///
    /// Returns the change the interrupt line should see. For split 8-byte
    /// writes the later half decides.
    pub fn write(&mut self, offset: u64, width: AccessWidth, value: u64) -> LineEffect {
        if width == AccessWidth::Qword {
            let first = self.write(offset, AccessWidth::Dword, value & 0xFFFF_FFFF);
            let second = self.write(offset.wrapping_add(4), AccessWidth::Dword, value >> 32);
            return if second == LineEffect::None { first } else { second };
        }

        log::trace!("pci-sim: write {:#05x} ({}B) <- {:#x}", offset, width.bytes(), value);
        let value = (value & width.mask()) as u32;

        match lookup(offset) {
            Some(Register { write: Some(write), .. }) => write(self, value),
            Some(reg) => {
                log::debug!("pci-sim: write to read-only {} dropped", reg.name);
                LineEffect::None
            }
            None => LineEffect::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::DecoderState;
    use crate::regs::{CMD_SENTINEL, MAGIC, WINDOW_SIZE};

    #[test]
    fn test_magic_read() {
        let regs = RegisterFile::new(MAGIC);
        assert_eq!(regs.read(REG_MAGIC, AccessWidth::Dword), 0x1234_5678);
        assert_eq!(regs.read(REG_MAGIC, AccessWidth::Word), 0x5678);
        assert_eq!(regs.read(REG_MAGIC, AccessWidth::Byte), 0x78);
    }

    #[test]
    fn test_other_offsets_read_zero() {
        let regs = RegisterFile::new(MAGIC);
        assert_eq!(regs.read(REG_COMMAND, AccessWidth::Dword), 0);
        assert_eq!(regs.read(REG_IRQ_ACK, AccessWidth::Dword), 0);
        assert_eq!(regs.read(0x1, AccessWidth::Byte), 0);
        assert_eq!(regs.read(WINDOW_SIZE + 0x10, AccessWidth::Dword), 0);
    }

    #[test]
    fn test_qword_read_splits() {
        let regs = RegisterFile::new(MAGIC);
        assert_eq!(regs.read(REG_MAGIC, AccessWidth::Qword), MAGIC as u64);
    }

    #[test]
    fn test_command_and_ack() {
        let mut regs = RegisterFile::new(MAGIC);
        assert_eq!(
            regs.write(REG_COMMAND, AccessWidth::Dword, CMD_SENTINEL as u64),
            LineEffect::Raise
        );
        assert_eq!(regs.decoder().state(), DecoderState::CommandIssued);

        assert_eq!(regs.write(REG_IRQ_ACK, AccessWidth::Dword, 1), LineEffect::Lower);
        assert!(!regs.decoder().pending());
    }

    #[test]
    fn test_magic_is_read_only() {
        let mut regs = RegisterFile::new(MAGIC);
        assert_eq!(regs.write(REG_MAGIC, AccessWidth::Dword, 0), LineEffect::None);
        assert_eq!(regs.read(REG_MAGIC, AccessWidth::Dword), MAGIC as u64);
    }

    #[test]
    fn test_undefined_writes_absorbed() {
        let mut regs = RegisterFile::new(MAGIC);
        assert_eq!(regs.write(0x100, AccessWidth::Dword, CMD_SENTINEL as u64), LineEffect::None);
        assert_eq!(regs.write(WINDOW_SIZE * 2, AccessWidth::Dword, 1), LineEffect::None);
        assert!(!regs.decoder().pending());
    }

    #[test]
    fn test_narrow_command_write_never_matches() {
        let mut regs = RegisterFile::new(MAGIC);
        regs.write(REG_COMMAND, AccessWidth::Word, CMD_SENTINEL as u64);
        assert!(!regs.decoder().pending());
        assert_eq!(regs.decoder().last_command(), Some(0xBABE));
    }

    #[test]
    fn test_qword_command_then_ack_lowers() {
        let mut regs = RegisterFile::new(MAGIC);
        let value = (1u64 << 32) | CMD_SENTINEL as u64;
        assert_eq!(regs.write(REG_COMMAND, AccessWidth::Qword, value), LineEffect::Lower);
        assert_eq!(regs.decoder().assertions(), 1);
        assert!(!regs.decoder().pending());
    }
}
