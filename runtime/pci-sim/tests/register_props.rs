//! Property tests for the BAR0 register file

use pci_sim::{
    AccessWidth, LineEffect, RegisterFile, CMD_SENTINEL, MAGIC, REG_COMMAND, REG_IRQ_ACK,
    REG_MAGIC, WINDOW_SIZE,
};
use proptest::prelude::*;

fn width() -> impl Strategy<Value = AccessWidth> {
    prop_oneof![
        Just(AccessWidth::Byte),
        Just(AccessWidth::Word),
        Just(AccessWidth::Dword),
        Just(AccessWidth::Qword),
    ]
}

#[derive(Debug, Clone)]
struct Write {
    offset: u64,
    width: AccessWidth,
    value: u64,
}

fn write_op() -> impl Strategy<Value = Write> {
    (0..WINDOW_SIZE * 2, width(), any::<u64>()).prop_map(|(offset, width, value)| Write {
        offset,
        width,
        value,
    })
}

proptest! {
    #[test]
    fn identity_survives_any_writes(writes in prop::collection::vec(write_op(), 0..64)) {
        let mut regs = RegisterFile::new(MAGIC);
        for w in &writes {
            regs.write(w.offset, w.width, w.value);
        }
        prop_assert_eq!(regs.read(REG_MAGIC, AccessWidth::Dword), MAGIC as u64);
    }

    #[test]
    fn repeated_sentinel_asserts_once(repeats in 1usize..16) {
        let mut regs = RegisterFile::new(MAGIC);
        let mut raises = 0;
        for _ in 0..repeats {
            if regs.write(REG_COMMAND, AccessWidth::Dword, CMD_SENTINEL as u64) == LineEffect::Raise {
                raises += 1;
            }
        }
        prop_assert_eq!(raises, 1);
        prop_assert_eq!(regs.decoder().assertions(), 1);
        prop_assert!(regs.decoder().pending());
    }

    #[test]
    fn ack_clears_and_second_ack_is_noop(first in any::<u32>(), second in any::<u32>()) {
        let mut regs = RegisterFile::new(MAGIC);
        regs.write(REG_COMMAND, AccessWidth::Dword, CMD_SENTINEL as u64);

        prop_assert_eq!(regs.write(REG_IRQ_ACK, AccessWidth::Dword, first as u64), LineEffect::Lower);
        prop_assert!(!regs.decoder().pending());

        prop_assert_eq!(regs.write(REG_IRQ_ACK, AccessWidth::Dword, second as u64), LineEffect::None);
        prop_assert!(!regs.decoder().pending());
    }

    #[test]
    fn reads_outside_magic_are_zero(offset in 1..WINDOW_SIZE, width in width()) {
        let regs = RegisterFile::new(MAGIC);
        prop_assert_eq!(regs.read(offset, width), 0);
    }
}
