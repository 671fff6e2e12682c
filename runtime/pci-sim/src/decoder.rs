//! Command decoder
//!
//! Two-state machine behind the command and acknowledge registers:
//!
//! ```text
//!            sentinel @ REG_COMMAND
//!   Idle ─────────────────────────────▶ CommandIssued
//!    ▲                                       │
//!    └──────────── any @ REG_IRQ_ACK ────────┘
//! ```
//!
//! There is no queueing. A second sentinel while `CommandIssued` is accepted
//! and changes nothing.

use crate::regs::CMD_SENTINEL;

/// Decoder state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecoderState {
    #[default]
    Idle,
    CommandIssued,
}

/// What the interrupt line should do after a register write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEffect {
    None,
    Raise,
    Lower,
}

/// Command decoder with its pending-interrupt bit
#[derive(Debug, Default)]
pub struct CommandDecoder {
    state: DecoderState,
    /// Idle -> CommandIssued transitions seen so far
    assertions: u64,
    /// Non-sentinel command values that were dropped
    ignored: u64,
    last_command: Option<u32>,
}

impl CommandDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Pending-interrupt bit
    pub fn pending(&self) -> bool {
        self.state == DecoderState::CommandIssued
    }

    /// Number of times the pending bit went from clear to set
    pub fn assertions(&self) -> u64 {
        self.assertions
    }

    /// Number of command writes that were not the sentinel
    pub fn ignored(&self) -> u64 {
        self.ignored
    }

    /// Last value written to the command register
    pub fn last_command(&self) -> Option<u32> {
        self.last_command
    }

    /// Handle a write to the command register
    pub fn command(&mut self, value: u32) -> LineEffect {
        self.last_command = Some(value);

        if value != CMD_SENTINEL {
            self.ignored += 1;
            log::warn!("pci-sim: ignoring command value {:#010x}", value);
            return LineEffect::None;
        }

        match self.state {
            DecoderState::Idle => {
                log::info!("pci-sim: >>> secret command received <<<");
                self.state = DecoderState::CommandIssued;
                self.assertions += 1;
                LineEffect::Raise
            }
            DecoderState::CommandIssued => {
                log::debug!("pci-sim: command already pending, no new assertion");
                LineEffect::None
            }
        }
    }

    /// Handle a write to the acknowledge register
    pub fn acknowledge(&mut self) -> LineEffect {
        match self.state {
            DecoderState::CommandIssued => {
                self.state = DecoderState::Idle;
                LineEffect::Lower
            }
            DecoderState::Idle => LineEffect::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_asserts_once() {
        let mut decoder = CommandDecoder::new();
        assert_eq!(decoder.command(CMD_SENTINEL), LineEffect::Raise);
        assert_eq!(decoder.command(CMD_SENTINEL), LineEffect::None);

        assert!(decoder.pending());
        assert_eq!(decoder.assertions(), 1);
    }

    #[test]
    fn test_other_values_ignored() {
        let mut decoder = CommandDecoder::new();
        assert_eq!(decoder.command(!CMD_SENTINEL), LineEffect::None);
        assert_eq!(decoder.command(0), LineEffect::None);

        assert_eq!(decoder.state(), DecoderState::Idle);
        assert_eq!(decoder.ignored(), 2);
        assert_eq!(decoder.last_command(), Some(0));
    }

    #[test]
    fn test_acknowledge_returns_to_idle() {
        let mut decoder = CommandDecoder::new();
        decoder.command(CMD_SENTINEL);

        assert_eq!(decoder.acknowledge(), LineEffect::Lower);
        assert_eq!(decoder.state(), DecoderState::Idle);

        // Second ack is a no-op
        assert_eq!(decoder.acknowledge(), LineEffect::None);
        assert!(!decoder.pending());
    }

    #[test]
    fn test_reissue_after_ack() {
        let mut decoder = CommandDecoder::new();
        decoder.command(CMD_SENTINEL);
        decoder.acknowledge();
        assert_eq!(decoder.command(CMD_SENTINEL), LineEffect::Raise);
        assert_eq!(decoder.assertions(), 2);
    }
}
