//! Control node - single-opener command surface for a bound device
//!
//! This is what the user-space tool talks to: open the node, issue one
//! control call, release it. Errors carry the errno the caller reports.

use core::mem::size_of;

use spin::Mutex;
use static_assertions::const_assert_eq;
use thiserror::Error;

use crate::my_pci::{Mode, MyPciDevice};

/// ioctl direction bits
const IOC_WRITE: u32 = 1;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = 8;
const IOC_SIZESHIFT: u32 = 16;
const IOC_DIRSHIFT: u32 = 30;

/// Encode a write ioctl number (`_IOW`)
pub const fn iow(ty: u8, nr: u8, size: usize) -> u32 {
    (IOC_WRITE << IOC_DIRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)
        | ((ty as u32) << IOC_TYPESHIFT)
        | ((nr as u32) << IOC_NRSHIFT)
}

/// Turn the device's action on (arg 1) or off (any other arg)
pub const IOCTL_SET_ACTIVE: u32 = iow(b'k', 1, size_of::<i32>());

const_assert_eq!(IOCTL_SET_ACTIVE, 0x4004_6b01);

/// errno values
pub const EIO: i32 = 5;
pub const EBADF: i32 = 9;
pub const EBUSY: i32 = 16;
pub const ENOTTY: i32 = 25;

/// Control node errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ControlError {
    #[error("device busy")]
    Busy,

    #[error("node not open")]
    NotOpen,

    #[error("inappropriate ioctl {0:#x}")]
    UnknownCommand(u32),

    #[error("I/O error")]
    Io,
}

impl ControlError {
    /// errno to report to the caller
    pub fn errno(self) -> i32 {
        match self {
            Self::Busy => EBUSY,
            Self::NotOpen => EBADF,
            Self::UnknownCommand(_) => ENOTTY,
            Self::Io => EIO,
        }
    }
}

/// Something a control call can switch on and off
pub trait CommandTarget: Send + Sync {
    fn set_active(&self, on: bool) -> Result<(), ControlError>;
}

impl CommandTarget for MyPciDevice {
    fn set_active(&self, on: bool) -> Result<(), ControlError> {
        if self.mode() == Mode::Degraded {
            return Err(ControlError::Io);
        }
        MyPciDevice::set_active(self, on);
        Ok(())
    }
}

/// Open state of the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    #[default]
    Closed,
    Open,
}

pub struct ControlNode<T> {
    name: &'static str,
    state: Mutex<NodeState>,
    target: T,
}

impl<T: CommandTarget> ControlNode<T> {
    pub fn new(name: &'static str, target: T) -> Self {
        log::info!("{}: control node ready", name);
        Self {
            name,
            state: Mutex::new(NodeState::Closed),
            target,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    /// Closed -> Open
    pub fn open(&self) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        match *state {
            NodeState::Open => Err(ControlError::Busy),
            NodeState::Closed => {
                *state = NodeState::Open;
                log::debug!("{}: opened", self.name);
                Ok(())
            }
        }
    }

    /// Open -> Closed
    pub fn release(&self) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        match *state {
            NodeState::Closed => Err(ControlError::NotOpen),
            NodeState::Open => {
                *state = NodeState::Closed;
                log::debug!("{}: released", self.name);
                Ok(())
            }
        }
    }

    /// Dispatch a control call
    pub fn ioctl(&self, cmd: u32, arg: i64) -> Result<(), ControlError> {
        if self.state() != NodeState::Open {
            return Err(ControlError::NotOpen);
        }

        match cmd {
            IOCTL_SET_ACTIVE => {
                log::info!("{}: set active {}", self.name, arg == 1);
                self.target.set_active(arg == 1)
            }
            _ => Err(ControlError::UnknownCommand(cmd)),
        }
    }

    /// Tear the node down and hand the target back
    pub fn into_inner(self) -> T {
        self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    /// Records the last request: 1 on, 0 off, -1 none yet
    #[derive(Default)]
    struct Recorder(AtomicI32);

    impl CommandTarget for Recorder {
        fn set_active(&self, on: bool) -> Result<(), ControlError> {
            self.0.store(on as i32, Ordering::SeqCst);
            Ok(())
        }
    }

    fn node() -> ControlNode<Recorder> {
        ControlNode::new("test", Recorder(AtomicI32::new(-1)))
    }

    #[test]
    fn test_ioctl_number() {
        assert_eq!(IOCTL_SET_ACTIVE, 0x4004_6b01);
        assert_eq!(iow(b'k', 2, 4), 0x4004_6b02);
    }

    #[test]
    fn test_single_opener() {
        let node = node();
        node.open().unwrap();
        assert_eq!(node.open(), Err(ControlError::Busy));
        assert_eq!(ControlError::Busy.errno(), EBUSY);

        node.release().unwrap();
        assert_eq!(node.release(), Err(ControlError::NotOpen));
        node.open().unwrap();
    }

    #[test]
    fn test_ioctl_dispatch() {
        let node = node();
        assert_eq!(node.ioctl(IOCTL_SET_ACTIVE, 1), Err(ControlError::NotOpen));

        node.open().unwrap();
        node.ioctl(IOCTL_SET_ACTIVE, 1).unwrap();
        assert_eq!(node.into_inner().0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_any_other_arg_deactivates() {
        let node = node();
        node.open().unwrap();
        node.ioctl(IOCTL_SET_ACTIVE, 7).unwrap();
        assert_eq!(node.target.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unknown_command() {
        let node = node();
        node.open().unwrap();

        let err = node.ioctl(0x4004_6b02, 1).unwrap_err();
        assert_eq!(err, ControlError::UnknownCommand(0x4004_6b02));
        assert_eq!(err.errno(), ENOTTY);
    }
}
