//! IRQ Handling - Interrupt request management
//!
//! This module attaches driver handlers to the platform interrupt controller
//! and keeps track of which registrations are outstanding. A registration is
//! a move-only token: freeing it consumes it.

use std::sync::Arc;

use pci_sim::{ActionToken, InterruptController, IrqFlags, IrqHandler, PciAddress};
use spin::Mutex;

use crate::{BrokerError, Result};

/// A handler attached to an interrupt line
#[derive(Debug)]
pub struct IrqRegistration {
    owner: PciAddress,
    line: u32,
    name: &'static str,
    token: ActionToken,
}

impl IrqRegistration {
    /// Get IRQ number
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Device the handler was registered for
    pub fn owner(&self) -> PciAddress {
        self.owner
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Bookkeeping entry for an outstanding registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqInfo {
    pub owner: PciAddress,
    pub line: u32,
    pub name: &'static str,
    pub shared: bool,
}

/// IRQ allocator - manages handler registration on the controller
pub struct IrqAllocator {
    controller: Arc<InterruptController>,

    /// Registrations that have not been freed yet
    active: Mutex<Vec<(ActionToken, IrqInfo)>>,
}

impl IrqAllocator {
    /// Create a new IRQ allocator on top of `controller`
    pub fn new(controller: Arc<InterruptController>) -> Self {
        Self {
            controller,
            active: Mutex::new(Vec::new()),
        }
    }

    /// Register `handler` on `line` on behalf of `owner`
    ///
    /// # Errors
    /// `RequestFailed` if the controller refuses the registration, e.g. the
    /// line is held exclusively by someone else.
    pub fn allocate(
        &self,
        owner: PciAddress,
        line: u32,
        flags: IrqFlags,
        name: &'static str,
        handler: IrqHandler,
    ) -> Result<IrqRegistration> {
        let token = self
            .controller
            .request_irq(line, flags, name, handler)
            .map_err(|source| BrokerError::RequestFailed { line, source })?;

        self.active.lock().push((
            token,
            IrqInfo {
                owner,
                line,
                name,
                shared: flags.contains(IrqFlags::SHARED),
            },
        ));

        Ok(IrqRegistration {
            owner,
            line,
            name,
            token,
        })
    }

    /// Detach a handler; it is guaranteed not to run once this returns
    ///
    /// # Errors
    /// `FreeFailed` if the controller no longer knows the registration.
    pub fn free(&self, registration: IrqRegistration) -> Result<()> {
        self.active.lock().retain(|(token, _)| *token != registration.token);

        // Not under `active`: this waits for in-flight handlers
        self.controller
            .free_irq(registration.line, registration.token)
            .map_err(|source| BrokerError::FreeFailed {
                line: registration.line,
                source,
            })
    }

    /// Check whether `owner` holds any registration
    pub fn is_allocated(&self, owner: PciAddress) -> bool {
        self.active.lock().iter().any(|(_, info)| info.owner == owner)
    }

    /// Snapshot of outstanding registrations
    pub fn registrations(&self) -> Vec<IrqInfo> {
        self.active.lock().iter().map(|(_, info)| *info).collect()
    }

    pub fn controller(&self) -> &Arc<InterruptController> {
        &self.controller
    }
}
