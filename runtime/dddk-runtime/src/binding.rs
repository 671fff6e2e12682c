//! Per-device resource ownership
//!
//! A [`Binding`] is the only holder of a device's enable, mapping and
//! interrupt registration. Acquisition is ordered (enable, map, irq) and
//! release always runs in reverse, whether through [`Binding::release`],
//! an early `?` return during probe, or a plain drop.

use std::sync::Arc;

use cap_broker::{DeviceBroker, DeviceHandle, IrqRegistration, MappedRegion};
use pci_sim::{IrqFlags, IrqHandler};

use crate::mmio::MmioRegion;
use crate::{DriverError, Result};

pub struct Binding {
    broker: Arc<dyn DeviceBroker>,
    device: DeviceHandle,
    enabled: bool,
    mapping: Option<MappedRegion>,
    irq: Option<IrqRegistration>,
}

impl Binding {
    /// Enable `device` and start owning it
    ///
    /// # Errors
    /// The broker's `EnableFailed`; nothing is held on failure.
    pub fn enable(broker: Arc<dyn DeviceBroker>, device: DeviceHandle) -> Result<Self> {
        broker.enable(&device)?;
        log::debug!("{}: enabled", device.address);

        Ok(Self {
            broker,
            device,
            enabled: true,
            mapping: None,
            irq: None,
        })
    }

    /// Map BAR `bar` and return a register client for it
    ///
    /// # Panics
    /// If a BAR is already mapped through this binding.
    pub fn map_bar(&mut self, bar: u8) -> Result<MmioRegion> {
        assert!(self.mapping.is_none(), "{}: BAR already mapped", self.device.address);

        let region = self.broker.map(&self.device, bar)?;
        let client = MmioRegion::new(region.handle());
        self.mapping = Some(region);
        Ok(client)
    }

    /// Register the interrupt handler
    ///
    /// # Errors
    /// `NotMapped` when called before [`map_bar`](Self::map_bar), otherwise
    /// the broker's `RequestFailed`.
    pub fn request_irq(
        &mut self,
        flags: IrqFlags,
        name: &'static str,
        handler: IrqHandler,
    ) -> Result<()> {
        if self.mapping.is_none() {
            return Err(DriverError::NotMapped);
        }
        assert!(self.irq.is_none(), "{}: IRQ already registered", self.device.address);

        let registration = self.broker.request_irq(&self.device, flags, name, handler)?;
        self.irq = Some(registration);
        Ok(())
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// Register client for the mapped BAR, if any
    pub fn mmio(&self) -> Option<MmioRegion> {
        self.mapping.as_ref().map(|region| MmioRegion::new(region.handle()))
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn has_irq(&self) -> bool {
        self.irq.is_some()
    }

    /// Give everything back: irq, then mapping, then enable
    pub fn release(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(registration) = self.irq.take() {
            self.broker.free_irq(registration);
        }
        if let Some(region) = self.mapping.take() {
            self.broker.unmap(region);
        }
        if self.enabled {
            self.enabled = false;
            self.broker.disable(&self.device);
            log::debug!("{}: released", self.device.address);
        }
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.teardown();
    }
}
