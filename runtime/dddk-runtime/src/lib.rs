//! DDDK Runtime - Runtime support for device driver development
//!
//! This crate provides the runtime types and traits drivers are written
//! against: error types, driver traits, the register client and the
//! resource binding that ties a driver instance to one device.

use std::sync::Arc;

use cap_broker::{BrokerError, DeviceBroker, DeviceHandle, PciDeviceId};
use thiserror::Error;

mod binding;
mod mmio;

pub use binding::Binding;
pub use mmio::MmioRegion;

/// Driver error types
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Identity mismatch: expected {expected:#010x}, found {found:#010x}")]
    IdentityMismatch { expected: u32, found: u32 },

    #[error("IRQ requested before the register window was mapped")]
    NotMapped,
}

pub type Result<T> = core::result::Result<T, DriverError>;

/// Trait for driver metadata
pub trait DriverMetadata {
    /// Devices this driver binds to
    fn id_table() -> &'static [PciDeviceId];

    /// Get the driver name
    fn driver_name() -> &'static str;

    /// Get driver version (default: "0.1.0")
    fn driver_version() -> &'static str {
        "0.1.0"
    }
}

/// Trait for driver lifecycle
pub trait Driver: DriverMetadata {
    /// Take ownership of `device` and bring it up
    fn probe(broker: Arc<dyn DeviceBroker>, device: DeviceHandle) -> Result<Self>
    where
        Self: Sized;

    /// Quiesce the device and give its resources back
    fn remove(self)
    where
        Self: Sized,
    {
    }
}

/// Probe `D` against every free device its ID table matches
///
/// Devices whose probe fails are logged and skipped.
///
/// # Errors
/// `NotFound` if no free device matches at all.
pub fn bind_all<D: Driver>(broker: &Arc<dyn DeviceBroker>) -> Result<Vec<D>> {
    log::info!("{} {}: registering", D::driver_name(), D::driver_version());

    let candidates: Vec<_> = broker
        .enumerate(D::id_table())
        .into_iter()
        .filter(|dev| !broker.is_enabled(dev))
        .collect();
    if candidates.is_empty() {
        return Err(BrokerError::NotFound.into());
    }

    let mut bound = Vec::with_capacity(candidates.len());
    for device in candidates {
        let address = device.address;
        match D::probe(Arc::clone(broker), device) {
            Ok(driver) => bound.push(driver),
            Err(err) => log::warn!("{}: probe of {} failed: {}", D::driver_name(), address, err),
        }
    }

    log::info!("{}: bound {} device(s)", D::driver_name(), bound.len());
    Ok(bound)
}
