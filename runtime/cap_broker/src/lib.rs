//! Capability Broker - Centralized device resource management for KaaL
//!
//! # Purpose
//! The Capability Broker hides bus-level detail from drivers by providing
//! high-level operations for device discovery, enabling, BAR mapping and
//! interrupt registration.
//!
//! # Integration Points
//! - Depends on: pci-sim (bus + interrupt controller)
//! - Provides to: dddk-runtime, drivers
//!
//! # Architecture
//! The broker owns the MMIO virtual window and the interrupt registrations.
//! Every resource it hands out is a move-only token (`MappedRegion`,
//! `IrqRegistration`) that must be given back to release it, and the broker
//! checks that per-device resources are returned in reverse order: irq,
//! then mapping, then enable.
//!
//! # Testing Strategy
//! - Unit tests: VA window allocation, IRQ bookkeeping, ID matching
//! - Integration tests: full acquire/release cycles against the simulator

use core::fmt;
use std::collections::BTreeMap;
use std::sync::Arc;

use pci_sim::{BusError, IrqError, IrqFlags, IrqHandler, PciAddress, PciBus, PhysBus};
use spin::Mutex;
use static_assertions::const_assert;
use thiserror::Error;

mod irq;
mod mmio;

pub use irq::{IrqAllocator, IrqInfo, IrqRegistration};
pub use mmio::{
    align_down, align_up, is_aligned, pages_needed, MappedRegion, MmioHandle, MmioMapper,
    PAGE_SIZE,
};

/// Default base of the virtual MMIO window
pub const DEFAULT_MMIO_WINDOW_BASE: usize = 0x8000_0000;

/// Default size of the virtual MMIO window (256MB)
pub const DEFAULT_MMIO_WINDOW_SIZE: usize = 256 * 1024 * 1024;

const_assert!(DEFAULT_MMIO_WINDOW_BASE % PAGE_SIZE == 0);
const_assert!(DEFAULT_MMIO_WINDOW_SIZE % PAGE_SIZE == 0);

/// Why a BAR could not be mapped
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapFailure {
    #[error("device not enabled")]
    NotEnabled,

    #[error("BAR not implemented")]
    NoSuchBar,

    #[error("no such device")]
    NoSuchDevice,

    #[error("MMIO window exhausted ({requested} bytes requested)")]
    WindowExhausted { requested: usize },
}

/// Error types for broker operations
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("No matching device found")]
    NotFound,

    #[error("Enable of {address} failed: {source}")]
    EnableFailed {
        address: PciAddress,
        #[source]
        source: BusError,
    },

    #[error("Map of BAR{bar} on {address} failed: {reason}")]
    MapFailed {
        address: PciAddress,
        bar: u8,
        reason: MapFailure,
    },

    #[error("Request for IRQ {line} failed: {source}")]
    RequestFailed {
        line: u32,
        #[source]
        source: IrqError,
    },

    #[error("Free of IRQ {line} failed: {source}")]
    FreeFailed {
        line: u32,
        #[source]
        source: IrqError,
    },
}

pub type Result<T> = core::result::Result<T, BrokerError>;

/// Wildcard value for PCI ID matching: matches any vendor/device ID.
pub const PCI_ANY_ID: u16 = 0xFFFF;

/// PCI device ID for driver-to-device matching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciDeviceId {
    /// Vendor ID (`PCI_ANY_ID` = wildcard)
    pub vendor: u16,
    /// Device ID (`PCI_ANY_ID` = wildcard)
    pub device: u16,
    /// Class code: `(class << 16) | (subclass << 8) | prog_if`
    pub class: u32,
    /// Mask applied to class before comparison (0 = ignore class)
    pub class_mask: u32,
}

impl PciDeviceId {
    /// Match a specific vendor/device pair
    pub const fn new(vendor: u16, device: u16) -> Self {
        Self {
            vendor,
            device,
            class: 0,
            class_mask: 0,
        }
    }

    /// Match any device of a class/subclass
    pub const fn with_class(class: u8, subclass: u8) -> Self {
        Self {
            vendor: PCI_ANY_ID,
            device: PCI_ANY_ID,
            class: ((class as u32) << 16) | ((subclass as u32) << 8),
            class_mask: 0xFF_FF00,
        }
    }

    /// Returns `true` if this entry matches `dev`
    pub fn matches(&self, dev: &DeviceHandle) -> bool {
        if self.vendor != PCI_ANY_ID && self.vendor != dev.vendor_id {
            return false;
        }
        if self.device != PCI_ANY_ID && self.device != dev.device_id {
            return false;
        }
        if self.class_mask != 0 && (dev.class & self.class_mask) != (self.class & self.class_mask) {
            return false;
        }
        true
    }
}

/// A discovered function, as seen by drivers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub address: PciAddress,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u32,
    pub irq_line: u32,
    pub name: String,
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:06x}] {:04x}:{:04x} {}",
            self.address, self.class, self.vendor_id, self.device_id, self.name
        )
    }
}

/// Resource operations a driver may ask for
///
/// All methods take `&self`: brokers are shared between drivers and
/// synchronize internally.
pub trait DeviceBroker: Send + Sync {
    /// Every function matching any entry of `ids`, in bus order
    fn enumerate(&self, ids: &[PciDeviceId]) -> Vec<DeviceHandle>;

    /// Whether some binder currently has `dev` enabled
    fn is_enabled(&self, dev: &DeviceHandle) -> bool;

    /// First matching function nobody has enabled yet
    ///
    /// # Errors
    /// `NotFound` if there is none.
    fn discover(&self, ids: &[PciDeviceId]) -> Result<DeviceHandle> {
        self.enumerate(ids)
            .into_iter()
            .find(|dev| !self.is_enabled(dev))
            .ok_or(BrokerError::NotFound)
    }

    /// Turn on memory decode and bus mastering
    fn enable(&self, dev: &DeviceHandle) -> Result<()>;

    /// Undo [`enable`](Self::enable)
    fn disable(&self, dev: &DeviceHandle);

    /// Map BAR `bar` of an enabled device
    fn map(&self, dev: &DeviceHandle, bar: u8) -> Result<MappedRegion>;

    /// Tear a mapping down; handles to it become unusable
    fn unmap(&self, region: MappedRegion);

    /// Attach `handler` to the device's interrupt line
    fn request_irq(
        &self,
        dev: &DeviceHandle,
        flags: IrqFlags,
        name: &'static str,
        handler: IrqHandler,
    ) -> Result<IrqRegistration>;

    /// Detach a handler and wait until it can no longer run
    fn free_irq(&self, registration: IrqRegistration);
}

/// Resource event, recorded in acquisition/release order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerEvent {
    Enabled(PciAddress),
    Mapped { owner: PciAddress, vaddr: usize },
    IrqRequested { owner: PciAddress, line: u32 },
    IrqFreed { owner: PciAddress, line: u32 },
    Unmapped { owner: PciAddress, vaddr: usize },
    Disabled(PciAddress),
}

/// Broker setup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerConfig {
    pub mmio_window_base: usize,
    pub mmio_window_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mmio_window_base: DEFAULT_MMIO_WINDOW_BASE,
            mmio_window_size: DEFAULT_MMIO_WINDOW_SIZE,
        }
    }
}

/// Resources a device currently holds through the broker
#[derive(Debug, Default, Clone, Copy)]
struct Holdings {
    mappings: usize,
    irqs: usize,
}

/// Broker backed by the simulated PCI bus
pub struct SimBroker {
    bus: Arc<PciBus>,
    mapper: Mutex<MmioMapper>,
    irqs: IrqAllocator,
    holdings: Mutex<BTreeMap<PciAddress, Holdings>>,
    journal: Mutex<Vec<BrokerEvent>>,
}

impl SimBroker {
    pub fn new(bus: Arc<PciBus>) -> Self {
        Self::with_config(bus, BrokerConfig::default())
    }

    pub fn with_config(bus: Arc<PciBus>, config: BrokerConfig) -> Self {
        let irqs = IrqAllocator::new(Arc::clone(bus.irq_controller()));
        Self {
            bus,
            mapper: Mutex::new(MmioMapper::new(config.mmio_window_base, config.mmio_window_size)),
            irqs,
            holdings: Mutex::new(BTreeMap::new()),
            journal: Mutex::new(Vec::new()),
        }
    }

    pub fn bus(&self) -> &Arc<PciBus> {
        &self.bus
    }

    /// Events so far, oldest first
    pub fn journal(&self) -> Vec<BrokerEvent> {
        self.journal.lock().clone()
    }

    /// Outstanding interrupt registrations
    pub fn registrations(&self) -> Vec<IrqInfo> {
        self.irqs.registrations()
    }

    /// Remaining virtual MMIO space
    pub fn available_mmio(&self) -> usize {
        self.mapper.lock().available_space()
    }

    fn record(&self, event: BrokerEvent) {
        log::trace!("broker: {:?}", event);
        self.journal.lock().push(event);
    }

    fn holdings(&self, address: PciAddress) -> Holdings {
        self.holdings.lock().get(&address).copied().unwrap_or_default()
    }

    fn update(&self, address: PciAddress, f: impl FnOnce(&mut Holdings)) {
        f(self.holdings.lock().entry(address).or_default());
    }

    fn handle_for(dev: &pci_sim::SimPciDevice) -> DeviceHandle {
        let spec = dev.spec();
        DeviceHandle {
            address: dev.address(),
            vendor_id: spec.vendor_id,
            device_id: spec.device_id,
            class: spec.class,
            irq_line: spec.irq_line,
            name: spec.name.clone(),
        }
    }
}

impl DeviceBroker for SimBroker {
    fn enumerate(&self, ids: &[PciDeviceId]) -> Vec<DeviceHandle> {
        self.bus
            .devices()
            .map(|dev| Self::handle_for(dev))
            .filter(|handle| ids.iter().any(|id| id.matches(handle)))
            .collect()
    }

    fn is_enabled(&self, dev: &DeviceHandle) -> bool {
        self.bus.device(dev.address).is_some_and(|d| d.is_enabled())
    }

    fn enable(&self, dev: &DeviceHandle) -> Result<()> {
        let device = self.bus.device(dev.address).ok_or(BrokerError::EnableFailed {
            address: dev.address,
            source: BusError::NoSuchDevice {
                address: dev.address,
            },
        })?;

        device.enable().map_err(|source| BrokerError::EnableFailed {
            address: dev.address,
            source,
        })?;

        self.record(BrokerEvent::Enabled(dev.address));
        Ok(())
    }

    fn disable(&self, dev: &DeviceHandle) {
        let held = self.holdings(dev.address);
        assert!(
            held.mappings == 0 && held.irqs == 0,
            "{} disabled while still holding {} mapping(s) and {} irq(s)",
            dev.address,
            held.mappings,
            held.irqs
        );

        if let Some(device) = self.bus.device(dev.address) {
            device.disable();
        }
        self.record(BrokerEvent::Disabled(dev.address));
    }

    fn map(&self, dev: &DeviceHandle, bar: u8) -> Result<MappedRegion> {
        let failed = |reason| BrokerError::MapFailed {
            address: dev.address,
            bar,
            reason,
        };

        let device = self
            .bus
            .device(dev.address)
            .ok_or_else(|| failed(MapFailure::NoSuchDevice))?;
        if !device.is_enabled() {
            return Err(failed(MapFailure::NotEnabled));
        }
        let window = device.bar(bar).ok_or_else(|| failed(MapFailure::NoSuchBar))?;

        let bus: Arc<dyn PhysBus> = self.bus.clone();
        let region = self.mapper.lock().map_region(
            dev.address,
            bar,
            window.base,
            window.size as usize,
            bus,
        )?;

        log::info!(
            "broker: {} BAR{} {:#x} mapped at {:#x}",
            dev.address,
            bar,
            window.base,
            region.vaddr()
        );
        self.update(dev.address, |h| h.mappings += 1);
        self.record(BrokerEvent::Mapped {
            owner: dev.address,
            vaddr: region.vaddr(),
        });
        Ok(region)
    }

    fn unmap(&self, region: MappedRegion) {
        let owner = region.owner();
        let vaddr = region.vaddr();
        assert!(
            self.holdings(owner).irqs == 0,
            "{} unmapped {:#x} while its irq is still registered",
            owner,
            vaddr
        );

        self.mapper.lock().unmap_region(region);
        self.update(owner, |h| h.mappings = h.mappings.saturating_sub(1));
        self.record(BrokerEvent::Unmapped { owner, vaddr });
    }

    fn request_irq(
        &self,
        dev: &DeviceHandle,
        flags: IrqFlags,
        name: &'static str,
        handler: IrqHandler,
    ) -> Result<IrqRegistration> {
        let registration = self
            .irqs
            .allocate(dev.address, dev.irq_line, flags, name, handler)?;

        self.update(dev.address, |h| h.irqs += 1);
        self.record(BrokerEvent::IrqRequested {
            owner: dev.address,
            line: dev.irq_line,
        });
        Ok(registration)
    }

    fn free_irq(&self, registration: IrqRegistration) {
        let owner = registration.owner();
        let line = registration.line();

        if let Err(err) = self.irqs.free(registration) {
            log::error!("broker: {}", err);
        }
        self.update(owner, |h| h.irqs = h.irqs.saturating_sub(1));
        self.record(BrokerEvent::IrqFreed { owner, line });
    }
}
