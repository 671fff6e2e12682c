//! Machine description loading

use std::path::Path;

use anyhow::{Context, Result};
use cap_broker::{BrokerConfig, DEFAULT_MMIO_WINDOW_BASE, DEFAULT_MMIO_WINDOW_SIZE};
use pci_sim::{
    DeviceSpec, Machine, DEFAULT_MMIO_APERTURE, DEFAULT_STORM_THRESHOLD, MY_PCI_IRQ, MY_PCI_SLOT,
    VGA_SLOT,
};
use serde::Deserialize;

/// `[platform]` section
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlatformConfig {
    /// Physical base BARs are assigned from
    pub mmio_aperture: u64,
    /// Virtual window the broker maps BARs into
    pub mmio_window_base: usize,
    pub mmio_window_size: usize,
    /// Handler rounds before a stuck line is masked
    pub storm_threshold: u32,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            mmio_aperture: DEFAULT_MMIO_APERTURE,
            mmio_window_base: DEFAULT_MMIO_WINDOW_BASE,
            mmio_window_size: DEFAULT_MMIO_WINDOW_SIZE,
            storm_threshold: DEFAULT_STORM_THRESHOLD,
        }
    }
}

/// One `[[device]]` entry
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceEntry {
    pub slot: u8,
    #[serde(flatten)]
    pub spec: DeviceSpec,
}

/// Whole machine file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MachineConfig {
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceEntry>,
}

impl Default for MachineConfig {
    /// Std VGA at 00:02.0 plus my-pci-dev at 00:04.0, both on IRQ 11
    fn default() -> Self {
        Self {
            platform: PlatformConfig::default(),
            devices: vec![
                DeviceEntry {
                    slot: VGA_SLOT,
                    spec: DeviceSpec::std_vga(MY_PCI_IRQ),
                },
                DeviceEntry {
                    slot: MY_PCI_SLOT,
                    spec: DeviceSpec::my_pci_dev(MY_PCI_IRQ),
                },
            ],
        }
    }
}

impl MachineConfig {
    /// Load a machine file, or the built-in machine when `path` is `None`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        if config.devices.is_empty() {
            anyhow::bail!("machine has no [[device]] entries");
        }
        Ok(config)
    }

    /// Assemble the machine this file describes
    pub fn build(&self) -> Result<Machine> {
        let mut builder = Machine::builder()
            .aperture(self.platform.mmio_aperture)
            .storm_threshold(self.platform.storm_threshold);
        for entry in &self.devices {
            builder = builder.device(entry.slot, entry.spec.clone());
        }
        builder.build().context("Failed to assemble machine")
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            mmio_window_base: self.platform.mmio_window_base,
            mmio_window_size: self.platform.mmio_window_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pci_sim::{CLASS_OTHERS, MAGIC};

    #[test]
    fn test_parse_full_file() {
        let config = MachineConfig::parse(
            r#"
            [platform]
            mmio_aperture = 0xfe000000
            storm_threshold = 50

            [[device]]
            slot = 4
            name = "my-pci-dev"
            vendor = 0x1234
            device = 0x1111
            magic = 0x12345678
            irq = 11
            interrupt_capable = true
            "#,
        )
        .unwrap();

        assert_eq!(config.platform.mmio_aperture, 0xFE00_0000);
        assert_eq!(config.platform.storm_threshold, 50);
        assert_eq!(config.platform.mmio_window_base, DEFAULT_MMIO_WINDOW_BASE);

        let dev = &config.devices[0];
        assert_eq!(dev.slot, 4);
        assert_eq!(dev.spec, DeviceSpec::my_pci_dev(11));
        assert_eq!(dev.spec.magic, Some(MAGIC));
        assert_eq!(dev.spec.class, CLASS_OTHERS);
    }

    #[test]
    fn test_magic_and_interrupts_optional() {
        let config = MachineConfig::parse(
            r#"
            [[device]]
            slot = 2
            name = "VGA"
            vendor = 0x1234
            device = 0x1111
            class = 0x030000
            irq = 11
            "#,
        )
        .unwrap();

        assert_eq!(config.devices[0].spec, DeviceSpec::std_vga(11));
        assert_eq!(config.platform, PlatformConfig::default());
    }

    #[test]
    fn test_empty_machine_rejected() {
        assert!(MachineConfig::parse("[platform]\nstorm_threshold = 3\n").is_err());
    }

    #[test]
    fn test_shipped_file_matches_builtin() {
        let config = MachineConfig::parse(include_str!("../machine.toml")).unwrap();
        assert_eq!(config, MachineConfig::default());
    }

    #[test]
    fn test_default_machine_builds() {
        let machine = MachineConfig::default().build().unwrap();
        assert_eq!(machine.bus().devices().count(), 2);
    }
}
