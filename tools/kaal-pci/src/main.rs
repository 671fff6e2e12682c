//! kaal-pci - drive the simulated tutorial PCI function from the command line
//!
//! Commands:
//! - `kaal-pci lspci` - List functions on the simulated bus
//! - `kaal-pci probe` - Bind my_pci to every matching function, report, unbind
//! - `kaal-pci set <value>` - Issue the set-active control call (1 = on)

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

use cap_broker::{DeviceBroker, SimBroker};
use dddk_runtime::{bind_all, Driver};
use kaal_drivers::control::{ControlNode, IOCTL_SET_ACTIVE};
use kaal_drivers::my_pci::{Mode, MyPciDevice};
use pci_sim::Machine;

use crate::config::MachineConfig;

#[derive(Parser)]
#[command(name = "kaal-pci")]
#[command(author = "KaaL Team")]
#[command(version)]
#[command(about = "KaaL - simulated PCI driver playground", long_about = None)]
struct Cli {
    /// Machine description (TOML); the built-in tutorial machine if omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List functions on the bus
    Lspci,

    /// Bind, report, unbind
    Probe,

    /// Send the set-active control call to the bound device
    Set {
        /// 1 turns the device's action on, anything else turns it off
        #[arg(allow_negative_numbers = true)]
        value: i64,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = MachineConfig::load(cli.config.as_deref())?;
    let machine = config.build()?;

    match cli.command {
        Commands::Lspci => lspci(&machine),
        Commands::Probe => probe(&machine, &config)?,
        Commands::Set { value } => set(&machine, &config, value)?,
    }

    Ok(())
}

fn broker_for(machine: &Machine, config: &MachineConfig) -> Arc<dyn DeviceBroker> {
    Arc::new(SimBroker::with_config(
        Arc::clone(machine.bus()),
        config.broker_config(),
    ))
}

fn lspci(machine: &Machine) {
    for dev in machine.bus().devices() {
        let spec = dev.spec();
        println!(
            "{} [{:06x}] {:04x}:{:04x} {}",
            dev.address().to_string().bold(),
            spec.class,
            spec.vendor_id,
            spec.device_id,
            spec.name.cyan()
        );
        if let Some(bar) = dev.bar(0) {
            println!("    BAR0: {:#x} ({} bytes)", bar.base, bar.size);
        }
        println!("    IRQ:  {}", spec.irq_line);
        let state = if dev.is_enabled() {
            "enabled".green()
        } else {
            "disabled".dimmed()
        };
        println!("    {}", state);
    }
}

fn probe(machine: &Machine, config: &MachineConfig) -> Result<()> {
    let broker = broker_for(machine, config);
    let drivers = bind_all::<MyPciDevice>(&broker).context("No my_pci function to bind")?;

    println!("{} Bound {} function(s)", "🔌".green(), drivers.len());
    for dev in &drivers {
        let mode = match dev.mode() {
            Mode::Active => "active".green(),
            Mode::Degraded => "degraded".yellow(),
        };
        println!(
            "  {} {} - interrupts: {}",
            dev.device().address.to_string().bold(),
            mode,
            dev.stats().interrupts()
        );
    }

    report_lines(machine);

    for dev in drivers {
        dev.remove();
    }
    println!("{} Unbound", "✓".green());
    Ok(())
}

fn set(machine: &Machine, config: &MachineConfig, value: i64) -> Result<()> {
    let broker = broker_for(machine, config);
    let drivers = bind_all::<MyPciDevice>(&broker).context("No my_pci function to bind")?;

    let (mut active, rest): (Vec<_>, Vec<_>) =
        drivers.into_iter().partition(|d| d.mode() == Mode::Active);
    for dev in rest {
        dev.remove();
    }
    if active.is_empty() {
        anyhow::bail!("No function passed the identity check");
    }
    let dev = active.remove(0);
    for other in active {
        other.remove();
    }

    let stats = dev.stats();
    let node = ControlNode::new("my_pci", dev);

    let outcome = node.open().and_then(|()| {
        let result = node.ioctl(IOCTL_SET_ACTIVE, value);
        node.release().and(result)
    });
    node.into_inner().remove();

    outcome.map_err(|e| anyhow::anyhow!("ioctl failed: {} (errno {})", e, e.errno()))?;

    println!(
        "{} set active {} - interrupts serviced: {}",
        "✓".green(),
        value == 1,
        stats.interrupts()
    );
    report_lines(machine);
    Ok(())
}

fn report_lines(machine: &Machine) {
    let mut lines: Vec<u32> = machine.bus().devices().map(|d| d.spec().irq_line).collect();
    lines.sort_unstable();
    lines.dedup();

    for line in lines {
        let stats = machine.irq().stats(line);
        println!(
            "  IRQ {}: raised {}, dispatched {}, handled {}, unhandled {}, storms {}",
            line, stats.raised, stats.dispatched, stats.handled, stats.unhandled, stats.storms
        );
    }
}
