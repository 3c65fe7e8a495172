use std::path::PathBuf;
use std::sync::mpsc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use plc_gateway::{shared, Gateway, GatewayConfig, Role, SharedDriver};

/// Bridges PLC data blocks to TCP clients.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long, default_value = "gateway.yaml")]
    config: PathBuf,

    /// Print a sample configuration and exit
    #[arg(long)]
    print_sample: bool,
}

fn main() -> Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    let args = Args::parse();

    if args.print_sample {
        print!("{}", GatewayConfig::sample().to_yaml()?);
        return Ok(());
    }

    let config = GatewayConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    config.validate().context("Invalid configuration")?;

    let driver = match config.role {
        Role::Server => Some(build_driver(&config)),
        Role::Client => None,
    };
    let mut gateway = Gateway::from_config(&config, driver).context("Failed to build gateway")?;
    gateway.start().context("Failed to start gateway")?;
    if let Some(addr) = gateway.local_addr() {
        info!("Listening on {}", addr);
    }

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    info!("Running as {}, press Ctrl-C to stop", config.role);
    let _ = stop_rx.recv();
    info!("Shutting down");
    gateway.stop();
    Ok(())
}

#[cfg(feature = "s7")]
fn build_driver(config: &GatewayConfig) -> SharedDriver {
    info!(
        "Using S7 PLC at {} (rack {}, slot {})",
        config.plc.address, config.plc.rack, config.plc.slot
    );
    shared(plc_gateway::S7Driver::new(
        config.plc.address.clone(),
        config.plc.rack,
        config.plc.slot,
    ))
}

#[cfg(not(feature = "s7"))]
fn build_driver(config: &GatewayConfig) -> SharedDriver {
    log::warn!("Built without a PLC backend, serving simulated blocks");
    let mut driver = plc_gateway::SimulatedDriver::new();
    for block in &config.blocks {
        driver = driver.with_block(block.num, block.length);
    }
    shared(driver)
}
