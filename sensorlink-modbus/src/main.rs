//! Modbus sensor polling station.
//!
//! Polls the configured sensors on one serial bus and uploads a reading
//! snapshot to the collector every cycle.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use sensorlink_modbus::config::{MeasurementSource, PollPlan, StationConfig};
use sensorlink_modbus::poller::{CycleController, CycleSettings, PollingState};
use sensorlink_modbus::transport::ModbusTransport;
use sensorlink_modbus::uplink::HttpUplink;

/// Modbus RTU sensor polling station.
#[derive(Parser, Debug)]
#[command(name = "sensorlink-modbus")]
#[command(about = "Polls Modbus sensors and uploads reading snapshots")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "sensorlink.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Run a single cycle and exit.
    #[arg(long)]
    once: bool,

    /// Validate the configuration, print the polling plan and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration; validation fails fast on any table mismatch
    let config = StationConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    let plan = config.plan()?;

    if args.check {
        print_plan(&config, &plan);
        return Ok(());
    }

    // Initialize logging
    let log_config = config
        .logging
        .with_level_override(args.log_level.as_deref());
    sensorlink_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting sensorlink-modbus");
    info!("Loaded configuration from {:?}", args.config);
    for device in &plan.devices {
        info!(
            "Device '{}' (model {}, address {}, {} registers)",
            device.name(),
            device.model(),
            device.bus_address(),
            device.descriptors().len()
        );
    }

    let mut transport = ModbusTransport::new(config.bus.clone());
    if let Err(e) = transport.open().await {
        // Reads retry the open every cycle.
        warn!("Bus not available yet: {}", e);
    }

    let uplink = HttpUplink::new(&config.uplink).context("Failed to set up uplink")?;
    info!("Uploading snapshots to {}", uplink.endpoint());

    let settings = CycleSettings::from_config(&config);
    let mut controller = CycleController::new(plan, settings, transport, uplink);

    if args.once {
        let report = controller.run_cycle().await;
        println!("{}", serde_json::to_string_pretty(&report.snapshot)?);
        return Ok(());
    }

    let state = PollingState::new(config.polling.cycle_interval());
    controller
        .run(state, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal");
        })
        .await;

    info!("sensorlink-modbus stopped");
    Ok(())
}

/// Print the resolved devices and measurement order.
fn print_plan(config: &StationConfig, plan: &PollPlan) {
    println!("Configuration OK: station '{}'", config.station.id);
    println!();
    println!("Devices:");
    for device in &plan.devices {
        println!("  {}", device);
        for (index, d) in device.descriptors().iter().enumerate() {
            println!(
                "    [{}] fc {} address {} count {} {:?}",
                index, d.function_code, d.start_address, d.register_count, d.value_type
            );
        }
    }
    println!();
    println!("Measurements (payload order):");
    for m in &plan.measurements {
        match m.source {
            MeasurementSource::Register {
                device,
                index,
                scale,
                offset,
            } => println!(
                "  {} <- {}[{}] * {} + {}",
                m.name,
                plan.devices[device].name(),
                index,
                scale,
                offset
            ),
            MeasurementSource::Constant(value) => println!("  {} = {}", m.name, value),
        }
    }
}
