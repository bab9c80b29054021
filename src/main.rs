use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use solis_bridge::arbiter::{Arbiter, InjectMessage};
use solis_bridge::config::{self, Config};
use solis_bridge::gateway::Gateway;
use solis_bridge::metrics::{self, Metrics};
use solis_bridge::registers;
use solis_bridge::serial_io;

const BAUD_RATE: u32 = 9600;
const DEFAULT_EXPORTER_LISTEN: &str = "0.0.0.0:3105";
const DEFAULT_GATEWAY_LISTEN: &str = "127.0.0.1:502";

/// Monitoring and mediation appliance for a Solis PV inverter's Modbus-RTU bus.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to the YAML configuration document.
    #[arg(long, default_value = "solis_exporter.yml")]
    config: String,

    /// Raise default log verbosity one step.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        log::error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_micros()
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = config::read_config_file(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;

    if config.gateway.is_some() && config.serial.is_none() {
        return Err(anyhow!("the gateway requires [serial] to be configured"));
    }

    let exporter = config.solis_exporter.clone().unwrap_or_default();

    let metrics = Arc::new(
        Metrics::new(exporter.go_collector, exporter.process_collector)
            .context("constructing metrics registry")?,
    );
    let dispatcher = Arc::new(
        registers::build_catalogue(&metrics.registry).context("registering metric catalogue")?,
    );

    let mut tasks = tokio::task::JoinSet::new();

    let metrics_listen = exporter
        .listen
        .clone()
        .unwrap_or_else(|| DEFAULT_EXPORTER_LISTEN.to_string());
    {
        let metrics = Arc::clone(&metrics);
        tasks.spawn(async move { metrics::serve(&metrics, &metrics_listen).await });
    }

    if let Some(serial_config) = config.serial.clone() {
        let reader_port = open_port(&serial_config.device)
            .with_context(|| format!("opening serial device {}", serial_config.device))?;
        let writer_port = open_port(&serial_config.device)
            .with_context(|| format!("opening serial device {} for writing", serial_config.device))?;
        log::info!("serial port {} open at {BAUD_RATE} baud", serial_config.device);

        let handles = serial_io::spawn(reader_port, serial_config.dump);
        let (inject_tx, inject_rx) = flume::bounded::<InjectMessage>(1);

        let arbiter_instance = Arbiter::new(
            writer_port,
            exporter.station,
            handles.cell,
            handles.busy_rx,
            handles.sniffer_rx,
            handles.response_rx,
            inject_rx,
            Arc::clone(&dispatcher),
            Arc::clone(&metrics),
        );
        tasks.spawn(async move {
            arbiter_instance.run().await;
            Ok(())
        });

        if let Some(gateway_config) = config.gateway.clone() {
            let listen = gateway_config
                .listen
                .clone()
                .unwrap_or_else(|| DEFAULT_GATEWAY_LISTEN.to_string());
            let gateway = Gateway::new(gateway_config.rules, inject_tx);
            tasks.spawn(async move { gateway.listen(&listen).await });
        }
    } else {
        log::info!("no [serial] section configured; running metrics-only, with no bus to sniff or inject onto");
    }

    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(join_err) => return Err(anyhow!("background task panicked: {join_err}")),
        }
    }

    Ok(())
}

/// Opens `device` at the fixed bus parameters: 9600 baud, 8N1. Strict
/// Modbus-RTU calls for 2 stop bits with no parity; this inverter accepts
/// 1, which is what's configured here.
fn open_port(device: &str) -> Result<Box<dyn serialport::SerialPort>> {
    serialport::new(device, BAUD_RATE)
        .timeout(Duration::from_secs(1))
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .open()
        .map_err(|e| anyhow!("{e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_solis_exporter_yml() {
        let cli = Cli::parse_from(["solis-bridge"]);
        assert_eq!(cli.config, "solis_exporter.yml");
        assert!(!cli.verbose);
    }

    #[test]
    fn cli_accepts_overrides() {
        let cli = Cli::parse_from(["solis-bridge", "--config", "other.yml", "-v"]);
        assert_eq!(cli.config, "other.yml");
        assert!(cli.verbose);
    }
}
