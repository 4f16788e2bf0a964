//! Main entry point for the courier node.
//!
//! Starts the configured number of bus nodes on one in-process cluster, serves
//! the echo address on every node and pings it until shutdown.

use std::time::Duration;

use clap::Parser;
use tracing::info;

use courier_core::LocalCluster;
use courier_node::node;
use courier_node::startup::{self, Cli, LoggingConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let configuration = startup::load_configuration(&cli)?;

    let logging_config = LoggingConfig::from_configuration(&configuration);
    let _logging_guard = startup::init_logging(&logging_config)?;

    courier_core::metrics::init_metrics();
    node::describe_metrics();

    let cluster = LocalCluster::with_max_frame_size(configuration.max_frame_size());
    let buses = node::start_nodes(&configuration, &cluster).await?;
    for bus in &buses {
        node::register_echo(bus)?;
        bus.flush().await;
    }

    let shutdown = startup::wait_for_shutdown_signal();
    let mut stopped = shutdown.subscribe();
    let interval = Duration::from_millis(configuration.ping_interval_ms());
    let mut pingers = Vec::new();
    if let Some(first) = buses.first() {
        pingers.push(tokio::spawn(node::run_ping_loop(
            first.clone(),
            interval,
            shutdown.subscribe(),
        )));
    }

    info!(
        nodes = buses.len(),
        ping_interval_ms = configuration.ping_interval_ms(),
        "Courier node running, press Ctrl+C to stop"
    );

    let _ = stopped.recv().await;

    for pinger in pingers {
        let _ = pinger.await;
    }
    node::stop_nodes(&buses).await;

    info!("Shutdown complete");
    Ok(())
}
