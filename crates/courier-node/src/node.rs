//! Bus nodes run by the binary: startup, the echo service and the ping loop

use std::time::Duration;

use futures::future::join_all;
use metrics::{counter, describe_counter};
use tokio::sync::broadcast;
use tracing::{info, warn};

use courier_common::{BUS_FAILURE_CODE, BusError};
use courier_core::{
    Configuration, DeliveryOptions, EventBus, LocalCluster, Message, NodeId, RegistrationId,
};

/// Address of the echo service registered on every node
pub const ECHO_ADDRESS: &str = "courier.echo";

/// Describe the node's own metrics; the bus metrics are described by `courier_core`.
pub fn describe_metrics() {
    describe_counter!(
        "courier_node_pings_total",
        "Total number of echo pings by outcome"
    );
}

/// Start `courier.node.count` buses on one in-process cluster.
///
/// Ports count up from `courier.bus.port`.
pub async fn start_nodes(
    configuration: &Configuration,
    cluster: &LocalCluster,
) -> Result<Vec<EventBus>, BusError> {
    let base = configuration.to_bus_options();
    let mut buses = Vec::with_capacity(configuration.node_count());

    for index in 0..configuration.node_count() {
        let port = u16::try_from(usize::from(base.port) + index).map_err(|_| {
            BusError::IllegalArgument(format!("node {index} has no port above {}", base.port))
        })?;
        let options = base.clone().with_node(base.host.clone(), port);
        let node = NodeId::new(options.host.clone(), port);

        let bus = EventBus::clustered(options, cluster.manager(node), cluster.transport()).await?;
        buses.push(bus);
    }

    info!(
        nodes = buses.len(),
        members = cluster.nodes().len(),
        "Started courier nodes"
    );
    Ok(buses)
}

/// Register the echo service: replies with the received body.
pub fn register_echo(bus: &EventBus) -> Result<RegistrationId, BusError> {
    let replier = bus.clone();
    bus.register(ECHO_ADDRESS, move |message: Message| {
        let result = match message.body() {
            Ok(body) => message.reply(&replier, body),
            Err(e) => message.fail(&replier, BUS_FAILURE_CODE, e.to_string()),
        };
        if let Err(e) = result {
            warn!(node = %replier.node_id(), "Echo reply failed: {}", e);
        }
    })
}

/// Ping the echo service every `interval` until shutdown.
pub async fn run_ping_loop(
    bus: EventBus,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    let timeout = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    let mut sequence = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sequence += 1;
                let outcome = ping(&bus, sequence, timeout).await;
                counter!("courier_node_pings_total", "outcome" => outcome).increment(1);
            }
            _ = shutdown.recv() => {
                info!(node = %bus.node_id(), pings = sequence, "Ping loop stopped");
                break;
            }
        }
    }
}

async fn ping(bus: &EventBus, sequence: u64, timeout_ms: u64) -> &'static str {
    let options = DeliveryOptions::new().with_timeout(timeout_ms);
    match bus.request(ECHO_ADDRESS, format!("ping {sequence}"), options).await {
        Ok(reply) => {
            info!(
                node = %bus.node_id(),
                responder = %reply.sender(),
                sequence,
                "Ping answered"
            );
            "ok"
        }
        Err(BusError::Reply(failure)) => {
            warn!(node = %bus.node_id(), sequence, "Ping failed: {}", failure);
            failure.failure_type.as_str()
        }
        Err(e) => {
            warn!(node = %bus.node_id(), sequence, "Ping not sent: {}", e);
            "error"
        }
    }
}

/// Close every bus, logging failures and final delivery counts.
pub async fn stop_nodes(buses: &[EventBus]) {
    let results = join_all(buses.iter().map(|bus| bus.close())).await;
    for (bus, result) in buses.iter().zip(results) {
        if let Err(e) = result {
            warn!(node = %bus.node_id(), "Failed to close bus: {}", e);
        }
        match serde_json::to_string(&bus.delivery_stats()) {
            Ok(stats) => info!(node = %bus.node_id(), stats = %stats, "Bus delivery stats"),
            Err(e) => warn!(node = %bus.node_id(), "Failed to serialize delivery stats: {}", e),
        }
    }
    info!(nodes = buses.len(), "Stopped courier nodes");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configuration(port: i64, count: i64) -> Configuration {
        let config = config::Config::builder()
            .set_override("courier.bus.host", "localhost")
            .unwrap()
            .set_override("courier.bus.port", port)
            .unwrap()
            .set_override("courier.node.count", count)
            .unwrap()
            .build()
            .unwrap();
        Configuration::from_config(config)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_nodes_and_echo_across_nodes() {
        let cluster = LocalCluster::new();
        let buses = start_nodes(&configuration(7001, 2), &cluster).await.unwrap();
        assert_eq!(buses.len(), 2);
        assert_eq!(buses[1].node_id(), &NodeId::new("localhost", 7002));

        register_echo(&buses[0]).unwrap();
        buses[0].flush().await;

        let reply = buses[1]
            .request(ECHO_ADDRESS, "hello", DeliveryOptions::new().with_timeout(5_000))
            .await
            .unwrap();
        assert_eq!(reply.body().unwrap().as_str(), Some("hello"));
        assert_eq!(reply.sender(), buses[0].node_id());

        stop_nodes(&buses).await;
        assert!(buses.iter().all(EventBus::is_closed));
        assert!(cluster.nodes().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ping_without_echo_reports_no_handlers() {
        let cluster = LocalCluster::new();
        let buses = start_nodes(&configuration(7101, 1), &cluster).await.unwrap();
        assert_eq!(ping(&buses[0], 1, 1_000).await, "NO_HANDLERS");

        register_echo(&buses[0]).unwrap();
        assert_eq!(ping(&buses[0], 2, 1_000).await, "ok");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ping_loop_stops_on_shutdown() {
        let cluster = LocalCluster::new();
        let buses = start_nodes(&configuration(7201, 1), &cluster).await.unwrap();
        register_echo(&buses[0]).unwrap();

        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(run_ping_loop(
            buses[0].clone(),
            Duration::from_millis(10),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
