// Cluster routing adapter
// Keeps this node's advertisements in the subscription map, tracks live nodes
// and picks the node a point-to-point message goes to.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use courier_common::BusError;

use super::cluster_manager::{
    ClusterManager, ClusterTransport, FrameSink, NodeListener, SubscriptionMap,
};
use super::node_event::{NodeChangeEvent, NodeChangeEventPublisher};
use crate::metrics;
use crate::model::NodeId;

pub struct ClusterAdapter {
    node: NodeId,
    manager: Arc<dyn ClusterManager>,
    transport: Arc<dyn ClusterTransport>,
    subscriptions: Arc<dyn SubscriptionMap>,
    live_nodes: RwLock<HashSet<NodeId>>,
    cursors: DashMap<String, AtomicUsize>,
    events: Arc<NodeChangeEventPublisher>,
}

impl ClusterAdapter {
    pub fn new(
        manager: Arc<dyn ClusterManager>,
        transport: Arc<dyn ClusterTransport>,
        events: Arc<NodeChangeEventPublisher>,
    ) -> Self {
        let subscriptions = manager.subscriptions();
        Self {
            node: manager.node_id(),
            manager,
            transport,
            subscriptions,
            live_nodes: RwLock::new(HashSet::new()),
            cursors: DashMap::new(),
            events,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    /// Bind the transport, then join the cluster and take the initial member view.
    pub async fn join(
        &self,
        listener: Arc<dyn NodeListener>,
        sink: Arc<dyn FrameSink>,
    ) -> Result<(), BusError> {
        self.transport.bind(&self.node, sink).await?;
        self.manager.set_node_listener(listener);
        if let Err(e) = self.manager.join().await {
            let _ = self.transport.unbind(&self.node).await;
            return Err(e);
        }

        let mut live = self.live_nodes.write();
        live.extend(self.manager.nodes());
        live.insert(self.node.clone());
        info!(
            node = %self.node,
            members = live.len(),
            "Event bus joined cluster"
        );
        Ok(())
    }

    pub async fn leave(&self) -> Result<(), BusError> {
        self.manager.leave().await?;
        self.transport.unbind(&self.node).await?;
        self.live_nodes.write().clear();
        info!(node = %self.node, "Event bus left cluster");
        Ok(())
    }

    /// This node now has handlers for `address`.
    pub async fn advertise(&self, address: &str) -> Result<(), BusError> {
        self.subscriptions.add(address, &self.node).await?;
        debug!(address = %address, node = %self.node, "Advertised address");
        Ok(())
    }

    /// This node no longer has handlers for `address`.
    pub async fn withdraw(&self, address: &str) -> Result<(), BusError> {
        self.subscriptions.remove(address, &self.node).await?;
        self.cursors.remove(address);
        debug!(address = %address, node = %self.node, "Withdrew address");
        Ok(())
    }

    /// Nodes subscribed to `address`, as recorded in the subscription map.
    pub async fn subscribers(&self, address: &str) -> Result<Vec<NodeId>, BusError> {
        self.subscriptions.get(address).await
    }

    /// Candidates for a point-to-point send: live subscribers, plus this node
    /// exactly when it has local registrations.
    pub fn candidates(&self, subscribers: &[NodeId], has_local: bool) -> Vec<NodeId> {
        let live = self.live_nodes.read();
        let mut candidates: Vec<NodeId> = subscribers
            .iter()
            .filter(|node| {
                if **node == self.node {
                    has_local
                } else {
                    live.contains(*node)
                }
            })
            .cloned()
            .collect();
        if has_local && !candidates.contains(&self.node) {
            candidates.push(self.node.clone());
        }
        candidates
    }

    /// Pick one candidate with the address's round-robin cursor.
    ///
    /// Local and remote candidates have the same weight.
    pub fn choose(&self, address: &str, candidates: &[NodeId]) -> Option<NodeId> {
        if candidates.is_empty() {
            return None;
        }
        let cursor = self
            .cursors
            .entry(address.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
        Some(candidates[cursor % candidates.len()].clone())
    }

    /// Live remote subscribers a publish is transmitted to.
    pub fn publish_targets(&self, subscribers: &[NodeId]) -> Vec<NodeId> {
        let live = self.live_nodes.read();
        subscribers
            .iter()
            .filter(|node| **node != self.node && live.contains(*node))
            .cloned()
            .collect()
    }

    pub async fn transmit(&self, target: &NodeId, frame: Bytes) -> Result<(), BusError> {
        self.transport.send(target, frame).await?;
        metrics::record_frame_transmitted();
        Ok(())
    }

    pub fn node_added(&self, node: &NodeId) {
        if self.live_nodes.write().insert(node.clone()) {
            self.events.publish(NodeChangeEvent::node_join(node.clone()));
        }
    }

    /// Drop a departed node from the live view; its subscriptions are purged separately.
    pub fn node_left(&self, node: &NodeId) {
        if self.live_nodes.write().remove(node) {
            self.events.publish(NodeChangeEvent::node_leave(node.clone()));
        }
    }

    pub async fn purge(&self, node: &NodeId) {
        match self.subscriptions.remove_all_for_node(node).await {
            Ok(()) => debug!(node = %node, "Purged subscriptions of departed node"),
            Err(e) => warn!(node = %node, "Failed to purge subscriptions: {}", e),
        }
    }

    /// Live members in no particular order
    pub fn live_nodes(&self) -> Vec<NodeId> {
        self.live_nodes.read().iter().cloned().collect()
    }

    pub fn is_active(&self) -> bool {
        self.manager.is_active()
    }
}
