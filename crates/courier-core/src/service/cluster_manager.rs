// Cluster SPI: membership, the address -> nodes multimap and node-to-node transport

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use courier_common::BusError;

use crate::model::NodeId;

/// Membership service a clustered bus joins
#[async_trait]
pub trait ClusterManager: Send + Sync {
    /// Join the cluster. Joining twice is an error.
    async fn join(&self) -> Result<(), BusError>;

    async fn leave(&self) -> Result<(), BusError>;

    /// Identity of this node
    fn node_id(&self) -> NodeId;

    /// Nodes currently in the cluster, this one included
    fn nodes(&self) -> Vec<NodeId>;

    /// Listener told about other nodes joining and leaving; set before `join`.
    fn set_node_listener(&self, listener: Arc<dyn NodeListener>);

    /// Distributed map of address -> nodes with handlers for it
    fn subscriptions(&self) -> Arc<dyn SubscriptionMap>;

    fn is_active(&self) -> bool;
}

pub trait NodeListener: Send + Sync {
    fn node_added(&self, node: &NodeId);

    fn node_left(&self, node: &NodeId);
}

/// Address -> set of nodes, shared by the whole cluster
#[async_trait]
pub trait SubscriptionMap: Send + Sync {
    async fn add(&self, address: &str, node: &NodeId) -> Result<(), BusError>;

    /// Returns whether the node was present.
    async fn remove(&self, address: &str, node: &NodeId) -> Result<bool, BusError>;

    /// Nodes for an address in insertion order; empty when nobody subscribed.
    async fn get(&self, address: &str) -> Result<Vec<NodeId>, BusError>;

    async fn remove_all_for_node(&self, node: &NodeId) -> Result<(), BusError>;
}

/// Receives frames addressed to a node
pub trait FrameSink: Send + Sync {
    fn receive_frame(&self, frame: Bytes);
}

/// Raw byte transport between nodes
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Start accepting frames for `node`.
    async fn bind(&self, node: &NodeId, sink: Arc<dyn FrameSink>) -> Result<(), BusError>;

    async fn unbind(&self, node: &NodeId) -> Result<(), BusError>;

    /// Send one complete frame to `target`.
    async fn send(&self, target: &NodeId, frame: Bytes) -> Result<(), BusError>;
}
