// Node change event handling
// Notifies interested parties when cluster nodes join or leave

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::model::NodeId;

/// Type of node change event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeChangeType {
    /// A node joined the cluster
    NodeJoin,
    /// A node left the cluster
    NodeLeave,
}

impl std::fmt::Display for NodeChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeChangeType::NodeJoin => write!(f, "NODE_JOIN"),
            NodeChangeType::NodeLeave => write!(f, "NODE_LEAVE"),
        }
    }
}

/// Node change event
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeChangeEvent {
    pub change_type: NodeChangeType,
    pub node: NodeId,
    /// Milliseconds since the epoch
    pub timestamp: i64,
}

impl NodeChangeEvent {
    pub fn node_join(node: NodeId) -> Self {
        Self {
            change_type: NodeChangeType::NodeJoin,
            node,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn node_leave(node: NodeId) -> Self {
        Self {
            change_type: NodeChangeType::NodeLeave,
            node,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Trait for handling node change events
pub trait NodeChangeListener: Send + Sync {
    fn on_node_change(&self, event: &NodeChangeEvent);
}

/// Node change event publisher
/// Broadcasts events to subscribers and calls registered listeners
pub struct NodeChangeEventPublisher {
    broadcast_tx: broadcast::Sender<NodeChangeEvent>,
    listeners: RwLock<Vec<Arc<dyn NodeChangeListener>>>,
}

impl NodeChangeEventPublisher {
    pub fn new(queue_size: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(queue_size);
        Self {
            broadcast_tx,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn register_listener(&self, listener: Arc<dyn NodeChangeListener>) {
        let mut listeners = self.listeners.write();
        listeners.push(listener);
        debug!("Registered node change listener, total: {}", listeners.len());
    }

    pub fn publish(&self, event: NodeChangeEvent) {
        debug!(
            "Publishing node change event: {} for {}",
            event.change_type, event.node
        );

        // No subscribers is fine
        let _ = self.broadcast_tx.send(event.clone());

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_node_change(&event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeChangeEvent> {
        self.broadcast_tx.subscribe()
    }
}

/// Logs every node change
pub struct LoggingNodeChangeListener;

impl NodeChangeListener for LoggingNodeChangeListener {
    fn on_node_change(&self, event: &NodeChangeEvent) {
        match event.change_type {
            NodeChangeType::NodeJoin => info!("[NodeEvent] Node joined: {}", event.node),
            NodeChangeType::NodeLeave => info!("[NodeEvent] Node left: {}", event.node),
        }
    }
}
