// In-process cluster: membership, subscriptions and transport shared by several buses

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use courier_common::{BusError, DEFAULT_MAX_FRAME_SIZE};

use super::cluster_manager::{
    ClusterManager, ClusterTransport, FrameSink, NodeListener, SubscriptionMap,
};
use crate::model::NodeId;
use crate::wire::split_frame;

struct LocalClusterInner {
    nodes: RwLock<Vec<NodeId>>,
    listeners: DashMap<NodeId, Arc<dyn NodeListener>>,
    subscriptions: Arc<LocalSubscriptionMap>,
    sinks: DashMap<NodeId, Arc<dyn FrameSink>>,
    streams: DashMap<NodeId, BytesMut>,
    max_frame_size: usize,
}

/// A cluster living inside one process
///
/// Every manager and transport created from the same `LocalCluster` sees the
/// same members, subscriptions and frame sinks.
#[derive(Clone)]
pub struct LocalCluster {
    inner: Arc<LocalClusterInner>,
}

impl Default for LocalCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCluster {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            inner: Arc::new(LocalClusterInner {
                nodes: RwLock::new(Vec::new()),
                listeners: DashMap::new(),
                subscriptions: Arc::new(LocalSubscriptionMap::default()),
                sinks: DashMap::new(),
                streams: DashMap::new(),
                max_frame_size,
            }),
        }
    }

    /// Membership handle for one node
    pub fn manager(&self, node: NodeId) -> Arc<LocalClusterManager> {
        Arc::new(LocalClusterManager {
            cluster: self.clone(),
            node,
            listener: RwLock::new(None),
            active: AtomicBool::new(false),
        })
    }

    pub fn transport(&self) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            cluster: self.clone(),
        })
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.inner.nodes.read().clone()
    }

    pub fn subscriptions(&self) -> Arc<LocalSubscriptionMap> {
        self.inner.subscriptions.clone()
    }

    fn other_listeners(&self, node: &NodeId) -> Vec<Arc<dyn NodeListener>> {
        self.inner
            .listeners
            .iter()
            .filter(|entry| entry.key() != node)
            .map(|entry| entry.value().clone())
            .collect()
    }
}

pub struct LocalClusterManager {
    cluster: LocalCluster,
    node: NodeId,
    listener: RwLock<Option<Arc<dyn NodeListener>>>,
    active: AtomicBool,
}

#[async_trait]
impl ClusterManager for LocalClusterManager {
    async fn join(&self) -> Result<(), BusError> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(BusError::IllegalState(format!(
                "node {} has already joined",
                self.node
            )));
        }

        {
            let mut nodes = self.cluster.inner.nodes.write();
            if nodes.contains(&self.node) {
                self.active.store(false, Ordering::SeqCst);
                return Err(BusError::Cluster(format!(
                    "a node with id {} is already a member",
                    self.node
                )));
            }
            nodes.push(self.node.clone());
        }
        if let Some(listener) = self.listener.read().clone() {
            self.cluster
                .inner
                .listeners
                .insert(self.node.clone(), listener);
        }

        info!(node = %self.node, "Node joined local cluster");
        for listener in self.cluster.other_listeners(&self.node) {
            listener.node_added(&self.node);
        }
        Ok(())
    }

    async fn leave(&self) -> Result<(), BusError> {
        if !self.active.swap(false, Ordering::SeqCst) {
            debug!(node = %self.node, "Leave called on a node that is not a member");
            return Ok(());
        }

        self.cluster.inner.nodes.write().retain(|n| n != &self.node);
        self.cluster.inner.listeners.remove(&self.node);

        info!(node = %self.node, "Node left local cluster");
        for listener in self.cluster.other_listeners(&self.node) {
            listener.node_left(&self.node);
        }
        Ok(())
    }

    fn node_id(&self) -> NodeId {
        self.node.clone()
    }

    fn nodes(&self) -> Vec<NodeId> {
        self.cluster.nodes()
    }

    fn set_node_listener(&self, listener: Arc<dyn NodeListener>) {
        *self.listener.write() = Some(listener.clone());
        if self.is_active() {
            self.cluster
                .inner
                .listeners
                .insert(self.node.clone(), listener);
        }
    }

    fn subscriptions(&self) -> Arc<dyn SubscriptionMap> {
        self.cluster.subscriptions()
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Address -> nodes, kept in insertion order without duplicates
#[derive(Default)]
pub struct LocalSubscriptionMap {
    entries: DashMap<String, Vec<NodeId>>,
}

#[async_trait]
impl SubscriptionMap for LocalSubscriptionMap {
    async fn add(&self, address: &str, node: &NodeId) -> Result<(), BusError> {
        let mut nodes = self.entries.entry(address.to_string()).or_default();
        if !nodes.contains(node) {
            nodes.push(node.clone());
        }
        Ok(())
    }

    async fn remove(&self, address: &str, node: &NodeId) -> Result<bool, BusError> {
        let Entry::Occupied(mut entry) = self.entries.entry(address.to_string()) else {
            return Ok(false);
        };
        let nodes = entry.get_mut();
        let before = nodes.len();
        nodes.retain(|n| n != node);
        let removed = nodes.len() != before;
        if nodes.is_empty() {
            entry.remove();
        }
        Ok(removed)
    }

    async fn get(&self, address: &str) -> Result<Vec<NodeId>, BusError> {
        Ok(self
            .entries
            .get(address)
            .map(|nodes| nodes.clone())
            .unwrap_or_default())
    }

    async fn remove_all_for_node(&self, node: &NodeId) -> Result<(), BusError> {
        self.entries.retain(|_, nodes| {
            nodes.retain(|n| n != node);
            !nodes.is_empty()
        });
        Ok(())
    }
}

/// Transport that hands frames straight to the target bus
///
/// Bytes pass through a per-target stream buffer and are cut back into frames
/// the way a socket reader would.
pub struct LocalTransport {
    cluster: LocalCluster,
}

#[async_trait]
impl ClusterTransport for LocalTransport {
    async fn bind(&self, node: &NodeId, sink: Arc<dyn FrameSink>) -> Result<(), BusError> {
        match self.cluster.inner.sinks.entry(node.clone()) {
            Entry::Occupied(_) => Err(BusError::NetworkError(format!(
                "address {node} already in use"
            ))),
            Entry::Vacant(entry) => {
                entry.insert(sink);
                debug!(node = %node, "Bound local transport");
                Ok(())
            }
        }
    }

    async fn unbind(&self, node: &NodeId) -> Result<(), BusError> {
        self.cluster.inner.sinks.remove(node);
        self.cluster.inner.streams.remove(node);
        debug!(node = %node, "Unbound local transport");
        Ok(())
    }

    async fn send(&self, target: &NodeId, frame: Bytes) -> Result<(), BusError> {
        let sink = self
            .cluster
            .inner
            .sinks
            .get(target)
            .map(|sink| sink.value().clone())
            .ok_or_else(|| BusError::NetworkError(format!("node {target} is unreachable")))?;

        let frames = {
            let mut stream = self.cluster.inner.streams.entry(target.clone()).or_default();
            stream.extend_from_slice(&frame);
            let mut frames = Vec::new();
            loop {
                match split_frame(&mut stream, self.cluster.inner.max_frame_size) {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(node = %target, "Resetting inbound stream: {}", e);
                        stream.clear();
                        return Err(e);
                    }
                }
            }
            frames
        };

        for frame in frames {
            sink.receive_frame(frame);
        }
        Ok(())
    }
}
