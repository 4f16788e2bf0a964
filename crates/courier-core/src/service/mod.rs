// Bus services: contexts, delivery, replies and cluster routing

pub mod bus;
pub mod cluster;
pub mod cluster_manager;
pub mod context;
pub mod dispatcher;
pub mod local_cluster;
pub mod node_event;
pub mod reply;

// Re-export commonly used types
pub use bus::{EventBus, WeakEventBus};
pub use cluster_manager::{ClusterManager, ClusterTransport, FrameSink, NodeListener, SubscriptionMap};
pub use context::{Context, ContextKind};
pub use dispatcher::DeliveryStats;
pub use local_cluster::{LocalCluster, LocalClusterManager, LocalSubscriptionMap, LocalTransport};
pub use node_event::{NodeChangeEvent, NodeChangeListener, NodeChangeType};
pub use reply::{ReplyResult, ReplyState};
