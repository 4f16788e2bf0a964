//! Courier Core - Address-based event bus
//!
//! This crate provides:
//! - Message codecs and the codec registry
//! - The wire frame format between nodes
//! - Handler registration with round-robin selection
//! - Delivery on execution contexts
//! - Request/reply correlation with timeouts
//! - Cluster routing over a pluggable cluster manager and transport

pub mod codec;
pub mod handler;
pub mod message;
pub mod metrics;
pub mod model;
pub mod service;
pub mod wire;

// Re-export commonly used types
pub use codec::{Body, MessageCodec, ObjectBody};
pub use handler::{Handler, RegistrationId};
pub use message::Message;
pub use model::{BusOptions, Configuration, DeliveryOptions, NodeId};
pub use service::{
    Context, ContextKind, DeliveryStats, EventBus, LocalCluster, NodeChangeEvent, ReplyResult,
};

// Re-export common types
pub use courier_common::{BusError, ReplyException, ReplyFailure};
