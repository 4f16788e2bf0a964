//! Courier Node - runs event bus nodes over an in-process cluster

pub mod node;
pub mod startup;
