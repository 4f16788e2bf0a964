//! Courier Common - Shared error types and utilities
//!
//! This crate provides the foundational types used across all Courier components:
//! - Error types and reply failures
//! - Utility functions
//! - Common constants

pub mod error;
pub mod utils;

// Re-exports for convenience
pub use error::{BUS_FAILURE_CODE, BusError, ReplyException, ReplyFailure};
pub use utils::{local_ip, validate_address};

/// Prefix of every ephemeral reply address generated by the bus
pub const REPLY_ADDRESS_PREFIX: &str = "__courier.reply.";

/// Default bus port when none is configured
pub const DEFAULT_BUS_PORT: u16 = 5701;

/// Default upper bound for a single wire frame
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub type Result<T, E = BusError> = std::result::Result<T, E>;
