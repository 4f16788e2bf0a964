//! Error types for Courier
//!
//! This module defines:
//! - `BusError`: errors returned synchronously by bus operations
//! - `ReplyFailure`: the kinds of asynchronous reply failure
//! - `ReplyException`: the failure delivered to a reply handler

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Failure code carried by failures the bus raises itself (timeouts, missing handlers).
pub const BUS_FAILURE_CODE: i32 = -1;

/// Errors returned by bus operations
#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("codec '{0}' is already registered")]
    CodecAlreadyRegistered(String),

    #[error("no codec registered with name '{0}'")]
    CodecNotFound(String),

    #[error("no message codec for type '{0}', register a codec and name it in the delivery options")]
    UnencodableType(String),

    #[error("unsupported wire protocol version {found}, highest supported is {supported}")]
    UnsupportedProtocolVersion { found: u8, supported: u8 },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("cluster error: {0}")]
    Cluster(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("event bus is closed")]
    Closed,

    #[error(transparent)]
    Reply(#[from] ReplyException),
}

/// Kind of reply failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplyFailure {
    /// No reply arrived before the timeout fired
    Timeout,
    /// Nobody was registered at the target address
    NoHandlers,
    /// The recipient explicitly failed the message
    RecipientFailure,
}

impl ReplyFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplyFailure::Timeout => "TIMEOUT",
            ReplyFailure::NoHandlers => "NO_HANDLERS",
            ReplyFailure::RecipientFailure => "RECIPIENT_FAILURE",
        }
    }

    /// Wire representation used by the reply-exception codec.
    pub fn to_byte(self) -> u8 {
        match self {
            ReplyFailure::Timeout => 0,
            ReplyFailure::NoHandlers => 1,
            ReplyFailure::RecipientFailure => 2,
        }
    }

    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(ReplyFailure::Timeout),
            1 => Some(ReplyFailure::NoHandlers),
            2 => Some(ReplyFailure::RecipientFailure),
            _ => None,
        }
    }
}

impl Display for ReplyFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failure delivered to the caller of a reply-expecting send
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("({failure_type},{failure_code}) {message}")]
pub struct ReplyException {
    pub failure_type: ReplyFailure,
    pub failure_code: i32,
    pub message: String,
}

impl ReplyException {
    pub fn new(failure_type: ReplyFailure, failure_code: i32, message: impl Into<String>) -> Self {
        Self {
            failure_type,
            failure_code,
            message: message.into(),
        }
    }

    pub fn timeout(address: &str, timeout_ms: u64) -> Self {
        Self::new(
            ReplyFailure::Timeout,
            BUS_FAILURE_CODE,
            format!("Timed out after waiting {timeout_ms}(ms) for a reply. address: {address}"),
        )
    }

    pub fn no_handlers(address: &str) -> Self {
        Self::new(
            ReplyFailure::NoHandlers,
            BUS_FAILURE_CODE,
            format!("No handlers for address {address}"),
        )
    }

    pub fn recipient_failure(failure_code: i32, message: impl Into<String>) -> Self {
        Self::new(ReplyFailure::RecipientFailure, failure_code, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_failure_byte_mapping() {
        for failure in [
            ReplyFailure::Timeout,
            ReplyFailure::NoHandlers,
            ReplyFailure::RecipientFailure,
        ] {
            assert_eq!(ReplyFailure::from_byte(failure.to_byte()), Some(failure));
        }
        assert_eq!(ReplyFailure::from_byte(9), None);
    }

    #[test]
    fn test_bus_raised_failures_use_bus_code() {
        let timeout = ReplyException::timeout("orders", 250);
        assert_eq!(timeout.failure_type, ReplyFailure::Timeout);
        assert_eq!(timeout.failure_code, BUS_FAILURE_CODE);
        assert!(timeout.message.contains("250"));

        let none = ReplyException::no_handlers("orders");
        assert_eq!(none.failure_type, ReplyFailure::NoHandlers);
        assert_eq!(none.failure_code, BUS_FAILURE_CODE);
    }

    #[test]
    fn test_reply_exception_display() {
        let err = ReplyException::recipient_failure(23, "wibble");
        assert_eq!(err.to_string(), "(RECIPIENT_FAILURE,23) wibble");

        let bus_err: BusError = err.into();
        assert_eq!(bus_err.to_string(), "(RECIPIENT_FAILURE,23) wibble");
    }
}
