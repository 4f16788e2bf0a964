//! Utility functions for Courier

use if_addrs::IfAddr;

use crate::error::BusError;

/// Get the local IP address
///
/// Returns the first non-loopback IPv4 address found,
/// or "127.0.0.1" as fallback.
///
/// # Examples
///
/// ```
/// use courier_common::local_ip;
///
/// let ip = local_ip();
/// assert!(!ip.is_empty());
/// ```
pub fn local_ip() -> String {
    if_addrs::get_if_addrs()
        .ok()
        .and_then(|addrs| {
            addrs.into_iter().find_map(|iface| match iface.addr {
                IfAddr::V4(ref v4) if !iface.is_loopback() => Some(v4.ip.to_string()),
                _ => None,
            })
        })
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

/// Check that an address can be registered or sent to.
///
/// Addresses are opaque, the only requirement is that they are non-empty.
pub fn validate_address(address: &str) -> Result<(), BusError> {
    if address.is_empty() {
        return Err(BusError::IllegalArgument(
            "address must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_local_ip_not_empty() {
        let ip = local_ip();
        assert!(!ip.is_empty());
        assert!(ip.parse::<std::net::Ipv4Addr>().is_ok());
    }

    #[test]
    fn test_validate_address_empty() {
        assert!(matches!(
            validate_address(""),
            Err(BusError::IllegalArgument(_))
        ));
    }

    proptest! {
        #[test]
        fn test_validate_address_accepts_any_non_empty(address in ".+") {
            prop_assert!(validate_address(&address).is_ok());
        }
    }
}
