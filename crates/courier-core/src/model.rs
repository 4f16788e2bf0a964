// Core data models shared by the bus, the wire format and the cluster adapter

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use courier_common::{BusError, DEFAULT_BUS_PORT, DEFAULT_MAX_FRAME_SIZE, local_ip};

/// Identity of one bus instance in a cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub host: String,
    pub port: u16,
}

impl NodeId {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeId {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| BusError::IllegalArgument(format!("invalid node id '{s}'")))?;
        if host.is_empty() {
            return Err(BusError::IllegalArgument(format!(
                "invalid node id '{s}': empty host"
            )));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| BusError::IllegalArgument(format!("invalid node id '{s}': {e}")))?;
        Ok(Self::new(host, port))
    }
}

/// Per-send options
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOptions {
    /// Reply timeout in milliseconds; 0 falls back to the bus default.
    #[serde(default)]
    pub timeout_ms: u64,

    /// Name of a registered user codec used to encode the body.
    #[serde(default)]
    pub codec_name: Option<String>,
}

impl DeliveryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_codec(mut self, codec_name: impl Into<String>) -> Self {
        self.codec_name = Some(codec_name.into());
        self
    }
}

/// Options of one bus instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BusOptions {
    #[serde(default = "BusOptions::default_host")]
    pub host: String,

    #[serde(default = "BusOptions::default_port")]
    pub port: u16,

    /// Reply timeout applied when a send does not set one; 0 waits forever.
    #[serde(default, rename = "default-timeout")]
    pub default_timeout_ms: u64,

    #[serde(default = "BusOptions::default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            default_timeout_ms: 0,
            max_frame_size: Self::default_max_frame_size(),
        }
    }
}

impl BusOptions {
    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.host.clone(), self.port)
    }

    pub fn with_node(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_default_timeout(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    /// Largest frame this bus will put on the wire, length prefix excluded.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Effective timeout for a send, `None` meaning unbounded.
    pub fn effective_timeout(&self, options: &DeliveryOptions) -> Option<Duration> {
        let timeout = if options.timeout_ms > 0 {
            options.timeout_ms
        } else {
            self.default_timeout_ms
        };
        (timeout > 0).then(|| Duration::from_millis(timeout))
    }

    fn default_host() -> String {
        local_ip()
    }

    fn default_port() -> u16 {
        DEFAULT_BUS_PORT
    }

    fn default_max_frame_size() -> usize {
        DEFAULT_MAX_FRAME_SIZE
    }
}

/// Layered application configuration
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: config::Config,
}

impl Configuration {
    /// Create a new configuration from a Config instance
    pub fn from_config(config: config::Config) -> Self {
        Self { config }
    }

    /// Host advertised as this node's identity (default: first non-loopback IPv4)
    pub fn bus_host(&self) -> String {
        self.config
            .get_string("courier.bus.host")
            .unwrap_or_else(|_| local_ip())
    }

    /// Port advertised as this node's identity (default: 5701)
    pub fn bus_port(&self) -> u16 {
        self.config
            .get_int("courier.bus.port")
            .map(|p| p as u16)
            .unwrap_or(DEFAULT_BUS_PORT)
    }

    /// Default reply timeout in milliseconds (default: 0, unbounded)
    pub fn default_timeout_ms(&self) -> u64 {
        self.config
            .get_int("courier.bus.default-timeout")
            .unwrap_or(0)
            .max(0) as u64
    }

    /// Largest accepted wire frame in bytes (default: 16MB)
    pub fn max_frame_size(&self) -> usize {
        self.config
            .get_int("courier.bus.max-frame-size")
            .map(|s| s as usize)
            .unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Number of in-process bus nodes to start (default: 1)
    pub fn node_count(&self) -> usize {
        self.config
            .get_int("courier.node.count")
            .unwrap_or(1)
            .max(1) as usize
    }

    /// Interval of the demo ping loop in milliseconds (default: 1000ms)
    pub fn ping_interval_ms(&self) -> u64 {
        self.config
            .get_int("courier.node.ping-interval")
            .unwrap_or(1000)
            .max(1) as u64
    }

    pub fn to_bus_options(&self) -> BusOptions {
        BusOptions {
            host: self.bus_host(),
            port: self.bus_port(),
            default_timeout_ms: self.default_timeout_ms(),
            max_frame_size: self.max_frame_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display_and_parse() {
        let node = NodeId::new("10.0.0.7", 1234);
        assert_eq!(node.to_string(), "10.0.0.7:1234");
        assert_eq!(node.address(), "10.0.0.7:1234");
        assert_eq!("10.0.0.7:1234".parse::<NodeId>().unwrap(), node);
    }

    #[test]
    fn test_node_id_parse_invalid() {
        assert!("nohost".parse::<NodeId>().is_err());
        assert!(":80".parse::<NodeId>().is_err());
        assert!("host:notaport".parse::<NodeId>().is_err());
        assert!("host:70000".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_effective_timeout() {
        let options = BusOptions::default();
        assert_eq!(options.effective_timeout(&DeliveryOptions::new()), None);
        assert_eq!(
            options.effective_timeout(&DeliveryOptions::new().with_timeout(50)),
            Some(Duration::from_millis(50))
        );

        let options = BusOptions::default().with_default_timeout(30_000);
        assert_eq!(
            options.effective_timeout(&DeliveryOptions::new()),
            Some(Duration::from_millis(30_000))
        );
        assert_eq!(
            options.effective_timeout(&DeliveryOptions::new().with_timeout(10)),
            Some(Duration::from_millis(10))
        );
    }

    #[test]
    fn test_configuration_defaults() {
        let configuration = Configuration::default();
        assert_eq!(configuration.bus_port(), DEFAULT_BUS_PORT);
        assert_eq!(configuration.default_timeout_ms(), 0);
        assert_eq!(configuration.max_frame_size(), DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(configuration.node_count(), 1);
        assert_eq!(configuration.ping_interval_ms(), 1000);
    }

    #[test]
    fn test_configuration_overrides() {
        let config = config::Config::builder()
            .set_override("courier.bus.host", "bus.local")
            .unwrap()
            .set_override("courier.bus.port", 6000)
            .unwrap()
            .set_override("courier.bus.default-timeout", 2500)
            .unwrap()
            .set_override("courier.node.count", 3)
            .unwrap()
            .build()
            .unwrap();

        let options = Configuration::from_config(config).to_bus_options();
        assert_eq!(options.node_id(), NodeId::new("bus.local", 6000));
        assert_eq!(options.default_timeout_ms, 2500);
    }
}
