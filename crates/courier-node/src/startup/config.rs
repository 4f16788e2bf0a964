//! Configuration loading for the courier node
//!
//! Sources in increasing priority: the YAML file, `COURIER__*` environment
//! variables, then command line flags.

use anyhow::Context as _;
use clap::Parser;
use config::{Config, Environment, File};

use courier_core::Configuration;

/// Command line arguments for the node
#[derive(Debug, Parser)]
#[command(name = "courier-node", version, about = "Runs Courier event bus nodes")]
pub struct Cli {
    /// Configuration file; missing files are ignored
    #[arg(short = 'c', long = "config", default_value = "conf/application.yml")]
    pub config: String,

    #[arg(long = "host", env = "COURIER_HOST")]
    pub host: Option<String>,

    #[arg(short = 'p', long = "port", env = "COURIER_PORT")]
    pub port: Option<u16>,

    /// Number of in-process nodes
    #[arg(short = 'n', long = "nodes")]
    pub nodes: Option<u16>,

    /// Default reply timeout in milliseconds
    #[arg(short = 't', long = "timeout")]
    pub default_timeout: Option<u64>,

    #[arg(long = "log-level")]
    pub log_level: Option<String>,
}

/// Build the layered configuration for `cli`.
pub fn load_configuration(cli: &Cli) -> anyhow::Result<Configuration> {
    let mut builder = Config::builder()
        .add_source(File::with_name(&cli.config).required(false))
        .add_source(
            Environment::with_prefix("COURIER")
                .keep_prefix(true)
                .separator("__")
                .try_parsing(true),
        );

    if let Some(host) = &cli.host {
        builder = builder.set_override("courier.bus.host", host.as_str())?;
    }
    if let Some(port) = cli.port {
        builder = builder.set_override("courier.bus.port", i64::from(port))?;
    }
    if let Some(nodes) = cli.nodes {
        builder = builder.set_override("courier.node.count", i64::from(nodes))?;
    }
    if let Some(timeout) = cli.default_timeout {
        builder = builder.set_override(
            "courier.bus.default-timeout",
            i64::try_from(timeout).unwrap_or(i64::MAX),
        )?;
    }
    if let Some(level) = &cli.log_level {
        builder = builder.set_override("courier.log.level", level.as_str())?;
    }

    let config = builder
        .build()
        .with_context(|| format!("Failed to build configuration from {}", cli.config))?;
    Ok(Configuration::from_config(config))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("courier-node").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let configuration =
            load_configuration(&cli(&["--config", "/nonexistent/courier.yml"])).unwrap();
        assert_eq!(configuration.bus_port(), 5701);
        assert_eq!(configuration.default_timeout_ms(), 0);
        assert_eq!(configuration.node_count(), 1);
    }

    #[test]
    fn test_file_values() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(
            file,
            "courier:\n  bus:\n    host: 10.1.1.1\n    port: 7000\n    default-timeout: 250\n  node:\n    count: 3"
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let configuration = load_configuration(&cli(&["--config", &path])).unwrap();
        assert_eq!(configuration.bus_host(), "10.1.1.1");
        assert_eq!(configuration.bus_port(), 7000);
        assert_eq!(configuration.default_timeout_ms(), 250);
        assert_eq!(configuration.node_count(), 3);
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(file, "courier:\n  bus:\n    port: 7000").unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let configuration = load_configuration(&cli(&[
            "--config", &path, "--port", "7100", "--nodes", "2", "--timeout", "40",
        ]))
        .unwrap();
        assert_eq!(configuration.bus_port(), 7100);
        assert_eq!(configuration.node_count(), 2);
        assert_eq!(configuration.default_timeout_ms(), 40);
    }
}
