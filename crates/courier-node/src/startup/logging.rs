//! Logging setup for the courier node.
//!
//! Console output is always human readable. When file logging is on, all
//! events also go to `courier.log` in the log directory, rotated daily.
//!
//! `RUST_LOG` overrides the configured level for both outputs.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use courier_core::Configuration;

const LOG_FILE_NAME: &str = "courier.log";

/// Raw `courier.log` section of the configuration
#[derive(Debug, Default, Deserialize)]
struct LogSection {
    dir: Option<String>,
    level: Option<String>,
    file: Option<bool>,
    console: Option<bool>,
}

/// Logging configuration for the node
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Directory of `courier.log` (default: `~/courier/logs`)
    pub log_dir: PathBuf,
    pub console_output: bool,
    pub file_logging: bool,
    pub level: Level,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            console_output: true,
            file_logging: false,
            level: Level::INFO,
        }
    }
}

impl LoggingConfig {
    /// Read the `courier.log` section; missing or invalid values fall back to defaults.
    pub fn from_configuration(configuration: &Configuration) -> Self {
        let section: LogSection = configuration
            .config
            .get("courier.log")
            .unwrap_or_default();
        let defaults = Self::default();

        Self {
            log_dir: section.dir.map(PathBuf::from).unwrap_or(defaults.log_dir),
            console_output: section.console.unwrap_or(defaults.console_output),
            file_logging: section.file.unwrap_or(defaults.file_logging),
            level: section
                .level
                .and_then(|level| level.parse().ok())
                .unwrap_or(defaults.level),
        }
    }
}

fn default_log_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(format!("{}/courier/logs", home))
}

/// Keeps the non-blocking file writer alive; drop it last to flush buffered output.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global tracing subscriber.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<LoggingGuard> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let mut file_guard = None;

    if config.console_output {
        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_filter(env_filter(config.level));
        layers.push(Box::new(console_layer));
    }

    if config.file_logging {
        std::fs::create_dir_all(&config.log_dir)?;
        let appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, LOG_FILE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);

        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_filter(env_filter(config.level));
        layers.push(Box::new(file_layer));
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    if config.file_logging {
        tracing::info!(
            log_dir = %config.log_dir.display(),
            "File logging initialized: {}",
            LOG_FILE_NAME
        );
    }

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configuration(yaml: &str) -> Configuration {
        let config = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap();
        Configuration::from_config(config)
    }

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::from_configuration(&Configuration::default());
        assert!(config.console_output);
        assert!(!config.file_logging);
        assert_eq!(config.level, Level::INFO);
    }

    #[test]
    fn test_logging_config_from_configuration() {
        let config = LoggingConfig::from_configuration(&configuration(
            "courier:\n  log:\n    dir: /tmp/courier-test\n    level: debug\n    file: true\n    console: false",
        ));
        assert_eq!(config.log_dir, PathBuf::from("/tmp/courier-test"));
        assert_eq!(config.level, Level::DEBUG);
        assert!(config.file_logging);
        assert!(!config.console_output);
    }

    #[test]
    fn test_invalid_level_falls_back() {
        let config =
            LoggingConfig::from_configuration(&configuration("courier:\n  log:\n    level: loud"));
        assert_eq!(config.level, Level::INFO);
    }
}
