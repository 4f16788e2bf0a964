//! Node startup: configuration, logging and shutdown handling.

mod config;
mod logging;
mod shutdown;

pub use config::{Cli, load_configuration};
pub use logging::{LoggingConfig, LoggingGuard, init_logging};
pub use shutdown::{ShutdownSignal, wait_for_shutdown_signal};
