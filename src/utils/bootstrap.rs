//! Bootstrap utilities for switchboard processes.
//!
//! Shared initialization code for every binary built on the crate.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bus::{init_bus, BusError};
use crate::config::{Config, LOG_ENV_VAR};
use crate::registry::CallbackRegistry;
use crate::supervisor::SupervisorContext;

/// Initialize tracing with the SWITCHBOARD_LOG environment variable.
///
/// Defaults to "info" level if SWITCHBOARD_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Config file path from `--config <path>` or `--config=<path>`.
pub fn parse_config_path() -> Option<String> {
    parse_config_arg(std::env::args().skip(1))
}

fn parse_config_arg(mut args: impl Iterator<Item = String>) -> Option<String> {
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

/// Connect the configured bus and create the process-wide callback registry.
pub async fn init_context(config: &Config) -> Result<SupervisorContext, BusError> {
    let bus = init_bus(&config.messaging).await?;
    let registry = CallbackRegistry::new(config.callbacks.registry_config());
    Ok(SupervisorContext::new(bus, registry))
}
