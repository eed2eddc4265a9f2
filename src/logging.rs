//! Tracing subscriber setup.

use crate::config::ConsoleConfig;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Safe to call more
/// than once; later calls are ignored.
pub fn init_from_config(config: &ConsoleConfig) {
    init(&config.application.log_level, false);
}

/// Install the global subscriber with an explicit default level.
pub fn init(default_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("rf_console={default_level},warn")));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        tracing::debug!("tracing subscriber already installed: {e}");
    }
}
