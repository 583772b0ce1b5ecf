//! Tracing setup for the loop-algorithm binary.
//!
//! Everything is written to stderr; stdout carries only the JSON result.

use crate::config::LoggingConfig;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Level used when neither `RUST_LOG` nor the caller names a valid one
pub const FALLBACK_LEVEL: &str = "warn";

/// Initialize logging from the `[logging]` config section
pub fn init(config: &LoggingConfig) {
    init_with_level(&config.level)
}

/// Initialize logging with a specific default level
///
/// `RUST_LOG` still takes precedence. An unparseable `default_level` falls
/// back to [`FALLBACK_LEVEL`]. Calling this twice keeps the first subscriber.
pub fn init_with_level(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new(FALLBACK_LEVEL));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .try_init();

    if installed.is_err() {
        debug!("Logging already initialized");
    }
}

/// Initialize logging for testing (captures logs for test output)
#[cfg(test)]
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::new("debug"))
        .try_init();
}
