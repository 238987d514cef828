//! Tracing initialization.
//!
//! Thin wrapper over `tracing-subscriber` so binaries, demos, and notebooks
//! embedding the crate get consistent structured logging. The filter defaults
//! to the configured level but still honors `RUST_LOG` when set.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Settings;

/// Initialize the global tracing subscriber from settings.
///
/// Safe to call more than once; later calls are no-ops (useful in tests).
pub fn init(settings: &Settings) {
    init_with_level(&settings.logging.level);
}

/// Initialize with an explicit level string (trace, debug, info, warn, error).
pub fn init_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    // try_init so embedding code that already installed a subscriber wins.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_with_level("info");
        init_with_level("debug");
        tracing::info!("logging initialized twice without panicking");
    }
}
