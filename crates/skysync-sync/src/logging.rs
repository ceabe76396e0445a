//! Tracing setup for binaries embedding the engine

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

use skysync_core::config::LoggingConfig;

/// Installs the global `tracing` subscriber
///
/// The filter comes from `RUST_LOG` when set, otherwise from
/// `config.level`. Output is JSON lines when `config.json` is set.
///
/// # Errors
///
/// Fails if the level is not a valid filter or a global subscriber is
/// already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("Failed to install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_rejected() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "not a level=???".to_string(),
            json: false,
        };
        assert!(init_tracing(&config).is_err());
    }
}
