//! Tracing subscriber setup.
//!
//! The library only emits `tracing` events; binaries and test harnesses call
//! [`init`] once to install a formatter. `RUST_LOG` wins over the configured
//! level when set.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::ApplicationConfig;

/// Build the filter: `RUST_LOG` if present, otherwise `level`.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber described by `config`.
///
/// Returns an error if a global subscriber is already set.
pub fn try_init(config: &ApplicationConfig) -> anyhow::Result<()> {
    let builder = fmt()
        .with_env_filter(env_filter(&config.log_level))
        .with_target(true);

    if config.log_json {
        builder
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to install JSON subscriber: {e}"))?;
    } else {
        builder
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to install subscriber: {e}"))?;
    }
    tracing::debug!(level = %config.log_level, json = config.log_json, "Logging initialised");
    Ok(())
}

/// Like [`try_init`], ignoring an already installed subscriber.
pub fn init(config: &ApplicationConfig) {
    if let Err(e) = try_init(config) {
        tracing::debug!("{e}");
    }
}
