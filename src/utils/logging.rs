//! Structured logging configuration.
//!
//! Installs a global `tracing` subscriber from a
//! [`LoggingConfig`](crate::config::LoggingConfig). `RUST_LOG` still takes
//! precedence over the configured level. When file logging is enabled the
//! file is the sole output.

use std::sync::Mutex;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{Result, WireError};

/// Installs the global subscriber. Fails if one is already set.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.log_level).into())
        .from_env_lossy();

    if config.log_to_file {
        let path = config.log_file_path.as_deref().ok_or_else(|| {
            WireError::Config("log_file_path must be set when log_to_file is true".into())
        })?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| WireError::Config(format!("Failed to open log file '{path}': {e}")))?;
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false);
        if config.json_format {
            builder
                .json()
                .try_init()
                .map_err(|e| WireError::Config(format!("Failed to install subscriber: {e}")))
        } else {
            builder
                .try_init()
                .map_err(|e| WireError::Config(format!("Failed to install subscriber: {e}")))
        }
    } else {
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        if config.json_format {
            builder
                .json()
                .try_init()
                .map_err(|e| WireError::Config(format!("Failed to install subscriber: {e}")))
        } else {
            builder
                .try_init()
                .map_err(|e| WireError::Config(format!("Failed to install subscriber: {e}")))
        }
    }
}
