//! Tracing initialisation for hosts embedding the RGA driver.
//!
//! The driver itself only emits `tracing` events (wire traffic at `debug`,
//! identification and calibration at `info`, the scan buffer-overrun defect
//! and dropped discovery packets at `warn`). A host calls [`init_from_config`]
//! once to install a subscriber; `RUST_LOG` overrides the configured level.
//!
//! ```no_run
//! use rga_core::{config::RgaConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RgaConfig::load_from("rga.toml")?;
//! logging::init_from_config(&config)?;
//! # Ok(())
//! # }
//! ```

use crate::config::{LoggingConfig, RgaConfig};
use crate::error::{RgaError, RgaResult};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format for tracing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, coloured
    #[default]
    Pretty,
    /// One line per event, no colour
    Compact,
    /// Newline-delimited JSON
    Json,
}

impl LoggingConfig {
    pub fn tracing_level(&self) -> RgaResult<Level> {
        self.level.parse().map_err(|_| {
            RgaError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.level
            ))
        })
    }
}

/// Install the subscriber described by `config.logging`.
pub fn init_from_config(config: &RgaConfig) -> RgaResult<()> {
    init(config.logging.tracing_level()?, config.logging.format)
}

/// Install a global subscriber.
///
/// Succeeds without replacing anything when a subscriber is already set, so
/// tests and embedding hosts may call it more than once.
pub fn init(level: Level, format: OutputFormat) -> RgaResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let layer = match format {
        OutputFormat::Pretty => fmt::layer().pretty().with_filter(filter).boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(false)
            .with_filter(filter)
            .boxed(),
        OutputFormat::Json => fmt::layer().json().with_filter(filter).boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        Err(_) if tracing::dispatcher::has_been_set() => Ok(()),
        Err(e) => Err(RgaError::Configuration(format!(
            "Failed to initialize tracing: {}",
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_level_from_config() {
        let mut config = RgaConfig::serial("/dev/ttyUSB0");
        assert!(matches!(config.logging.tracing_level(), Ok(Level::INFO)));

        config.logging.level = "debug".into();
        assert!(matches!(config.logging.tracing_level(), Ok(Level::DEBUG)));

        config.logging.level = "loud".into();
        assert!(matches!(
            config.logging.tracing_level(),
            Err(RgaError::Configuration(_))
        ));
    }

    #[test]
    fn test_init_is_idempotent() {
        let mut config = RgaConfig::serial("/dev/ttyUSB0");
        config.logging.format = OutputFormat::Compact;
        assert!(init_from_config(&config).is_ok());
        assert!(init(Level::WARN, OutputFormat::Json).is_ok());
    }
}
