//! Configuration for an RGA session.
//!
//! Configuration is loaded from:
//! 1. A TOML file (base configuration)
//! 2. Environment variables prefixed with `RGA_`, using `__` as the section
//!    separator (e.g. `RGA_TIMEOUTS__COMMAND_MS=5000`)
//!
//! ```toml
//! [connection]
//! type = "serial"
//! port = "/dev/ttyUSB0"
//!
//! [timeouts]
//! command_ms = 3000
//!
//! [scan]
//! progress_period_ms = 250
//! ```

use crate::error::{RgaError, RgaResult};
use crate::logging::OutputFormat;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Baud rate of the instrument's RS-232 port. The instrument speaks nothing else.
pub const RGA_BAUD_RATE: u32 = 28800;

/// TCP port of the Ethernet adapter, also used for SICP discovery.
pub const RGA_TCP_PORT: u16 = 818;

/// Top-level session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RgaConfig {
    /// How to reach the instrument
    pub connection: ConnectionConfig,
    /// Command timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Scan engine settings
    #[serde(default)]
    pub scan: ScanConfig,
    /// SICP discovery settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Tracing output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Transport selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    /// Native RS-232 port (28800 baud, 8N1, RTS/CTS)
    Serial {
        /// Serial port path (e.g., "/dev/ttyUSB0", "COM3")
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    /// RGA Ethernet adapter
    Tcp {
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
        #[serde(default = "default_credential")]
        user_id: String,
        #[serde(default = "default_credential")]
        password: String,
    },
}

/// Command timeout settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Timeout for ordinary query/reply exchanges
    #[serde(default = "default_command_ms")]
    pub command_ms: u64,
    /// Timeout for status-returning sets and binary scan reads
    #[serde(default = "default_long_command_ms")]
    pub long_command_ms: u64,
    /// Timeout for `CA` / `CL` calibration commands
    #[serde(default = "default_calibration_s")]
    pub calibration_s: u64,
}

/// Scan engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Minimum interval between progress events during a scan
    #[serde(default = "default_progress_period_ms")]
    pub progress_period_ms: u64,
}

/// SICP discovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// How long to collect replies after a broadcast call
    #[serde(default = "default_discovery_timeout_ms")]
    pub timeout_ms: u64,
}

/// Tracing output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: OutputFormat,
}

// Default value functions
fn default_baud_rate() -> u32 {
    RGA_BAUD_RATE
}

fn default_tcp_port() -> u16 {
    RGA_TCP_PORT
}

fn default_credential() -> String {
    "admin".to_string()
}

fn default_command_ms() -> u64 {
    3000
}

fn default_long_command_ms() -> u64 {
    20_000
}

fn default_calibration_s() -> u64 {
    120
}

fn default_progress_period_ms() -> u64 {
    250
}

fn default_discovery_timeout_ms() -> u64 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_ms: default_command_ms(),
            long_command_ms: default_long_command_ms(),
            calibration_s: default_calibration_s(),
        }
    }
}

impl TimeoutConfig {
    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    pub fn long_command(&self) -> Duration {
        Duration::from_millis(self.long_command_ms)
    }

    pub fn calibration(&self) -> Duration {
        Duration::from_secs(self.calibration_s)
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            progress_period_ms: default_progress_period_ms(),
        }
    }
}

impl ScanConfig {
    pub fn progress_period(&self) -> Duration {
        Duration::from_millis(self.progress_period_ms)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_discovery_timeout_ms(),
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: OutputFormat::default(),
        }
    }
}

impl RgaConfig {
    /// Serial session with default timeouts.
    pub fn serial(port: impl Into<String>) -> Self {
        Self::with_connection(ConnectionConfig::Serial {
            port: port.into(),
            baud_rate: RGA_BAUD_RATE,
        })
    }

    /// TCP session through the Ethernet adapter with default credentials.
    pub fn tcp(host: impl Into<String>) -> Self {
        Self::with_connection(ConnectionConfig::Tcp {
            host: host.into(),
            port: RGA_TCP_PORT,
            user_id: default_credential(),
            password: default_credential(),
        })
    }

    fn with_connection(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            timeouts: TimeoutConfig::default(),
            scan: ScanConfig::default(),
            discovery: DiscoveryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file merged with `RGA_` environment variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> RgaResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RGA_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from an in-memory TOML document.
    pub fn from_toml_str(source: &str) -> RgaResult<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| RgaError::Configuration(format!("Invalid RGA config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Convert a TOML table (e.g. one entry of a larger instrument list).
    pub fn from_toml(value: toml::Value) -> RgaResult<Self> {
        let config: Self = value
            .try_into()
            .map_err(|e| RgaError::Configuration(format!("Invalid RGA config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> RgaResult<()> {
        match &self.connection {
            ConnectionConfig::Serial { port, baud_rate } => {
                if port.trim().is_empty() {
                    return Err(RgaError::Configuration(
                        "serial port path must not be empty".into(),
                    ));
                }
                if *baud_rate != RGA_BAUD_RATE {
                    tracing::warn!(
                        "baud rate {} configured, but the RGA only supports {}",
                        baud_rate,
                        RGA_BAUD_RATE
                    );
                }
            }
            ConnectionConfig::Tcp { host, port, .. } => {
                if host.trim().is_empty() {
                    return Err(RgaError::Configuration("TCP host must not be empty".into()));
                }
                if *port == 0 {
                    return Err(RgaError::Configuration("TCP port must not be 0".into()));
                }
            }
        }

        if self.timeouts.command_ms == 0
            || self.timeouts.long_command_ms == 0
            || self.timeouts.calibration_s == 0
        {
            return Err(RgaError::Configuration("timeouts must be positive".into()));
        }
        if self.timeouts.long_command_ms < self.timeouts.command_ms {
            return Err(RgaError::Configuration(format!(
                "long_command_ms ({}) must not be shorter than command_ms ({})",
                self.timeouts.long_command_ms, self.timeouts.command_ms
            )));
        }
        if self.discovery.timeout_ms == 0 {
            return Err(RgaError::Configuration(
                "discovery timeout must be positive".into(),
            ));
        }

        self.logging.tracing_level()?;

        Ok(())
    }
}
