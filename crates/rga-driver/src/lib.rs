//! Driver for Stanford Research Systems RGA100/RGA200/RGA300 residual gas
//! analyzers.
//!
//! - [`commands`]: typed command descriptors and the component core
//! - [`components`]: ionizer, filament, CEM, pressure, QMF tuning and status
//! - [`scans`]: analog, histogram, single- and multi-mass acquisition
//! - [`error_codes`]: status register decoding
//! - [`sicp`]: UDP discovery and network reconfiguration of Ethernet adapters
//! - [`rga`]: the identified session tying it all together

pub mod commands;
pub mod components;
pub mod error_codes;
pub mod rga;
pub mod scans;
pub mod sicp;

pub use commands::{AnyCommand, Command, ParamValue};
pub use components::IonizerSettings;
pub use error_codes::Subsystem;
pub use rga::{Identity, Rga, PARAMETER_NAMES};
pub use scans::{MaxMass, ScanEvent, ScanKind, ScanParameters, ScanSettings, ScanState};
pub use sicp::{Packet, ShortStatus, Sicp};

pub use rga_core::transport::available_serial_ports;
pub use rga_core::{RgaConfig, RgaError, RgaResult, Transport};
