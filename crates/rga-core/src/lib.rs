//! Shared plumbing for SRS RGA100/200/300 residual gas analyzers.
//!
//! - [`transport`]: exclusive-access byte session over RS-232 or TCP
//! - [`config`]: figment-backed session configuration
//! - [`error`]: the crate-wide [`RgaError`]
//! - [`logging`]: tracing subscriber setup

pub mod config;
pub mod error;
pub mod logging;
pub mod transport;

pub use config::{ConnectionConfig, RgaConfig, RGA_BAUD_RATE, RGA_TCP_PORT};
pub use error::{RgaError, RgaResult};
pub use transport::{Transport, TransportGuard, TransportSettings};
