//! Error types for RGA communication and data acquisition.
//!
//! `RgaError` is the single error type returned by every fallible operation in
//! the transport, the command registry, the scan engine and the discovery
//! protocol. Variants are grouped the same way callers need to react to them:
//!
//! - **Transport failures** (`Communication`, `Io`, `Disconnected`): the byte
//!   stream timed out, closed or produced a frame the protocol cannot accept.
//!   These are never retried inside the driver.
//! - **Command failures** (`Set`, `Query`): a single command round trip failed
//!   or its reply could not be converted. The offending command string is
//!   carried for diagnostics.
//! - **Session setup** (`Identification`, `Configuration`).
//! - **Protocol/table mismatches** (`InvalidPacket`, `UnknownErrorCode`).
//! - **Usage errors** (`ScanInProgress`, `InvalidParameter`).

use thiserror::Error;

/// Convenience alias for results using [`RgaError`].
pub type RgaResult<T> = std::result::Result<T, RgaError>;

/// Primary error type for RGA instrument control.
#[derive(Error, Debug)]
pub enum RgaError {
    /// Transport-level failure: timeout or malformed framing.
    ///
    /// **Recovery Strategy**: surface to the caller. A timeout during a scan
    /// usually means the instrument was power-cycled or the cable was pulled.
    #[error("Communication error: {0}")]
    Communication(String),

    /// Underlying I/O error from the serial port or socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the stream (EOF on read).
    ///
    /// Closing the transport is the only way to stop a scan that is in
    /// progress, so the scan engine reports this as an aborted scan.
    #[error("Connection closed by instrument")]
    Disconnected,

    /// A set command failed to complete or returned a non-integer status.
    #[error("Error during setting: CMD: {command} ({reason})")]
    Set { command: String, reason: String },

    /// A query failed to complete or its reply failed conversion.
    #[error("Error during querying: CMD: {command} ({reason})")]
    Query { command: String, reason: String },

    /// The identification reply does not belong to a supported instrument.
    #[error("Invalid instrument: {0}")]
    Identification(String),

    /// A discovery packet has the wrong length or header.
    #[error("Invalid SICP packet: {0}")]
    InvalidPacket(String),

    /// A status code is missing from the fixed description table.
    #[error("Unknown error code: {0}")]
    UnknownErrorCode(String),

    /// Configuration failed to load or validate.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A scan was started while another one is still running.
    #[error("A scan is already in progress")]
    ScanInProgress,

    /// Caller supplied a value the operation cannot use.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl RgaError {
    /// True for failures of the byte stream itself, as opposed to
    /// protocol or usage errors.
    pub fn is_communication(&self) -> bool {
        matches!(
            self,
            RgaError::Communication(_) | RgaError::Io(_) | RgaError::Disconnected
        )
    }

    pub(crate) fn timeout(command: &str) -> Self {
        RgaError::Communication(format!("timed out waiting for reply to '{}'", command))
    }
}

impl From<figment::Error> for RgaError {
    fn from(err: figment::Error) -> Self {
        RgaError::Configuration(err.to_string())
    }
}
