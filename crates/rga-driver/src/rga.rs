//! SRS RGA100/200/300 device session.
//!
//! Protocol overview:
//! - Serial: 28800 baud, 8N1, RTS/CTS; or TCP port 818 through the Ethernet adapter
//! - Commands: two-letter mnemonics, CR-terminated, no space before a parameter
//! - Replies: ASCII terminated by `\n\r`, except total pressure and scan
//!   samples which are 4-byte little-endian signed integers
//! - Identification: `ID?` returns e.g. `SRSRGA200VER0.24SN19281`
//!
//! # Usage
//!
//! ```rust,ignore
//! use rga_core::RgaConfig;
//! use rga_driver::{Rga, ScanParameters};
//!
//! let rga = Rga::connect(&RgaConfig::serial("/dev/ttyUSB0")).await?;
//! rga.filament.turn_on(1.0).await?;
//! rga.scan.set_parameters(ScanParameters::default()).await?;
//!
//! let masses = rga.scan.mass_axis(true).await?;
//! let currents = rga.scan.analog_scan().await?;
//! rga.filament.turn_off().await?;
//! ```

use crate::commands::{AnyCommand, ComponentCore, ParamValue};
use crate::components::{
    Cem, Filament, Ionizer, Pressure, Qmf, Status, CEM_STORED_GAIN, CEM_STORED_VOLTAGE,
    CEM_VOLTAGE, DC_OFFSET, DC_SLOPE, ELECTRON_ENERGY, EMISSION_CURRENT, ERROR_STATUS,
    FOCUS_VOLTAGE, ION_ENERGY, PARTIAL_PRESSURE_SENSITIVITY, RF_OFFSET, RF_SLOPE,
    TOTAL_PRESSURE_ENABLE, TOTAL_PRESSURE_SENSITIVITY,
};
use crate::scans::{
    MaxMass, ScanSettings, Scans, RESOLUTION, SCAN_SPEED, TOTAL_POINTS_ANALOG,
    TOTAL_POINTS_HISTOGRAM,
};
use rga_core::config::TimeoutConfig;
use rga_core::{RgaConfig, RgaError, RgaResult, Transport};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Substring every supported identification reply contains.
pub const ID_STRING: &str = "SRSRGA";

const MIN_ID_LEN: usize = 20;

/// Quiet period used to flush stale bytes after opening the port.
const CONNECT_DRAIN: Duration = Duration::from_millis(50);

/// Commands whose set form answers with a status byte.
const STATUS_SET_PREFIXES: [&str; 6] = ["FL", "HV", "VF", "EE", "IE", "IN"];

/// Names accepted by [`Rga::get_parameter`] and [`Rga::set_parameter`].
pub const PARAMETER_NAMES: &[&str] = &[
    "ionizer.electron_energy",
    "ionizer.ion_energy",
    "ionizer.focus_voltage",
    "ionizer.emission_current",
    "cem.voltage",
    "cem.stored_voltage",
    "cem.stored_gain",
    "pressure.partial_pressure_sensitivity",
    "pressure.total_pressure_sensitivity",
    "pressure.total_pressure_enable",
    "scan.initial_mass",
    "scan.final_mass",
    "scan.speed",
    "scan.resolution",
    "scan.total_points_analog",
    "scan.total_points_histogram",
    "qmf.rf.slope",
    "qmf.rf.offset",
    "qmf.dc.slope",
    "qmf.dc.offset",
    "status.error_status",
];

// =============================================================================
// Identity
// =============================================================================

/// Parsed identification reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id_string: String,
    pub model_name: String,
    pub firmware_version: String,
    pub serial_number: String,
    pub max_mass: MaxMass,
}

impl Identity {
    /// Parse a fixed-width `ID?` reply.
    ///
    /// Bytes 0..9 are the model, 6..9 the maximum mass (`???` on an
    /// uninitialised unit, read as 100), 12..16 the firmware version and 18..
    /// the serial number.
    pub fn parse(reply: &str) -> RgaResult<Self> {
        let reply = reply.trim();
        if !reply.contains(ID_STRING) {
            return Err(RgaError::Identification(format!(
                "{} not in {}",
                ID_STRING, reply
            )));
        }
        if reply.len() < MIN_ID_LEN {
            return Err(RgaError::Identification(format!(
                "identification reply too short: {:?}",
                reply
            )));
        }

        let field = |range: std::ops::Range<usize>| reply.get(range).unwrap_or("").to_string();
        let reported_mass = reply
            .get(6..9)
            .and_then(|m| m.trim().parse::<i64>().ok())
            .unwrap_or(100);

        Ok(Self {
            id_string: reply.to_string(),
            model_name: field(0..9),
            firmware_version: field(12..16),
            serial_number: reply.get(18..).unwrap_or("").to_string(),
            max_mass: MaxMass::from_reported(reported_mass),
        })
    }
}

// =============================================================================
// Rga
// =============================================================================

/// A connected, identified RGA.
#[derive(Debug)]
pub struct Rga {
    transport: Arc<Transport>,
    identity: Identity,
    calibration_timeout: Duration,
    pub ionizer: Ionizer,
    pub filament: Filament,
    pub cem: Cem,
    pub pressure: Pressure,
    pub qmf: Qmf,
    pub status: Status,
    pub scan: Scans,
}

impl Rga {
    /// Open the configured transport, flush stale input and identify.
    #[instrument(skip(config), err)]
    pub async fn connect(config: &RgaConfig) -> RgaResult<Self> {
        config.validate()?;
        let transport = Transport::open(config).await?;
        transport.drain(CONNECT_DRAIN).await;
        Ok(Self::from_transport(transport, ScanSettings::from(&config.scan))
            .await?
            .with_calibration_timeout(config.timeouts.calibration()))
    }

    /// Identify the instrument on an already-open transport.
    pub async fn from_transport(transport: Transport, settings: ScanSettings) -> RgaResult<Self> {
        let reply = transport.query_text("ID?").await?;
        let identity = Identity::parse(&reply)?;
        tracing::info!(
            "Connected to {} (firmware {}, serial {}, max mass {})",
            identity.model_name,
            identity.firmware_version,
            identity.serial_number,
            identity.max_mass.amu()
        );

        let transport = Arc::new(transport);
        Ok(Self {
            ionizer: Ionizer::new(transport.clone()),
            filament: Filament::new(transport.clone()),
            cem: Cem::new(transport.clone()),
            pressure: Pressure::new(transport.clone()),
            qmf: Qmf::new(transport.clone()),
            status: Status::new(transport.clone()),
            scan: Scans::new(transport.clone(), identity.max_mass, settings),
            calibration_timeout: TimeoutConfig::default().calibration(),
            identity,
            transport,
        })
    }

    pub fn with_calibration_timeout(mut self, timeout: Duration) -> Self {
        self.calibration_timeout = timeout;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn max_mass(&self) -> MaxMass {
        self.identity.max_mass
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    // -------------------------------------------------------------------------
    // Device operations
    // -------------------------------------------------------------------------

    /// Reset to factory defaults (`IN2`).
    #[instrument(skip(self))]
    pub async fn reset(&self) -> RgaResult<i32> {
        let reply = self
            .transport
            .query_text_with_long_timeout("IN2", None)
            .await?;
        parse_status("IN2", &reply)
    }

    /// Calibrate all (`CA`); returns the error status byte.
    #[instrument(skip(self))]
    pub async fn calibrate_all(&self) -> RgaResult<i32> {
        self.calibrate("CA").await
    }

    /// Calibrate the electrometer I-V response (`CL`).
    #[instrument(skip(self))]
    pub async fn calibrate_electrometer(&self) -> RgaResult<i32> {
        self.calibrate("CL").await
    }

    async fn calibrate(&self, command: &str) -> RgaResult<i32> {
        tracing::info!("Calibration {} started", command);
        let reply = self
            .transport
            .query_text_with_long_timeout(command, Some(self.calibration_timeout))
            .await?;
        let status = parse_status(command, &reply)?;
        tracing::info!("Calibration {} finished with status {}", command, status);
        Ok(status)
    }

    /// Emission current, CEM voltage and error text.
    pub async fn status_summary(&self) -> RgaResult<String> {
        let emission = self.ionizer.emission_current().await?;
        let hv = self.cem.voltage().await?;
        let errors = self.status.error_text().await?;
        Ok(format!(
            "Emission current: {:.2} mA\nCEM HV: {} V\n{}",
            emission, hv, errors
        ))
    }

    /// Raw command passthrough for interactive hosts.
    ///
    /// Queries and status-returning sets return the reply text, `MR<mass>`
    /// returns the measured intensity, `SC`/`HS` run a full scan. Anything
    /// else is sent without waiting for a reply.
    #[instrument(skip(self))]
    pub async fn handle_command(&self, raw: &str) -> RgaResult<String> {
        let cmd = raw.trim().to_uppercase();

        if cmd == "TP?" {
            return Ok(self.pressure.total_pressure().await?.to_string());
        }
        if cmd.contains('?') {
            return self.transport.query_text(&cmd).await;
        }
        if STATUS_SET_PREFIXES.iter().any(|p| cmd.starts_with(p)) {
            return self.transport.query_text_with_long_timeout(&cmd, None).await;
        }
        if let Some(mass) = cmd.strip_prefix("MR") {
            let mass: i64 = mass.trim().parse().map_err(|_| {
                RgaError::InvalidParameter(format!("invalid mass in '{}'", cmd))
            })?;
            return Ok(self.scan.single_mass_scan(mass).await?.to_string());
        }
        if cmd.starts_with("SC") && cmd.len() < 10 {
            self.scan.analog_scan().await?;
            return Ok("Scan Completed".to_string());
        }
        if cmd.starts_with("HS") {
            self.scan.histogram_scan().await?;
            return Ok("Scan Completed".to_string());
        }

        self.transport.send(&cmd).await?;
        Ok(String::new())
    }

    // -------------------------------------------------------------------------
    // Named parameters
    // -------------------------------------------------------------------------

    fn resolve(&self, name: &str) -> RgaResult<(&ComponentCore, AnyCommand)> {
        let resolved = match name {
            "ionizer.electron_energy" => (self.ionizer.core(), AnyCommand::Int(ELECTRON_ENERGY)),
            "ionizer.ion_energy" => (self.ionizer.core(), AnyCommand::Int(ION_ENERGY)),
            "ionizer.focus_voltage" => (self.ionizer.core(), AnyCommand::Int(FOCUS_VOLTAGE)),
            "ionizer.emission_current" => {
                (self.ionizer.core(), AnyCommand::Float(EMISSION_CURRENT))
            }
            "cem.voltage" => (self.cem.core(), AnyCommand::Int(CEM_VOLTAGE)),
            "cem.stored_voltage" => (self.cem.core(), AnyCommand::Float(CEM_STORED_VOLTAGE)),
            "cem.stored_gain" => (self.cem.core(), AnyCommand::Float(CEM_STORED_GAIN)),
            "pressure.partial_pressure_sensitivity" => (
                self.pressure.core(),
                AnyCommand::Float(PARTIAL_PRESSURE_SENSITIVITY),
            ),
            "pressure.total_pressure_sensitivity" => (
                self.pressure.core(),
                AnyCommand::Float(TOTAL_PRESSURE_SENSITIVITY),
            ),
            "pressure.total_pressure_enable" => {
                (self.pressure.core(), AnyCommand::Bool(TOTAL_PRESSURE_ENABLE))
            }
            "scan.initial_mass" => (
                self.scan.core(),
                AnyCommand::Int(*self.scan.initial_mass_command()),
            ),
            "scan.final_mass" => (
                self.scan.core(),
                AnyCommand::Int(*self.scan.final_mass_command()),
            ),
            "scan.speed" => (self.scan.core(), AnyCommand::Int(SCAN_SPEED)),
            "scan.resolution" => (self.scan.core(), AnyCommand::Int(RESOLUTION)),
            "scan.total_points_analog" => (self.scan.core(), AnyCommand::Int(TOTAL_POINTS_ANALOG)),
            "scan.total_points_histogram" => {
                (self.scan.core(), AnyCommand::Int(TOTAL_POINTS_HISTOGRAM))
            }
            "qmf.rf.slope" => (self.qmf.rf.core(), AnyCommand::Float(RF_SLOPE)),
            "qmf.rf.offset" => (self.qmf.rf.core(), AnyCommand::Float(RF_OFFSET)),
            "qmf.dc.slope" => (self.qmf.dc.core(), AnyCommand::Float(DC_SLOPE)),
            "qmf.dc.offset" => (self.qmf.dc.core(), AnyCommand::Float(DC_OFFSET)),
            "status.error_status" => (self.status.core(), AnyCommand::Int(ERROR_STATUS)),
            _ => {
                return Err(RgaError::InvalidParameter(format!(
                    "unknown parameter '{}'",
                    name
                )))
            }
        };
        Ok(resolved)
    }

    /// Read a setting by `component.setting` name.
    pub async fn get_parameter(&self, name: &str) -> RgaResult<ParamValue> {
        let (core, command) = self.resolve(name)?;
        core.get_any(&command).await
    }

    /// Write a setting by name; returns the status byte for status-returning
    /// commands.
    #[instrument(skip(self))]
    pub async fn set_parameter(&self, name: &str, value: ParamValue) -> RgaResult<Option<i32>> {
        let (core, command) = self.resolve(name)?;
        core.set_any(&command, value).await
    }

    /// Descriptor metadata for a named setting.
    pub fn parameter_command(&self, name: &str) -> RgaResult<AnyCommand> {
        self.resolve(name).map(|(_, command)| command)
    }

    // -------------------------------------------------------------------------
    // Pressure
    // -------------------------------------------------------------------------

    pub async fn total_pressure_in_torr(&self) -> RgaResult<f64> {
        self.pressure.total_pressure_in_torr(&self.cem).await
    }

    /// The current spectrum converted to partial pressure in Torr.
    pub async fn partial_pressure_spectrum(&self) -> RgaResult<Vec<f64>> {
        let factor = self.pressure.partial_pressure_factor(&self.cem).await?;
        Ok(self
            .scan
            .spectrum()
            .await
            .into_iter()
            .map(|current| current * factor)
            .collect())
    }
}

fn parse_status(command: &str, reply: &str) -> RgaResult<i32> {
    reply.trim().parse().map_err(|_| RgaError::Query {
        command: command.to_string(),
        reason: format!("non-integer status '{}'", reply),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_rga200() {
        let id = Identity::parse("SRSRGA200VER0.24SN19281\n").unwrap();
        assert_eq!(id.model_name, "SRSRGA200");
        assert_eq!(id.firmware_version, "0.24");
        assert_eq!(id.serial_number, "19281");
        assert_eq!(id.max_mass, MaxMass::Rga200);
    }

    #[test]
    fn test_uninitialised_mass_field_reads_as_100() {
        let id = Identity::parse("SRSRGA???VER0.24SN00001").unwrap();
        assert_eq!(id.max_mass, MaxMass::Rga100);
    }

    #[test]
    fn test_odd_masses_round_down_to_model() {
        assert_eq!(
            Identity::parse("SRSRGA320VER0.24SN00001").unwrap().max_mass,
            MaxMass::Rga300
        );
        assert_eq!(
            Identity::parse("SRSRGA050VER0.24SN00001").unwrap().max_mass,
            MaxMass::Rga100
        );
    }

    #[test]
    fn test_foreign_instrument_is_rejected() {
        assert!(matches!(
            Identity::parse("Stanford_Research_Systems,SR830,s/n00111,ver1.07"),
            Err(RgaError::Identification(_))
        ));
        assert!(matches!(
            Identity::parse("SRSRGA100"),
            Err(RgaError::Identification(_))
        ));
    }

    #[test]
    fn test_parameter_names_are_unique() {
        let mut names = PARAMETER_NAMES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), PARAMETER_NAMES.len());
    }
}
