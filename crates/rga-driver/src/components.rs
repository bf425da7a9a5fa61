//! Capability groups of the RGA.
//!
//! Each component owns a [`ComponentCore`] (shared transport plus its own
//! `last_set_status`) and the descriptors it issues. Components are created
//! once with the session and never re-parented. Where one component needs
//! another's state (pressure conversion needs the CEM voltage and gain) the
//! sibling is passed in explicitly.

use crate::commands::{
    ion_energy_from_wire, ion_energy_to_wire, stored_gain_from_wire, stored_gain_to_wire,
    BinaryQuery, Command, ComponentCore,
};
use crate::error_codes::{self, Subsystem};
use rga_core::{RgaError, RgaResult, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Factory defaults after `IN2`.
pub mod defaults {
    pub const ELECTRON_ENERGY: i64 = 70;
    pub const ION_ENERGY: i64 = 12;
    pub const FOCUS_VOLTAGE: i64 = 90;
    pub const INITIAL_MASS: i64 = 1;
    pub const SCAN_SPEED: i64 = 4;
    pub const STEPS_PER_AMU: i64 = 10;
    /// Final mass used when scan parameters are not given.
    pub const FINAL_MASS: i64 = 65;
    pub const EMISSION_CURRENT: f64 = 1.0;
    pub const DEGAS_MINUTES: u32 = 3;
}

// =============================================================================
// Descriptors
// =============================================================================

pub static ELECTRON_ENERGY: Command<i64> = Command::new("EE", "eV", 25.0, 105.0, 1.0, 0, 70.0);
pub static ION_ENERGY: Command<i64> = Command::new("IE", "eV", 8.0, 12.0, 4.0, 0, 12.0)
    .with_conversions(ion_energy_from_wire, ion_energy_to_wire);
pub static FOCUS_VOLTAGE: Command<i64> = Command::new("VF", "V", 0.0, 150.0, 1.0, 0, 90.0);
/// Setting 0 turns the filament off.
pub static EMISSION_CURRENT: Command<f64> = Command::new("FL", "mA", 0.0, 3.5, 0.01, 2, 1.0);

pub static CEM_VOLTAGE: Command<i64> = Command::new("HV", "V", 0.0, 2290.0, 1.0, 0, 0.0);
pub static CEM_STORED_VOLTAGE: Command<f64> =
    Command::new("MV", "V", 0.0, 2290.0, 1.0, 0, 0.0).plain();
/// Kept on the device divided by 1000.
pub static CEM_STORED_GAIN: Command<f64> = Command::new("MG", "", 0.0, 2_000_000.0, 1.0, 3, 0.0)
    .plain()
    .with_conversions(stored_gain_from_wire, stored_gain_to_wire);

/// Sensitivities go out with 4 decimals: one digit finer than the 0.001
/// mA/Torr step, so any value on the step grid is sent unrounded.
/// Values below 0.00005 mA/Torr are sent as zero.
pub static PARTIAL_PRESSURE_SENSITIVITY: Command<f64> =
    Command::new("SP", "mA/Torr", 0.0, 10.0, 0.001, 4, 0.1).plain();
pub static TOTAL_PRESSURE_SENSITIVITY: Command<f64> =
    Command::new("ST", "mA/Torr", 0.0, 100.0, 0.001, 4, 0.01).plain();
pub static TOTAL_PRESSURE_ENABLE: Command<bool> =
    Command::new("TP", "", 0.0, 1.0, 1.0, 0, 0.0).plain().write_only();
/// Total-pressure ion current in units of 1e-16 A.
pub static TOTAL_PRESSURE: BinaryQuery = BinaryQuery {
    mnemonic: "TP",
    unit: "x 10^-16 A",
};

pub static RF_SLOPE: Command<f64> = tuning("RS");
pub static RF_OFFSET: Command<f64> = tuning("RI");
pub static DC_SLOPE: Command<f64> = tuning("DS");
pub static DC_OFFSET: Command<f64> = tuning("DI");

const fn tuning(mnemonic: &'static str) -> Command<f64> {
    Command::new(mnemonic, "", f64::NEG_INFINITY, f64::INFINITY, 0.0001, 4, 0.0).plain()
}

pub static ERROR_STATUS: Command<i64> = Command::query_only("ER", "");

fn register_command(subsystem: Subsystem) -> Command<i64> {
    Command::query_only(subsystem.mnemonic(), "")
}

// =============================================================================
// Ionizer
// =============================================================================

/// Electron energy, ion energy and focus voltage as one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IonizerSettings {
    pub electron_energy: i64,
    pub ion_energy: i64,
    pub focus_voltage: i64,
}

impl Default for IonizerSettings {
    fn default() -> Self {
        Self {
            electron_energy: defaults::ELECTRON_ENERGY,
            ion_energy: defaults::ION_ENERGY,
            focus_voltage: defaults::FOCUS_VOLTAGE,
        }
    }
}

#[derive(Debug)]
pub struct Ionizer {
    core: ComponentCore,
}

impl Ionizer {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            core: ComponentCore::new(transport),
        }
    }

    pub(crate) fn core(&self) -> &ComponentCore {
        &self.core
    }

    /// Status byte of the last ionizer set.
    pub fn last_set_status(&self) -> i32 {
        self.core.last_set_status()
    }

    pub async fn electron_energy(&self) -> RgaResult<i64> {
        self.core.get(&ELECTRON_ENERGY).await
    }

    pub async fn set_electron_energy(&self, ev: i64) -> RgaResult<i32> {
        self.core.apply(&ELECTRON_ENERGY, ev).await
    }

    /// 8 or 12 eV.
    pub async fn ion_energy(&self) -> RgaResult<i64> {
        self.core.get(&ION_ENERGY).await
    }

    /// Values of 12 and above select 12 eV, anything lower 8 eV.
    pub async fn set_ion_energy(&self, ev: i64) -> RgaResult<i32> {
        self.core.apply(&ION_ENERGY, ev).await
    }

    pub async fn focus_voltage(&self) -> RgaResult<i64> {
        self.core.get(&FOCUS_VOLTAGE).await
    }

    pub async fn set_focus_voltage(&self, volts: i64) -> RgaResult<i32> {
        self.core.apply(&FOCUS_VOLTAGE, volts).await
    }

    pub async fn emission_current(&self) -> RgaResult<f64> {
        self.core.get(&EMISSION_CURRENT).await
    }

    pub async fn set_emission_current(&self, milliamps: f64) -> RgaResult<i32> {
        self.core.apply(&EMISSION_CURRENT, milliamps).await
    }

    pub async fn get_parameters(&self) -> RgaResult<IonizerSettings> {
        Ok(IonizerSettings {
            electron_energy: self.electron_energy().await?,
            ion_energy: self.ion_energy().await?,
            focus_voltage: self.focus_voltage().await?,
        })
    }

    /// Sequential sets; returns the status of the last one.
    pub async fn set_parameters(&self, settings: IonizerSettings) -> RgaResult<i32> {
        self.set_electron_energy(settings.electron_energy).await?;
        self.set_ion_energy(settings.ion_energy).await?;
        self.set_focus_voltage(settings.focus_voltage).await
    }
}

// =============================================================================
// Filament
// =============================================================================

#[derive(Debug)]
pub struct Filament {
    core: ComponentCore,
}

impl Filament {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            core: ComponentCore::new(transport),
        }
    }

    pub fn last_set_status(&self) -> i32 {
        self.core.last_set_status()
    }

    #[instrument(skip(self))]
    pub async fn turn_on(&self, target_emission_current: f64) -> RgaResult<i32> {
        self.core
            .apply(&EMISSION_CURRENT, target_emission_current)
            .await
    }

    #[instrument(skip(self))]
    pub async fn turn_off(&self) -> RgaResult<i32> {
        self.core.apply(&EMISSION_CURRENT, 0.0).await
    }

    /// Run a degas cycle.
    ///
    /// The instrument answers only when the cycle is over, so the transport
    /// stays blocked for `minutes * 65` seconds.
    #[instrument(skip(self))]
    pub async fn start_degas(&self, minutes: u32) -> RgaResult<String> {
        let command = format!("DG{}", minutes);
        let timeout = Duration::from_secs(u64::from(minutes) * 65);
        tracing::info!("Degas starting for {} min", minutes);
        let reply = self
            .core
            .transport()
            .query_text_with_long_timeout(&command, Some(timeout))
            .await?;
        tracing::info!("Degas finished");
        Ok(reply)
    }
}

// =============================================================================
// Electron multiplier
// =============================================================================

#[derive(Debug)]
pub struct Cem {
    core: ComponentCore,
}

impl Cem {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            core: ComponentCore::new(transport),
        }
    }

    pub(crate) fn core(&self) -> &ComponentCore {
        &self.core
    }

    pub fn last_set_status(&self) -> i32 {
        self.core.last_set_status()
    }

    /// High voltage currently applied.
    pub async fn voltage(&self) -> RgaResult<i64> {
        self.core.get(&CEM_VOLTAGE).await
    }

    pub async fn set_voltage(&self, volts: i64) -> RgaResult<i32> {
        self.core.apply(&CEM_VOLTAGE, volts).await
    }

    pub async fn stored_voltage(&self) -> RgaResult<f64> {
        self.core.get(&CEM_STORED_VOLTAGE).await
    }

    pub async fn set_stored_voltage(&self, volts: f64) -> RgaResult<()> {
        self.core.set(&CEM_STORED_VOLTAGE, volts).await.map(|_| ())
    }

    pub async fn stored_gain(&self) -> RgaResult<f64> {
        self.core.get(&CEM_STORED_GAIN).await
    }

    pub async fn set_stored_gain(&self, gain: f64) -> RgaResult<()> {
        self.core.set(&CEM_STORED_GAIN, gain).await.map(|_| ())
    }

    /// Apply the stored voltage.
    #[instrument(skip(self))]
    pub async fn turn_on(&self) -> RgaResult<i32> {
        let stored = self.stored_voltage().await?;
        self.set_voltage(stored.round() as i64).await
    }

    #[instrument(skip(self))]
    pub async fn turn_off(&self) -> RgaResult<i32> {
        self.set_voltage(0).await
    }
}

// =============================================================================
// Pressure
// =============================================================================

/// Multiplier voltage above which the stored gain applies.
const CEM_ACTIVE_VOLTS: i64 = 10;

#[derive(Debug)]
pub struct Pressure {
    core: ComponentCore,
}

impl Pressure {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            core: ComponentCore::new(transport),
        }
    }

    pub(crate) fn core(&self) -> &ComponentCore {
        &self.core
    }

    pub async fn partial_pressure_sensitivity(&self) -> RgaResult<f64> {
        self.core.get(&PARTIAL_PRESSURE_SENSITIVITY).await
    }

    pub async fn set_partial_pressure_sensitivity(&self, ma_per_torr: f64) -> RgaResult<()> {
        self.core
            .set(&PARTIAL_PRESSURE_SENSITIVITY, ma_per_torr)
            .await
            .map(|_| ())
    }

    pub async fn total_pressure_sensitivity(&self) -> RgaResult<f64> {
        self.core.get(&TOTAL_PRESSURE_SENSITIVITY).await
    }

    pub async fn set_total_pressure_sensitivity(&self, ma_per_torr: f64) -> RgaResult<()> {
        self.core
            .set(&TOTAL_PRESSURE_SENSITIVITY, ma_per_torr)
            .await
            .map(|_| ())
    }

    /// Switch total-pressure measurement on or off.
    pub async fn enable_total_pressure(&self, enabled: bool) -> RgaResult<()> {
        self.core
            .set(&TOTAL_PRESSURE_ENABLE, enabled)
            .await
            .map(|_| ())
    }

    /// Raw total-pressure ion current in units of 1e-16 A.
    pub async fn total_pressure(&self) -> RgaResult<i32> {
        TOTAL_PRESSURE.read(self.core.transport()).await
    }

    /// Total pressure in Torr.
    pub async fn total_pressure_in_torr(&self, cem: &Cem) -> RgaResult<f64> {
        let sensitivity = self.total_pressure_sensitivity().await?;
        let factor = conversion_factor(sensitivity, cem).await?;
        Ok(f64::from(self.total_pressure().await?) * factor)
    }

    /// Factor that turns a raw ion current (1e-16 A) into partial pressure in Torr.
    pub async fn partial_pressure_factor(&self, cem: &Cem) -> RgaResult<f64> {
        let sensitivity = self.partial_pressure_sensitivity().await?;
        conversion_factor(sensitivity, cem).await
    }
}

async fn conversion_factor(sensitivity: f64, cem: &Cem) -> RgaResult<f64> {
    if sensitivity == 0.0 {
        return Err(RgaError::InvalidParameter(
            "pressure sensitivity is zero".into(),
        ));
    }
    let mut factor = 1e-13 / sensitivity;
    if cem.voltage().await? > CEM_ACTIVE_VOLTS {
        let gain = cem.stored_gain().await?;
        if gain == 0.0 {
            return Err(RgaError::InvalidParameter("stored CEM gain is zero".into()));
        }
        factor /= gain;
    }
    Ok(factor)
}

// =============================================================================
// Mass filter tuning
// =============================================================================

/// Slope/offset pair of one mass-filter supply.
#[derive(Debug)]
pub struct Tuning {
    core: ComponentCore,
    slope: &'static Command<f64>,
    offset: &'static Command<f64>,
}

impl Tuning {
    fn new(
        transport: Arc<Transport>,
        slope: &'static Command<f64>,
        offset: &'static Command<f64>,
    ) -> Self {
        Self {
            core: ComponentCore::new(transport),
            slope,
            offset,
        }
    }

    pub(crate) fn core(&self) -> &ComponentCore {
        &self.core
    }

    pub async fn slope(&self) -> RgaResult<f64> {
        self.core.get(self.slope).await
    }

    pub async fn set_slope(&self, value: f64) -> RgaResult<()> {
        self.core.set(self.slope, value).await.map(|_| ())
    }

    pub async fn offset(&self) -> RgaResult<f64> {
        self.core.get(self.offset).await
    }

    pub async fn set_offset(&self, value: f64) -> RgaResult<()> {
        self.core.set(self.offset, value).await.map(|_| ())
    }
}

#[derive(Debug)]
pub struct Qmf {
    pub rf: Tuning,
    pub dc: Tuning,
}

impl Qmf {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            rf: Tuning::new(transport.clone(), &RF_SLOPE, &RF_OFFSET),
            dc: Tuning::new(transport, &DC_SLOPE, &DC_OFFSET),
        }
    }
}

// =============================================================================
// Status
// =============================================================================

#[derive(Debug)]
pub struct Status {
    core: ComponentCore,
}

impl Status {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            core: ComponentCore::new(transport),
        }
    }

    pub(crate) fn core(&self) -> &ComponentCore {
        &self.core
    }

    /// Raw `ID?` reply.
    pub async fn id_string(&self) -> RgaResult<String> {
        self.core.transport().query_text("ID?").await
    }

    /// Root error byte.
    pub async fn error_status(&self) -> RgaResult<u8> {
        Ok(low_byte(self.core.get(&ERROR_STATUS).await?))
    }

    /// Detail register of one subsystem.
    pub async fn error_register(&self, subsystem: Subsystem) -> RgaResult<u8> {
        Ok(low_byte(self.core.get(&register_command(subsystem)).await?))
    }

    /// Query the root byte and every flagged detail register, then decode.
    pub async fn errors(&self) -> RgaResult<Vec<&'static str>> {
        let root = self.error_status().await?;
        let mut registers = HashMap::new();
        for subsystem in Subsystem::ALL {
            if subsystem.is_flagged(root) {
                registers.insert(subsystem, self.error_register(subsystem).await?);
            }
        }
        Ok(error_codes::decode(root, |s| {
            registers.get(&s).copied().unwrap_or(0)
        }))
    }

    /// Current errors as human-readable text.
    pub async fn error_text(&self) -> RgaResult<String> {
        error_codes::error_text(&self.errors().await?)
    }
}

fn low_byte(register: i64) -> u8 {
    (register & 0xff) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Answer commands in order with canned replies; returns what was received.
    async fn script(host: DuplexStream, replies: Vec<&'static [u8]>) -> Vec<String> {
        let mut host = BufReader::new(host);
        let mut received = Vec::new();
        for reply in replies {
            let mut cmd = Vec::new();
            if host.read_until(b'\r', &mut cmd).await.unwrap() == 0 {
                break;
            }
            received.push(String::from_utf8_lossy(&cmd).trim().to_string());
            if !reply.is_empty() {
                host.get_mut().write_all(reply).await.unwrap();
            }
        }
        received
    }

    fn transport(device: DuplexStream) -> Arc<Transport> {
        Arc::new(Transport::new(Box::new(device), "duplex"))
    }

    #[tokio::test]
    async fn test_ionizer_set_parameters_returns_last_status() -> anyhow::Result<()> {
        let (host, device) = tokio::io::duplex(256);
        let ionizer = Ionizer::new(transport(device));
        let responder = tokio::spawn(script(host, vec![b"0\r", b"0\r", b"4\r"]));

        let status = ionizer
            .set_parameters(IonizerSettings {
                electron_energy: 70,
                ion_energy: 8,
                focus_voltage: 90,
            })
            .await?;
        assert_eq!(status, 4);
        assert_eq!(ionizer.last_set_status(), 4);
        assert_eq!(responder.await?, vec!["EE70", "IE0", "VF90"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_filament_turn_on_uses_emission_current() -> anyhow::Result<()> {
        let (host, device) = tokio::io::duplex(256);
        let filament = Filament::new(transport(device));
        let responder = tokio::spawn(script(host, vec![b"0\r", b"0\r"]));

        filament.turn_on(1.0).await?;
        filament.turn_off().await?;
        assert_eq!(responder.await?, vec!["FL1.00", "FL0.00"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_cem_turn_on_applies_stored_voltage() -> anyhow::Result<()> {
        let (host, device) = tokio::io::duplex(256);
        let cem = Cem::new(transport(device));
        let responder = tokio::spawn(script(host, vec![b"1400\r", b"0\r"]));

        assert_eq!(cem.turn_on().await?, 0);
        assert_eq!(responder.await?, vec!["MV?", "HV1400"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_total_pressure_factor_with_cem_off() -> anyhow::Result<()> {
        let (host, device) = tokio::io::duplex(256);
        let t = transport(device);
        let pressure = Pressure::new(t.clone());
        let cem = Cem::new(t);
        let responder = tokio::spawn(script(
            host,
            vec![b"0.5\r", b"0\r", &[0xe8, 0x03, 0x00, 0x00]],
        ));

        let torr = pressure.total_pressure_in_torr(&cem).await?;
        assert!((torr - 1000.0 * 1e-13 / 0.5).abs() < 1e-20);
        assert_eq!(responder.await?, vec!["ST?", "HV?", "TP?"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_partial_pressure_factor_divides_by_gain_when_cem_on() -> anyhow::Result<()> {
        let (host, device) = tokio::io::duplex(256);
        let t = transport(device);
        let pressure = Pressure::new(t.clone());
        let cem = Cem::new(t);
        let responder = tokio::spawn(script(host, vec![b"0.1\r", b"1400\r", b"1000.000\r"]));

        let factor = pressure.partial_pressure_factor(&cem).await?;
        assert!((factor - 1e-13 / 0.1 / 1_000_000.0).abs() < 1e-30);
        assert_eq!(responder.await?, vec!["SP?", "HV?", "MG?"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_status_errors_reads_flagged_registers() -> anyhow::Result<()> {
        let (host, device) = tokio::io::duplex(256);
        let status = Status::new(transport(device));
        let responder = tokio::spawn(script(host, vec![b"8\r", b"128\r"]));

        assert_eq!(status.errors().await?, vec!["EM7"]);
        assert_eq!(responder.await?, vec!["ER?", "EM?"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_qmf_tuning_mnemonics() -> anyhow::Result<()> {
        let (host, device) = tokio::io::duplex(256);
        let qmf = Qmf::new(transport(device));
        let responder = tokio::spawn(script(host, vec![b"", b"1.2500\r"]));

        qmf.rf.set_slope(1.25).await?;
        assert!((qmf.dc.offset().await? - 1.25).abs() < 1e-9);
        assert_eq!(responder.await?, vec!["RS1.2500", "DI?"]);
        Ok(())
    }

    #[test]
    fn test_sensitivity_wire_format() {
        assert_eq!(PARTIAL_PRESSURE_SENSITIVITY.set_string(0.0012), "SP0.0012");
        assert_eq!(PARTIAL_PRESSURE_SENSITIVITY.set_string(0.1), "SP0.1000");
        assert_eq!(TOTAL_PRESSURE_SENSITIVITY.set_string(12.345), "ST12.3450");
        assert_eq!(TOTAL_PRESSURE_SENSITIVITY.set_string(0.00004), "ST0.0000");
    }

    #[tokio::test(start_paused = true)]
    async fn test_degas_waits_past_the_long_timeout() -> anyhow::Result<()> {
        let (host, device) = tokio::io::duplex(256);
        let filament = Filament::new(transport(device));
        let long_timeout = rga_core::transport::TransportSettings::default().long_timeout;
        let slow_reply = long_timeout + Duration::from_secs(60);
        let responder = tokio::spawn(async move {
            let mut host = BufReader::new(host);
            let mut cmd = Vec::new();
            host.read_until(b'\r', &mut cmd).await.unwrap();
            tokio::time::sleep(slow_reply).await;
            host.get_mut().write_all(b"0\r").await.unwrap();
            String::from_utf8_lossy(&cmd).trim().to_string()
        });

        let started = tokio::time::Instant::now();
        assert_eq!(filament.start_degas(3).await?, "0");
        assert!(started.elapsed() >= slow_reply);
        assert_eq!(responder.await?, "DG3");
        Ok(())
    }
}
