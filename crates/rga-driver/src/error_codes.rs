//! Cascading error-status decoder.
//!
//! The `ER?` root byte flags which subsystems have a fault. Each flagged
//! subsystem has its own detail register whose bits map to a fixed table of
//! short codes (`PS7`, `DET1`, `EM7`, ...). A root byte of zero decodes to the
//! single code [`NO_ERROR`].

use rga_core::{RgaError, RgaResult};

/// Short code reported when the root status byte is zero.
pub const NO_ERROR: &str = "NE";

/// A subsystem with its own error detail register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    PowerSupply,
    Electrometer,
    RfPowerSupply,
    Multiplier,
    Filament,
    Communications,
}

impl Subsystem {
    /// Evaluation order of the root byte.
    pub const ALL: [Subsystem; 6] = [
        Subsystem::PowerSupply,
        Subsystem::Electrometer,
        Subsystem::RfPowerSupply,
        Subsystem::Multiplier,
        Subsystem::Filament,
        Subsystem::Communications,
    ];

    /// Bit in the root byte that flags this subsystem.
    pub fn root_bit(self) -> u8 {
        match self {
            Subsystem::PowerSupply => 6,
            Subsystem::Electrometer => 5,
            Subsystem::RfPowerSupply => 4,
            Subsystem::Multiplier => 3,
            Subsystem::Filament => 1,
            Subsystem::Communications => 0,
        }
    }

    /// Query mnemonic of the detail register.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Subsystem::PowerSupply => "EP",
            Subsystem::Electrometer => "ED",
            Subsystem::RfPowerSupply => "EQ",
            Subsystem::Multiplier => "EM",
            Subsystem::Filament => "EF",
            Subsystem::Communications => "EC",
        }
    }

    /// Short-code prefix, e.g. `DET`.
    pub fn prefix(self) -> &'static str {
        match self {
            Subsystem::PowerSupply => "PS",
            Subsystem::Electrometer => "DET",
            Subsystem::RfPowerSupply => "RF",
            Subsystem::Multiplier => "EM",
            Subsystem::Filament => "FL",
            Subsystem::Communications => "CM",
        }
    }

    pub fn heading(self) -> &'static str {
        match self {
            Subsystem::PowerSupply => "* 24V Power Supply Error: ",
            Subsystem::Electrometer => "* Electrometer Error: ",
            Subsystem::RfPowerSupply => "* Quadrupole Mass Filter RF P/S error: ",
            Subsystem::Multiplier => "Electron Multiplier error: ",
            Subsystem::Filament => "* Filament Error: ",
            Subsystem::Communications => "* Communications Error: ",
        }
    }

    pub fn is_flagged(self, root: u8) -> bool {
        root & (1 << self.root_bit()) != 0
    }
}

struct ErrorCode {
    subsystem: Subsystem,
    bit: u8,
    code: &'static str,
    description: &'static str,
}

const fn entry(
    subsystem: Subsystem,
    bit: u8,
    code: &'static str,
    description: &'static str,
) -> ErrorCode {
    ErrorCode {
        subsystem,
        bit,
        code,
        description,
    }
}

/// Detail bits in reporting order: subsystem priority, then high bit first.
static ERROR_CODES: &[ErrorCode] = &[
    entry(Subsystem::PowerSupply, 7, "PS7", "Voltage > 26V"),
    entry(Subsystem::PowerSupply, 6, "PS6", "Voltage < 22V"),
    entry(Subsystem::Electrometer, 7, "DET7", "ADC16 test failure"),
    entry(Subsystem::Electrometer, 6, "DET6", "DETECT fails to read +5nA input current"),
    entry(Subsystem::Electrometer, 5, "DET5", "DETECT fails to read -5nA input current"),
    entry(Subsystem::Electrometer, 4, "DET4", "COMPENSATE fails to read +5nA input current"),
    entry(Subsystem::Electrometer, 3, "DET3", "COMPENSATE fails to read -5nA input current"),
    entry(Subsystem::Electrometer, 1, "DET1", "OP-AMP Input Offset Voltage out of range"),
    entry(Subsystem::RfPowerSupply, 7, "RF7", "RF_CT exceeds (V_EXT- 2V) at M_MAX"),
    entry(Subsystem::RfPowerSupply, 6, "RF6", "Primary current exceeds 2.0A"),
    entry(Subsystem::RfPowerSupply, 4, "RF4", "Power supply in current limited mode"),
    entry(Subsystem::Multiplier, 7, "EM7", "No Electron Multiplier Option installed"),
    entry(Subsystem::Filament, 7, "FL7", "No filament detected"),
    entry(Subsystem::Filament, 6, "FL6", "Unable to set the requested emission current"),
    entry(Subsystem::Filament, 5, "FL5", "Vacuum Chamber pressure too high"),
    entry(Subsystem::Filament, 0, "FL0", "Single filament operation"),
    entry(Subsystem::Communications, 6, "CM6", "Parameter conflict"),
    entry(Subsystem::Communications, 5, "CM5", "Jumper protection violation"),
    entry(Subsystem::Communications, 4, "CM4", "Transmit buffer overwrite"),
    entry(Subsystem::Communications, 3, "CM3", "OVERWRITE in receiving"),
    entry(Subsystem::Communications, 2, "CM2", "Command-too-long"),
    entry(Subsystem::Communications, 1, "CM1", "Bad Parameter received"),
    entry(Subsystem::Communications, 0, "CM0", "Bad command received"),
];

/// Decode a root status byte into short codes.
///
/// `detail` is called once for each flagged subsystem, in evaluation order,
/// and must return that subsystem's detail register.
pub fn decode(root: u8, mut detail: impl FnMut(Subsystem) -> u8) -> Vec<&'static str> {
    if root == 0 {
        return vec![NO_ERROR];
    }

    let mut codes = Vec::new();
    for subsystem in Subsystem::ALL {
        if !subsystem.is_flagged(root) {
            continue;
        }
        let register = detail(subsystem);
        codes.extend(
            ERROR_CODES
                .iter()
                .filter(|e| e.subsystem == subsystem && register & (1 << e.bit) != 0)
                .map(|e| e.code),
        );
    }
    codes
}

/// Long description of one short code.
pub fn describe(code: &str) -> RgaResult<&'static str> {
    if code == NO_ERROR {
        return Ok("No Error");
    }
    if let Some(e) = ERROR_CODES.iter().find(|e| e.code == code) {
        return Ok(e.description);
    }
    Subsystem::ALL
        .iter()
        .find(|s| s.prefix() == code)
        .map(|s| s.heading())
        .ok_or_else(|| RgaError::UnknownErrorCode(code.to_string()))
}

/// Long descriptions of a code sequence, in order.
pub fn describe_all<S: AsRef<str>>(codes: &[S]) -> RgaResult<Vec<&'static str>> {
    codes.iter().map(|c| describe(c.as_ref())).collect()
}

/// Descriptions joined with ", ".
pub fn error_text<S: AsRef<str>>(codes: &[S]) -> RgaResult<String> {
    Ok(describe_all(codes)?.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_root_is_no_error() {
        let codes = decode(0, |_| panic!("no detail register should be read"));
        assert_eq!(codes, vec!["NE"]);
        assert_eq!(error_text(&codes).unwrap(), "No Error");
    }

    #[test]
    fn test_multiplier_bit() {
        let codes = decode(1 << 3, |s| {
            assert_eq!(s, Subsystem::Multiplier);
            1 << 7
        });
        assert_eq!(codes, vec!["EM7"]);
        assert_eq!(
            describe_all(&codes).unwrap(),
            vec!["No Electron Multiplier Option installed"]
        );
    }

    #[test]
    fn test_only_flagged_registers_are_read() {
        let mut read = Vec::new();
        let codes = decode(0b0100_0011, |s| {
            read.push(s);
            match s {
                Subsystem::PowerSupply => 0b1100_0000,
                Subsystem::Filament => 0b0000_0001,
                Subsystem::Communications => 0b0000_0110,
                _ => 0,
            }
        });
        assert_eq!(
            read,
            vec![
                Subsystem::PowerSupply,
                Subsystem::Filament,
                Subsystem::Communications
            ]
        );
        assert_eq!(codes, vec!["PS7", "PS6", "FL0", "CM2", "CM1"]);
    }

    #[test]
    fn test_unlisted_detail_bits_are_ignored() {
        // Bit 2 of the electrometer register has no table entry.
        assert!(decode(1 << 5, |_| 1 << 2).is_empty());
        // Root bit 2 selects no subsystem.
        assert!(decode(1 << 2, |_| 0xff).is_empty());
    }

    #[test]
    fn test_error_text_joins_descriptions() {
        assert_eq!(
            error_text(&["FL7", "CM0"]).unwrap(),
            "No filament detected, Bad command received"
        );
        assert_eq!(describe("DET").unwrap(), "* Electrometer Error: ");
    }

    #[test]
    fn test_unknown_code_is_fatal() {
        assert!(matches!(
            describe("XX9"),
            Err(RgaError::UnknownErrorCode(code)) if code == "XX9"
        ));
        assert!(error_text(&["NE", "PS5"]).is_err());
    }
}
