//! QZFM wire protocol: command encoding and line classification.
//!
//! # Wire format
//!
//! Commands are single ASCII bytes. The device answers with CRLF-terminated
//! ASCII lines whose first character identifies them:
//!
//! - `|Nv`       LED state (N = 1..5, v = 0/1)
//! - `~CCvalue`  sensor parameter readback (CC = two digit code)
//! - `#text`     asynchronous message
//! - `!ddddddd`  field stream word (the `!` is optional), 7 decimal digits
//!
//! Reads are taken at arbitrary points of the stream, so the first fragment of
//! every read is a partial line and is always thrown away.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};

// QZFM command bytes
const CMD_AUTO_START: u8 = b'>';
const CMD_STREAM_ON: u8 = b'7';
const CMD_STREAM_OFF: u8 = b'8';
const CMD_READ_X: u8 = b'G';
const CMD_READ_Y: u8 = b'@';
const CMD_READ_Z: u8 = b'?';
const CMD_CALIBRATE: u8 = b'9';
const CMD_FIELD_RESET: u8 = b'V';
const CMD_ZERO_AXES_ALL: u8 = b'i';
const CMD_ZERO_AXES_YZ: u8 = b'h';
const CMD_ZERO_ON: u8 = b'D';
const CMD_ZERO_OFF: u8 = b'E';
const CMD_REBOOT: u8 = b'e';
const CMD_MODE_Z: u8 = b'C';
const CMD_MODE_Y: u8 = b'F';
const CMD_MODE_DUAL: u8 = b'B';
const CMD_GAIN_0_33X: u8 = b'a';
const CMD_GAIN_1X: u8 = b'`';
const CMD_GAIN_3X: u8 = b'b';

const MARKER_LED: u8 = b'|';
const MARKER_PARAMETER: u8 = b'~';
const MARKER_MESSAGE: u8 = b'#';
const MARKER_FIELD: u8 = b'!';

/// Digits in one field stream word.
pub const FIELD_WORD_DIGITS: usize = 7;
/// Bytes of one field stream frame on the wire: marker, word, CRLF.
pub const FIELD_FRAME_BYTES: usize = FIELD_WORD_DIGITS + 3;
const FIELD_WORD_OFFSET: f64 = 8_388_608.0;
const FIELD_WORD_SCALE: f64 = 0.01; // pT per count
const PARAMETER_FIELD_OFFSET: f64 = 32_768.0;
const TEMP_ERROR_OFFSET: f64 = 8_388_608.0;
const TEMP_ERROR_SCALE: f64 = 524_288.0;

// ============================================================================
// Symbolic modes
// ============================================================================

/// Axis streamed by the digital field output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadAxis {
    X,
    Y,
    #[default]
    Z,
}

impl FromStr for ReadAxis {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "x" => Ok(ReadAxis::X),
            "y" => Ok(ReadAxis::Y),
            "z" => Ok(ReadAxis::Z),
            other => Err(DriverError::UnsupportedOperation(format!(
                "unknown axis \"{other}\", expected x|y|z"
            ))),
        }
    }
}

impl fmt::Display for ReadAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadAxis::X => write!(f, "x"),
            ReadAxis::Y => write!(f, "y"),
            ReadAxis::Z => write!(f, "z"),
        }
    }
}

/// Field-sensitive axis configuration. Triaxial sensors ignore this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisMode {
    #[default]
    Z,
    Y,
    Dual,
}

impl FromStr for AxisMode {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "z" => Ok(AxisMode::Z),
            "y" => Ok(AxisMode::Y),
            "dual" => Ok(AxisMode::Dual),
            other => Err(DriverError::UnsupportedOperation(format!(
                "unknown axis mode \"{other}\", expected z|y|dual"
            ))),
        }
    }
}

impl fmt::Display for AxisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisMode::Z => write!(f, "z"),
            AxisMode::Y => write!(f, "y"),
            AxisMode::Dual => write!(f, "dual"),
        }
    }
}

/// Analog output gain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GainMode {
    #[serde(rename = "0.1x")]
    X0_1,
    #[serde(rename = "0.33x")]
    X0_33,
    #[default]
    #[serde(rename = "1x")]
    X1,
    #[serde(rename = "3x")]
    X3,
}

impl GainMode {
    /// Analog scale factor in V/nT once this gain is active.
    pub fn volts_per_nanotesla(self) -> f64 {
        match self {
            GainMode::X0_1 => 0.27,
            GainMode::X0_33 => 0.9,
            GainMode::X1 => 2.7,
            GainMode::X3 => 8.1,
        }
    }

    fn wire(self) -> Option<u8> {
        match self {
            // No command byte selects 0.1x on the supported firmware.
            GainMode::X0_1 => None,
            GainMode::X0_33 => Some(CMD_GAIN_0_33X),
            GainMode::X1 => Some(CMD_GAIN_1X),
            GainMode::X3 => Some(CMD_GAIN_3X),
        }
    }
}

impl FromStr for GainMode {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "0.1x" => Ok(GainMode::X0_1),
            "0.33x" => Ok(GainMode::X0_33),
            "1x" => Ok(GainMode::X1),
            "3x" => Ok(GainMode::X3),
            other => Err(DriverError::UnsupportedOperation(format!(
                "unknown gain \"{other}\", expected 0.1x|0.33x|1x|3x"
            ))),
        }
    }
}

impl fmt::Display for GainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GainMode::X0_1 => write!(f, "0.1x"),
            GainMode::X0_33 => write!(f, "0.33x"),
            GainMode::X1 => write!(f, "1x"),
            GainMode::X3 => write!(f, "3x"),
        }
    }
}

/// Axes compensated by the field zeroing coils.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ZeroingAxes {
    #[default]
    All,
    YZ,
}

impl ZeroingAxes {
    pub fn includes(self, axis: ReadAxis) -> bool {
        match self {
            ZeroingAxes::All => true,
            ZeroingAxes::YZ => axis != ReadAxis::X,
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

/// A device command. Constructed per call and never retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    AutoStart,
    DataStream(bool),
    ReadAxis(ReadAxis),
    Calibrate,
    FieldReset,
    ZeroingAxes(ZeroingAxes),
    FieldZero(bool),
    Reboot,
    AxisMode(AxisMode),
    Gain(GainMode),
}

impl Command {
    /// Exact bytes the device expects for this command.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let byte = match *self {
            Command::AutoStart => CMD_AUTO_START,
            Command::DataStream(true) => CMD_STREAM_ON,
            Command::DataStream(false) => CMD_STREAM_OFF,
            Command::ReadAxis(ReadAxis::X) => CMD_READ_X,
            Command::ReadAxis(ReadAxis::Y) => CMD_READ_Y,
            Command::ReadAxis(ReadAxis::Z) => CMD_READ_Z,
            Command::Calibrate => CMD_CALIBRATE,
            Command::FieldReset => CMD_FIELD_RESET,
            Command::ZeroingAxes(ZeroingAxes::All) => CMD_ZERO_AXES_ALL,
            Command::ZeroingAxes(ZeroingAxes::YZ) => CMD_ZERO_AXES_YZ,
            Command::FieldZero(true) => CMD_ZERO_ON,
            Command::FieldZero(false) => CMD_ZERO_OFF,
            Command::Reboot => CMD_REBOOT,
            Command::AxisMode(AxisMode::Z) => CMD_MODE_Z,
            Command::AxisMode(AxisMode::Y) => CMD_MODE_Y,
            Command::AxisMode(AxisMode::Dual) => CMD_MODE_DUAL,
            Command::Gain(mode) => mode.wire().ok_or_else(|| {
                DriverError::UnsupportedOperation(format!(
                    "gain {mode} is not accepted by the installed firmware"
                ))
            })?,
        };
        Ok(vec![byte])
    }

    /// Whether a device message is the answer to this command.
    ///
    /// Commands without a known reply accept any message.
    pub fn answered_by(&self, message: &str) -> bool {
        let text = message.to_lowercase();
        match self {
            Command::Gain(_) => text.contains("gain"),
            Command::AxisMode(_) => text.contains("mode") || text.contains("axis"),
            Command::ReadAxis(_) => text.contains("axis"),
            Command::FieldReset => text.contains("reset") || text.contains("field"),
            Command::Calibrate => text.contains("calib"),
            _ => true,
        }
    }

    /// Build a command from its symbolic operation name and optional parameter.
    ///
    /// Operation names: `auto_start`, `data_stream` (`on`/`off`), `read_axis`
    /// (`x`/`y`/`z`), `calibrate`, `field_reset`, `zeroing_axes` (`xyz`/`yz`),
    /// `field_zero` (`on`/`off`), `reboot`, `axis_mode` (`z`/`y`/`dual`),
    /// `gain` (`0.1x`/`0.33x`/`1x`/`3x`).
    pub fn from_symbolic(operation: &str, parameter: Option<&str>) -> Result<Self> {
        let unsupported = || {
            DriverError::UnsupportedOperation(format!(
                "{operation}({})",
                parameter.unwrap_or_default()
            ))
        };
        let switch = |p: Option<&str>| match p.map(|s| s.trim().to_lowercase()).as_deref() {
            Some("on") => Ok(true),
            Some("off") => Ok(false),
            _ => Err(unsupported()),
        };

        match (operation, parameter) {
            ("auto_start", None) => Ok(Command::AutoStart),
            ("calibrate", None) => Ok(Command::Calibrate),
            ("field_reset", None) => Ok(Command::FieldReset),
            ("reboot", None) => Ok(Command::Reboot),
            ("data_stream", p) => switch(p).map(Command::DataStream),
            ("field_zero", p) => switch(p).map(Command::FieldZero),
            ("read_axis", Some(p)) => p.parse().map(Command::ReadAxis),
            ("axis_mode", Some(p)) => p.parse().map(Command::AxisMode),
            ("gain", Some(p)) => p.parse().map(Command::Gain),
            ("zeroing_axes", Some(p)) => match p.trim().to_lowercase().as_str() {
                "xyz" | "all" => Ok(Command::ZeroingAxes(ZeroingAxes::All)),
                "yz" => Ok(Command::ZeroingAxes(ZeroingAxes::YZ)),
                _ => Err(unsupported()),
            },
            _ => Err(unsupported()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::AutoStart => write!(f, "auto start"),
            Command::DataStream(on) => write!(f, "data stream {}", if *on { "on" } else { "off" }),
            Command::ReadAxis(axis) => write!(f, "read axis {axis}"),
            Command::Calibrate => write!(f, "calibrate"),
            Command::FieldReset => write!(f, "field reset"),
            Command::ZeroingAxes(axes) => write!(f, "zeroing axes {axes:?}"),
            Command::FieldZero(on) => write!(f, "field zero {}", if *on { "on" } else { "off" }),
            Command::Reboot => write!(f, "reboot"),
            Command::AxisMode(mode) => write!(f, "axis mode {mode}"),
            Command::Gain(mode) => write!(f, "gain {mode}"),
        }
    }
}

/// Free-function form of [`Command::encode`].
pub fn encode(command: Command) -> Result<Vec<u8>> {
    command.encode()
}

// ============================================================================
// Classification
// ============================================================================

/// Kind of a raw line, decided from its leading marker alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Status,
    Message,
    Data,
    Unrecognized,
}

/// Classify a raw chunk from its first significant byte.
///
/// Leading NULs and line terminators are skipped; nothing past the marker is
/// inspected, so a caller can route a chunk before it has fully arrived.
pub fn classify(raw: &[u8]) -> FrameKind {
    let first = raw
        .iter()
        .copied()
        .find(|b| !matches!(b, 0 | b'\r' | b'\n'));
    match first {
        Some(MARKER_LED) | Some(MARKER_PARAMETER) => FrameKind::Status,
        Some(MARKER_MESSAGE) => FrameKind::Message,
        Some(MARKER_FIELD) => FrameKind::Data,
        Some(b) if b.is_ascii_digit() => FrameKind::Data,
        _ => FrameKind::Unrecognized,
    }
}

// ============================================================================
// Line decoding
// ============================================================================

/// Sensor parameter codes carried by `~` lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParameterCode {
    CellTempError,
    CellTempVoltage,
    Bz,
    By,
    B0,
}

/// Decode a `~CCvalue` line into its code and scaled value.
pub(crate) fn decode_parameter(line: &str) -> Option<(ParameterCode, f64)> {
    let body = line.strip_prefix(MARKER_PARAMETER as char)?;
    let code = body.get(..2)?;
    let value = body.get(2..)?;
    let numeric = !value.is_empty()
        && value.chars().any(|c| c.is_ascii_digit())
        && value.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '-');
    if !numeric {
        return None;
    }
    let raw: f64 = value.parse().ok()?;

    match code {
        "04" => Some((
            ParameterCode::CellTempError,
            (raw - TEMP_ERROR_OFFSET) / TEMP_ERROR_SCALE,
        )),
        "05" => Some((ParameterCode::CellTempVoltage, raw.trunc())),
        "07" => Some((ParameterCode::Bz, raw - PARAMETER_FIELD_OFFSET)),
        "08" => Some((ParameterCode::By, raw - PARAMETER_FIELD_OFFSET)),
        "09" => Some((ParameterCode::B0, raw - PARAMETER_FIELD_OFFSET)),
        _ => None,
    }
}

/// Decode a `|Nv` LED line into its index (1-based) and state.
pub(crate) fn decode_led(line: &str) -> Option<(u8, bool)> {
    let body = line.strip_prefix(MARKER_LED as char)?.as_bytes();
    match body {
        [n @ b'1'..=b'5', v, ..] => Some((n - b'0', *v == b'1')),
        _ => None,
    }
}

/// Message text of a `#` line.
pub(crate) fn decode_message(line: &str) -> Option<&str> {
    line.strip_prefix(MARKER_MESSAGE as char)
}

/// Decode a field stream word into pT.
///
/// Returns `None` for lines that are not a digit word. A digit word of the
/// wrong width decodes to NaN so the sample keeps its place in time.
pub(crate) fn decode_field(line: &str) -> Option<f64> {
    let word = line.trim_start_matches(MARKER_FIELD as char).trim();
    if word.is_empty() || !word.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if word.len() != FIELD_WORD_DIGITS {
        return Some(f64::NAN);
    }
    let raw: f64 = word.parse().ok()?;
    Some((raw - FIELD_WORD_OFFSET) * FIELD_WORD_SCALE)
}

// ============================================================================
// Line assembly
// ============================================================================

/// Reassembles lines across partial reads.
///
/// The first fragment seen (everything up to the first line feed) is the
/// lead-in: it is usually truncated mid-frame and is always discarded.
/// NULs and carriage returns are dropped.
#[derive(Debug, Clone)]
pub struct LineAssembler {
    pending: Vec<u8>,
    in_lead_in: bool,
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl LineAssembler {
    pub fn new() -> Self {
        Self {
            pending: Vec::with_capacity(64),
            in_lead_in: true,
        }
    }

    /// Feed raw bytes, returning every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            match b {
                0 | b'\r' => {}
                b'\n' => {
                    if self.in_lead_in {
                        self.in_lead_in = false;
                        self.pending.clear();
                        continue;
                    }
                    if !self.pending.is_empty() {
                        lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                        self.pending.clear();
                    }
                }
                _ => self.pending.push(b),
            }
        }
        lines
    }

    /// True until the lead-in fragment has been dropped.
    pub fn in_lead_in(&self) -> bool {
        self.in_lead_in
    }
}

/// Complete lines of a single raw read, without its partial first and last fragments.
pub fn complete_lines(chunk: &[u8]) -> Vec<String> {
    LineAssembler::new().push(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_command_table() {
        assert_eq!(Command::AutoStart.encode().unwrap(), b">");
        assert_eq!(Command::DataStream(true).encode().unwrap(), b"7");
        assert_eq!(Command::DataStream(false).encode().unwrap(), b"8");
        assert_eq!(Command::ReadAxis(ReadAxis::Y).encode().unwrap(), b"@");
        assert_eq!(Command::ZeroingAxes(ZeroingAxes::YZ).encode().unwrap(), b"h");
        assert_eq!(Command::FieldZero(false).encode().unwrap(), b"E");
        assert_eq!(Command::AxisMode(AxisMode::Dual).encode().unwrap(), b"B");
        assert_eq!(Command::Gain(GainMode::X1).encode().unwrap(), b"`");
    }

    #[test]
    fn replies_must_name_the_command() {
        assert!(Command::Gain(GainMode::X3).answered_by("Gain set to 3x"));
        assert!(!Command::Gain(GainMode::X3).answered_by("Laser locked"));
        assert!(Command::AxisMode(AxisMode::Dual).answered_by("Dual axis mode"));
        assert!(!Command::AxisMode(AxisMode::Dual).answered_by("Cell heating"));
        assert!(!Command::Calibrate.answered_by("Laser locked"));
        assert!(Command::Reboot.answered_by("anything"));
    }

    #[test]
    fn unsupported_gain_is_rejected() {
        let err = Command::Gain(GainMode::X0_1).encode().unwrap_err();
        assert!(matches!(err, DriverError::UnsupportedOperation(_)));
    }

    #[test]
    fn symbolic_commands() {
        assert_eq!(
            Command::from_symbolic("gain", Some("3x")).unwrap(),
            Command::Gain(GainMode::X3)
        );
        assert_eq!(
            Command::from_symbolic("field_zero", Some("off")).unwrap(),
            Command::FieldZero(false)
        );
        assert!(Command::from_symbolic("axis_mode", Some("x")).is_err());
        assert!(Command::from_symbolic("calibrate", Some("now")).is_err());
        assert!(Command::from_symbolic("self_destruct", None).is_err());
    }

    #[test]
    fn classifies_from_prefix() {
        assert_eq!(classify(b"|31"), FrameKind::Status);
        assert_eq!(classify(b"\0\r\n~0732768"), FrameKind::Status);
        assert_eq!(classify(b"#Calib"), FrameKind::Message);
        assert_eq!(classify(b"!83"), FrameKind::Data);
        assert_eq!(classify(b"8388608"), FrameKind::Data);
        assert_eq!(classify(b"?"), FrameKind::Unrecognized);
        assert_eq!(classify(b""), FrameKind::Unrecognized);
    }

    #[test]
    fn decodes_parameters() {
        assert_eq!(
            decode_parameter("~0732868"),
            Some((ParameterCode::Bz, 100.0))
        );
        assert_eq!(
            decode_parameter("~048912896"),
            Some((ParameterCode::CellTempError, 1.0))
        );
        assert_eq!(decode_parameter("~07abc"), None);
        assert_eq!(decode_parameter("~07"), None);
        assert_eq!(decode_parameter("~99123"), None);
    }

    #[test]
    fn decodes_leds() {
        assert_eq!(decode_led("|31"), Some((3, true)));
        assert_eq!(decode_led("|10"), Some((1, false)));
        assert_eq!(decode_led("|9"), None);
        assert_eq!(decode_led("|"), None);
    }

    #[test]
    fn decodes_field_words() {
        assert_eq!(decode_field("!8388708"), Some(1.0));
        assert_eq!(decode_field("8388608"), Some(0.0));
        assert!(decode_field("!838860").unwrap().is_nan());
        assert_eq!(decode_field("#hello"), None);
    }

    #[test]
    fn assembler_drops_lead_in_across_reads() {
        let mut asm = LineAssembler::new();
        assert!(asm.push(b"88608\r").is_empty());
        assert!(asm.in_lead_in());
        assert_eq!(asm.push(b"\n!8388708\r\n!83"), vec!["!8388708"]);
        assert_eq!(asm.push(b"88808\r\n"), vec!["!8388808"]);
    }

    #[test]
    fn complete_lines_strip_partial_ends() {
        let lines = complete_lines(b"11\r\n|21\r\n#ok\0\0\r\n~07327");
        assert_eq!(lines, vec!["|21", "#ok"]);
    }
}
