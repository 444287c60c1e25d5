//! Status block decoding.
//!
//! Outside of data streaming the QZFM continuously prints LED states, sensor
//! readbacks and messages. A status read grabs a fixed-size block of that
//! output; the newest occurrence of each code within the block wins.

use std::collections::BTreeMap;
use std::fmt;

use log::debug;
use serde::Serialize;

use crate::codec::{self, FrameKind, ParameterCode};
use crate::errors::{DriverError, Result};

/// Front panel LED states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LedFlags {
    /// LED1
    pub laser_on: bool,
    /// LED2
    pub cell_temp_locked: bool,
    /// LED3
    pub laser_locked: bool,
    /// LED4
    pub field_zeroed: bool,
    pub is_master: bool,
}

impl LedFlags {
    /// Laser on, laser locked and cell temperature locked, all at once.
    pub fn is_ready(&self) -> bool {
        self.laser_on && self.laser_locked && self.cell_temp_locked
    }

    fn set(&mut self, led: u8, on: bool) {
        match led {
            1 => self.laser_on = on,
            2 => self.cell_temp_locked = on,
            3 => self.laser_locked = on,
            4 => self.field_zeroed = on,
            5 => self.is_master = on,
            _ => {}
        }
    }
}

/// Named sensor readbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum SensorParameter {
    CellTempError,
    CellTempVoltage,
    /// Bz compensation field, pT
    BzField,
    /// By compensation field, pT
    ByField,
    /// B0 (x) compensation field, pT
    B0Field,
}

impl SensorParameter {
    pub fn name(self) -> &'static str {
        match self {
            SensorParameter::CellTempError => "cell_temp_error",
            SensorParameter::CellTempVoltage => "cell_temp_voltage",
            SensorParameter::BzField => "bz_field_pt",
            SensorParameter::ByField => "by_field_pt",
            SensorParameter::B0Field => "b0_field_pt",
        }
    }
}

impl fmt::Display for SensorParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<ParameterCode> for SensorParameter {
    fn from(code: ParameterCode) -> Self {
        match code {
            ParameterCode::CellTempError => SensorParameter::CellTempError,
            ParameterCode::CellTempVoltage => SensorParameter::CellTempVoltage,
            ParameterCode::Bz => SensorParameter::BzField,
            ParameterCode::By => SensorParameter::ByField,
            ParameterCode::B0 => SensorParameter::B0Field,
        }
    }
}

/// One decoded status block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub leds: LedFlags,
    /// Only the parameters present in the block.
    pub parameters: BTreeMap<SensorParameter, f64>,
    /// Microseconds since the Unix epoch at which the block was applied.
    pub timestamp_us: u64,
}

impl StatusSnapshot {
    pub fn parameter(&self, p: SensorParameter) -> Option<f64> {
        self.parameters.get(&p).copied()
    }

    pub fn cell_temp_error(&self) -> Option<f64> {
        self.parameter(SensorParameter::CellTempError)
    }

    pub fn is_ready(&self) -> bool {
        self.leds.is_ready()
    }
}

/// Result of parsing a status block: the snapshot plus the message lines
/// found in the same read, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedStatus {
    pub snapshot: StatusSnapshot,
    pub messages: Vec<String>,
}

/// Decoder for fixed-size status blocks.
#[derive(Debug, Clone, Copy)]
pub struct StatusParser {
    read_size: usize,
}

impl StatusParser {
    pub fn new(read_size: usize) -> Self {
        Self { read_size }
    }

    pub fn read_size(&self) -> usize {
        self.read_size
    }

    /// Decode one block. `timestamp_us` is stamped on the snapshot as is.
    ///
    /// A block shorter than the configured read size means the read timed out
    /// before the device filled it and fails with `IncompleteFrame`. A block
    /// without a single LED or parameter line fails with `Parse`.
    pub fn parse(&self, chunk: &[u8], timestamp_us: u64) -> Result<ParsedStatus> {
        if chunk.len() < self.read_size {
            return Err(DriverError::IncompleteFrame {
                expected: self.read_size,
                actual: chunk.len(),
            });
        }

        let mut leds = LedFlags::default();
        let mut parameters = BTreeMap::new();
        let mut messages = Vec::new();
        let mut status_lines = 0usize;

        for line in codec::complete_lines(chunk) {
            match codec::classify(line.as_bytes()) {
                FrameKind::Status => {
                    if let Some((led, on)) = codec::decode_led(&line) {
                        leds.set(led, on);
                        status_lines += 1;
                    } else if let Some((code, value)) = codec::decode_parameter(&line) {
                        parameters.insert(SensorParameter::from(code), value);
                        status_lines += 1;
                    }
                }
                FrameKind::Message => {
                    if let Some(text) = codec::decode_message(&line) {
                        messages.push(text.to_string());
                    }
                }
                FrameKind::Data | FrameKind::Unrecognized => {}
            }
        }

        if status_lines == 0 {
            return Err(DriverError::Parse(format!(
                "no status codes in {} byte block",
                chunk.len()
            )));
        }

        debug!(
            "status: leds={:?}, parameters={:?}, messages={}",
            leds,
            parameters,
            messages.len()
        );

        Ok(ParsedStatus {
            snapshot: StatusSnapshot {
                leds,
                parameters,
                timestamp_us,
            },
            messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::status_block;

    const SIZE: usize = 128;

    fn locked_block() -> Vec<u8> {
        status_block(
            &["|11", "|21", "|31", "|40", "|50", "~048388608", "~0732868", "#Laser locked"],
            SIZE,
        )
    }

    #[test]
    fn decodes_flags_parameters_and_messages() {
        let parsed = StatusParser::new(SIZE).parse(&locked_block(), 7).unwrap();
        let snap = parsed.snapshot;
        assert!(snap.leds.laser_on && snap.leds.cell_temp_locked && snap.leds.laser_locked);
        assert!(!snap.leds.field_zeroed);
        assert!(snap.is_ready());
        assert_eq!(snap.cell_temp_error(), Some(0.0));
        assert_eq!(snap.parameter(SensorParameter::BzField), Some(100.0));
        assert_eq!(snap.parameter(SensorParameter::ByField), None);
        assert_eq!(snap.timestamp_us, 7);
        assert_eq!(parsed.messages, vec!["Laser locked".to_string()]);
    }

    #[test]
    fn identical_bytes_parse_identically() {
        let parser = StatusParser::new(SIZE);
        let block = locked_block();
        let a = parser.parse(&block, 1).unwrap();
        let b = parser.parse(&block, 2).unwrap();
        assert_eq!(a.snapshot.leds, b.snapshot.leds);
        assert_eq!(a.snapshot.parameters, b.snapshot.parameters);
        assert_eq!(a.messages, b.messages);
    }

    #[test]
    fn latest_code_wins() {
        let block = status_block(&["|30", "~0732768", "|31", "~0732770"], SIZE);
        let snap = StatusParser::new(SIZE).parse(&block, 0).unwrap().snapshot;
        assert!(snap.leds.laser_locked);
        assert_eq!(snap.parameter(SensorParameter::BzField), Some(2.0));
    }

    #[test]
    fn short_block_is_incomplete() {
        let mut block = locked_block();
        block.truncate(SIZE - 1);
        let err = StatusParser::new(SIZE).parse(&block, 0).unwrap_err();
        assert!(matches!(
            err,
            DriverError::IncompleteFrame { expected: SIZE, actual } if actual == SIZE - 1
        ));
    }

    #[test]
    fn block_without_status_codes_is_rejected() {
        let block = status_block(&["!8388608", "#hello"], SIZE);
        let err = StatusParser::new(SIZE).parse(&block, 0).unwrap_err();
        assert!(err.is_transient());
    }
}
