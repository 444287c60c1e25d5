//! Mutable record of the device configuration and last known status.
//!
//! A [`SessionState`] is owned by the running [`Magnetometer`](crate::Magnetometer)
//! and only changes through its procedures and the two stream parsers. Other
//! code sees it through [`SessionSnapshot`], an immutable copy taken at read time.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::calibration::CalibrationReport;
use crate::codec::{AxisMode, GainMode, ReadAxis, ZeroingAxes};
use crate::status::{ParsedStatus, StatusSnapshot};

/// Wall-clock microseconds since the Unix epoch.
pub fn epoch_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// A device message and the time it was extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageLogEntry {
    pub text: String,
    pub timestamp_us: u64,
}

/// Append-only message history in arrival order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MessageLog {
    entries: Vec<MessageLogEntry>,
}

impl MessageLog {
    /// Append a message. Timestamps never run backwards even if the wall clock does.
    pub(crate) fn push(&mut self, text: impl Into<String>, timestamp_us: u64) {
        let timestamp_us = self
            .entries
            .last()
            .map_or(timestamp_us, |last| last.timestamp_us.max(timestamp_us));
        self.entries.push(MessageLogEntry {
            text: text.into(),
            timestamp_us,
        });
    }

    pub fn entries(&self) -> &[MessageLogEntry] {
        &self.entries
    }

    /// Entries appended at or after position `mark`.
    pub fn since(&self, mark: usize) -> &[MessageLogEntry] {
        self.entries.get(mark..).unwrap_or_default()
    }

    /// The last `n` entries (all of them if fewer).
    pub fn last(&self, n: usize) -> &[MessageLogEntry] {
        &self.entries[self.entries.len().saturating_sub(n)..]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Current device configuration and last known status.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub(crate) axis_mode: AxisMode,
    pub(crate) read_axis: ReadAxis,
    pub(crate) gain_mode: GainMode,
    pub(crate) data_streaming: bool,
    pub(crate) zeroing_active: bool,
    pub(crate) zeroing_axes: ZeroingAxes,
    pub(crate) field_zeroed: bool,
    pub(crate) calibration_ok: bool,
    pub(crate) calibration: Option<CalibrationReport>,
    pub(crate) status: Option<StatusSnapshot>,
    pub(crate) messages: MessageLog,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            axis_mode: AxisMode::Z,
            read_axis: ReadAxis::Z,
            gain_mode: GainMode::X1,
            data_streaming: false,
            zeroing_active: false,
            zeroing_axes: ZeroingAxes::All,
            field_zeroed: false,
            calibration_ok: false,
            calibration: None,
            status: None,
            messages: MessageLog::default(),
        }
    }
}

impl SessionState {
    pub fn axis_mode(&self) -> AxisMode {
        self.axis_mode
    }

    pub fn read_axis(&self) -> ReadAxis {
        self.read_axis
    }

    pub fn gain_mode(&self) -> GainMode {
        self.gain_mode
    }

    /// Analog scale factor of the acknowledged gain, V/nT.
    pub fn gain(&self) -> f64 {
        self.gain_mode.volts_per_nanotesla()
    }

    pub fn is_data_streaming(&self) -> bool {
        self.data_streaming
    }

    pub fn is_zeroing_active(&self) -> bool {
        self.zeroing_active
    }

    pub fn zeroing_axes(&self) -> ZeroingAxes {
        self.zeroing_axes
    }

    pub fn is_field_zeroed(&self) -> bool {
        self.field_zeroed
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibration_ok
    }

    pub fn calibration(&self) -> Option<&CalibrationReport> {
        self.calibration.as_ref()
    }

    pub fn status(&self) -> Option<&StatusSnapshot> {
        self.status.as_ref()
    }

    pub fn messages(&self) -> &MessageLog {
        &self.messages
    }

    /// Replace the status wholesale with a successfully parsed block and
    /// append its messages.
    pub(crate) fn apply_status(&mut self, parsed: ParsedStatus) -> &StatusSnapshot {
        let ParsedStatus {
            mut snapshot,
            messages,
        } = parsed;
        if let Some(prev) = &self.status {
            snapshot.timestamp_us = snapshot.timestamp_us.max(prev.timestamp_us);
        }
        for text in messages {
            self.messages.push(text, snapshot.timestamp_us);
        }
        self.status.insert(snapshot)
    }

    pub(crate) fn invalidate_calibration(&mut self) {
        self.calibration_ok = false;
        self.calibration = None;
    }

    /// Back to power-on defaults. The message history is dropped too.
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            axis_mode: self.axis_mode,
            read_axis: self.read_axis,
            gain_mode: self.gain_mode,
            gain: self.gain(),
            data_streaming: self.data_streaming,
            zeroing_active: self.zeroing_active,
            zeroing_axes: self.zeroing_axes,
            field_zeroed: self.field_zeroed,
            calibration_ok: self.calibration_ok,
            calibration: self.calibration.clone(),
            status: self.status.clone(),
            message_count: self.messages.len(),
        }
    }
}

/// Immutable copy of the session for status printers and exporters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub axis_mode: AxisMode,
    pub read_axis: ReadAxis,
    pub gain_mode: GainMode,
    /// V/nT
    pub gain: f64,
    pub data_streaming: bool,
    pub zeroing_active: bool,
    pub zeroing_axes: ZeroingAxes,
    pub field_zeroed: bool,
    pub calibration_ok: bool,
    pub calibration: Option<CalibrationReport>,
    pub status: Option<StatusSnapshot>,
    pub message_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusParser;
    use crate::transport::mock::status_block;

    #[test]
    fn message_log_is_ordered_and_monotonic() {
        let mut log = MessageLog::default();
        log.push("a", 10);
        log.push("b", 5);
        log.push("c", 20);
        let stamps: Vec<u64> = log.entries().iter().map(|e| e.timestamp_us).collect();
        assert_eq!(stamps, vec![10, 10, 20]);
        assert_eq!(log.since(1).len(), 2);
        assert!(log.since(9).is_empty());
        assert_eq!(log.last(1)[0].text, "c");
        assert_eq!(log.last(10).len(), 3);
    }

    #[test]
    fn status_timestamps_never_decrease() {
        let parser = StatusParser::new(64);
        let block = status_block(&["|11", "#hi"], 64);
        let mut session = SessionState::default();

        session.apply_status(parser.parse(&block, 100).unwrap());
        session.apply_status(parser.parse(&block, 50).unwrap());

        assert_eq!(session.status().unwrap().timestamp_us, 100);
        assert_eq!(session.messages().len(), 2);
    }

    #[test]
    fn reset_restores_defaults() {
        let mut session = SessionState::default();
        session.gain_mode = GainMode::X3;
        session.field_zeroed = true;
        session.messages.push("x", 1);
        session.reset();
        assert_eq!(session.gain(), 2.7);
        assert!(!session.is_field_zeroed());
        assert!(session.messages().is_empty());
    }
}
