//! QuSpin QZFM magnetometer driver with optional Python bindings.
//!
//! The sensor talks an ASCII protocol over a serial port: single-byte
//! commands go out, and a mixed stream of status lines, `#` messages and
//! field words comes back. [`Magnetometer`] owns the link and a session
//! model of what the device was last told, and drives the multi-step
//! procedures (startup, field zeroing, calibration, acquisition).
//!
//! # Timing
//!
//! The device does not timestamp its output. Field data arrives at 200 Hz
//! and coil offsets at 7.5 Hz, so timestamps are reconstructed:
//!
//! 1. Record the time of the first read after the lead-in is discarded
//! 2. Stamp sample `k` as `t0 + k / rate`
//! 3. Clear the input buffer first when "now" matters
//!
//! # Features
//!
//! - `python`: builds the `_core` extension module (PyO3, abi3).

pub mod acquisition;
pub mod calibration;
pub mod cancel;
pub mod codec;
pub mod config;
pub mod errors;
pub mod logging;
pub mod magnetometer;
pub mod session;
pub mod status;
pub mod transport;
pub mod zeroing;

#[cfg(feature = "python")]
mod python;

pub use acquisition::{
    requested_samples, sample_timestamp, AcquisitionContext, AcquisitionRequest, DataSample,
    OffsetReader, OffsetReading, SampleCount, SampleSource, SerialReader, MAX_REQUEST_SAMPLES,
};
pub use calibration::{CalibrationReport, CALIBRATION_FIGURE_CEILING, CALIBRATION_OK_LIMIT};
pub use cancel::CancelToken;
pub use codec::{
    classify, encode, AxisMode, Command, FrameKind, GainMode, LineAssembler, ReadAxis,
    ZeroingAxes,
};
pub use config::{
    DriverConfig, Parity, SerialSettings, StopBits, FIELD_SAMPLE_RATE_HZ, OFFSET_SAMPLE_RATE_HZ,
};
pub use errors::*;
pub use magnetometer::{
    AutoStartOptions, DeviceState, Magnetometer, ZeroingOptions, ZeroingOutcome,
};
pub use session::{MessageLog, MessageLogEntry, SessionSnapshot, SessionState};
pub use status::{LedFlags, SensorParameter, StatusParser, StatusSnapshot};
pub use transport::{MockTransport, SerialTransport, Transport};
pub use zeroing::{ZeroingObservation, ZeroingReading, ZeroingThresholds, ZeroingTracker};
