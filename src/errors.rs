use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::magnetometer::DeviceState;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("acquisition timeout: {received}/{requested} samples after {attempts} reads")]
    AcquisitionTimeout {
        requested: usize,
        received: usize,
        attempts: u32,
    },
    #[error("command ignored by device: {0}")]
    CommandIgnored(String),
    #[error("no calibration result within {0:?}")]
    CalibrationTimeout(Duration),
    #[error("invalid state transition: cannot {operation} while {state}")]
    InvalidStateTransition {
        state: DeviceState,
        operation: String,
    },
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<DriverError>,
    },
    #[error("cancelled")]
    Cancelled,
}

impl DriverError {
    /// Errors caused by a single bad read; the caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DriverError::IncompleteFrame { .. } | DriverError::Parse(_)
        )
    }

    pub(crate) fn invalid_transition(state: DeviceState, operation: impl Into<String>) -> Self {
        DriverError::InvalidStateTransition {
            state,
            operation: operation.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
