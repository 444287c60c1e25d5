//! Session configuration.
//!
//! Everything here is fixed when a [`Magnetometer`](crate::Magnetometer) is
//! created; none of it can change mid-session.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const BAUD_RATE: u32 = 115_200;
const READ_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const STATUS_READ_SIZE: usize = 1000;

/// Command delay to ensure device processes the command
const COMMAND_DELAY: Duration = Duration::from_millis(50);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const STATUS_RETRY_BUDGET: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_millis(100);
const ACK_TIMEOUT: Duration = Duration::from_secs(10);
const CALIBRATION_TIMEOUT: Duration = Duration::from_secs(100);
const ZERO_SETTLE: Duration = Duration::from_secs(5);
const ACQUISITION_READ_ATTEMPTS: u32 = 10;

/// Nominal rate of the digital field stream.
pub const FIELD_SAMPLE_RATE_HZ: f64 = 200.0;
/// Nominal rate of the offset stream emitted while field zeroing.
pub const OFFSET_SAMPLE_RATE_HZ: f64 = 7.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl From<Parity> for serialport::Parity {
    fn from(p: Parity) -> Self {
        match p {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StopBits {
    #[default]
    One,
    Two,
}

impl From<StopBits> for serialport::StopBits {
    fn from(s: StopBits) -> Self {
        match s {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

/// Serial link parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
    /// Upper bound on any single read. Reads are never unbounded.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Size of one status block read, in bytes.
    pub status_read_size: usize,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: BAUD_RATE,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            read_timeout: READ_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
            status_read_size: STATUS_READ_SIZE,
        }
    }
}

impl SerialSettings {
    pub(crate) fn serialport_data_bits(&self) -> serialport::DataBits {
        match self.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        }
    }
}

/// Timing and retry policy for the control procedures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    pub serial: SerialSettings,
    /// Pause after every command write.
    pub command_delay: Duration,
    /// Pause between status polls in startup and monitor loops.
    pub poll_interval: Duration,
    /// Status reads attempted before a polling loop escalates to `Error`.
    pub status_retry_budget: u32,
    /// First backoff delay; doubled per attempt up to 8x.
    pub retry_delay: Duration,
    /// How long to wait for the device to acknowledge a mode change.
    pub ack_timeout: Duration,
    pub calibration_timeout: Duration,
    /// Settle period of the chained start when zeroing has no enabled threshold.
    pub zero_settle: Duration,
    /// Consecutive reads without a new sample before `AcquisitionTimeout`.
    pub acquisition_read_attempts: u32,
    pub offset_samples_per_cycle: usize,
    pub field_sample_rate_hz: f64,
    pub offset_sample_rate_hz: f64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            serial: SerialSettings::default(),
            command_delay: COMMAND_DELAY,
            poll_interval: POLL_INTERVAL,
            status_retry_budget: STATUS_RETRY_BUDGET,
            retry_delay: RETRY_DELAY,
            ack_timeout: ACK_TIMEOUT,
            calibration_timeout: CALIBRATION_TIMEOUT,
            zero_settle: ZERO_SETTLE,
            acquisition_read_attempts: ACQUISITION_READ_ATTEMPTS,
            offset_samples_per_cycle: 1,
            field_sample_rate_hz: FIELD_SAMPLE_RATE_HZ,
            offset_sample_rate_hz: OFFSET_SAMPLE_RATE_HZ,
        }
    }
}

impl DriverConfig {
    /// Backoff before retry number `attempt` (1-based).
    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay * (1 << attempt.saturating_sub(1).min(3))
    }
}
