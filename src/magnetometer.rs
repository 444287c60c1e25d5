//! QZFM control state machine.
//!
//! [`Magnetometer`] owns the transport, the [`SessionState`] and the sample
//! source, and sequences the multi-step procedures of the sensor: auto start,
//! calibration, field zeroing, gain and axis changes.
//!
//! ```text
//! Disconnected -> Connected -> Starting -> Ready <-> Calibrating
//!                                            ^ <-> ZeroingActive
//!                          (any live state) -> Error -> (reconnect) -> Connected
//! ```
//!
//! Every procedure blocks its caller. Loops without a natural end take a
//! [`CancelToken`] that is checked once per iteration.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use crate::acquisition::{
    requested_samples, AcquisitionContext, AcquisitionRequest, DataSample, OffsetReader,
    OffsetReading, SampleSource, SerialReader,
};
use crate::calibration::{CalibrationReport, CALIBRATION_OK_LIMIT};
use crate::cancel::CancelToken;
use crate::codec::{self, AxisMode, Command, FrameKind, GainMode, ReadAxis, ZeroingAxes};
use crate::config::DriverConfig;
use crate::errors::{DriverError, Result};
use crate::session::{epoch_micros, MessageLogEntry, SessionSnapshot, SessionState};
use crate::status::{StatusParser, StatusSnapshot};
use crate::transport::{send_command, SerialTransport, Transport};
use crate::zeroing::{ZeroingReading, ZeroingThresholds, ZeroingTracker};

/// Lifecycle state of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceState {
    Disconnected,
    Connected,
    Starting,
    Ready,
    Calibrating,
    ZeroingActive,
    /// Terminal for the session; leave with [`Magnetometer::reconnect`].
    Error,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Disconnected => "disconnected",
            DeviceState::Connected => "connected",
            DeviceState::Starting => "starting",
            DeviceState::Ready => "ready",
            DeviceState::Calibrating => "calibrating",
            DeviceState::ZeroingActive => "zeroing",
            DeviceState::Error => "error",
        };
        f.write_str(name)
    }
}

const IDLE: &[DeviceState] = &[DeviceState::Connected, DeviceState::Ready];
const LIVE: &[DeviceState] = &[
    DeviceState::Connected,
    DeviceState::Starting,
    DeviceState::Ready,
    DeviceState::Calibrating,
    DeviceState::ZeroingActive,
];

/// Field zeroing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ZeroingOptions {
    pub axes: ZeroingAxes,
    /// All disabled means zeroing runs until explicitly stopped.
    pub thresholds: ZeroingThresholds,
}

/// Auto start parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoStartOptions {
    /// Wait for laser and temperature lock before returning.
    pub block: bool,
    /// Zero the field and calibrate once locked. Implies `block`.
    pub zero_and_calibrate: bool,
    pub zeroing: ZeroingOptions,
}

impl Default for AutoStartOptions {
    fn default() -> Self {
        Self {
            block: true,
            zero_and_calibrate: false,
            zeroing: ZeroingOptions::default(),
        }
    }
}

/// How a call to [`Magnetometer::field_zero`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ZeroingOutcome {
    /// Every enabled threshold was met; zeroing was switched off.
    Converged { cycles: usize },
    /// No threshold enabled; zeroing stays on until stopped.
    Running,
    /// Zeroing was switched off on request.
    Stopped,
    /// The token fired; zeroing is still on.
    Cancelled,
}

fn retryable(err: &DriverError) -> bool {
    err.is_transient() || matches!(err, DriverError::AcquisitionTimeout { .. })
}

/// QuSpin zero-field magnetometer.
///
/// # Example
/// ```ignore
/// let mut mag = Magnetometer::connect_serial("/dev/ttyUSB0", DriverConfig::default())?;
/// mag.auto_start(AutoStartOptions::default(), &CancelToken::new())?;
/// let samples = mag.read_data(AcquisitionRequest::samples(200, ReadAxis::Z))?;
/// mag.disconnect();
/// ```
pub struct Magnetometer {
    transport: Box<dyn Transport>,
    sampler: Box<dyn SampleSource>,
    offsets: OffsetReader,
    parser: StatusParser,
    session: SessionState,
    config: DriverConfig,
    state: DeviceState,
}

impl Magnetometer {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Drive a device over an already open transport.
    pub fn with_transport(transport: impl Transport + 'static, config: DriverConfig) -> Self {
        Self {
            transport: Box::new(transport),
            sampler: Box::new(SerialReader::new()),
            offsets: OffsetReader::new(),
            parser: StatusParser::new(config.serial.status_read_size),
            session: SessionState::default(),
            config,
            state: DeviceState::Connected,
        }
    }

    /// Open the serial port at `path` (e.g. `/dev/ttyUSB0` or `COM3`).
    pub fn connect_serial(path: &str, config: DriverConfig) -> Result<Self> {
        let transport = SerialTransport::open(path, &config.serial)?;
        Ok(Self::with_transport(transport, config))
    }

    /// Replace the serial field stream reader with another sample source.
    pub fn with_sample_source(mut self, source: impl SampleSource + 'static) -> Self {
        self.sampler = Box::new(source);
        self
    }

    // ------------------------------------------------------------------------
    // Read-only views
    // ------------------------------------------------------------------------

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    pub fn messages(&self) -> &[MessageLogEntry] {
        self.session.messages().entries()
    }

    pub fn last_messages(&self, n: usize) -> &[MessageLogEntry] {
        self.session.messages().last(n)
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Stop the data stream (best effort), release the port, forget the
    /// session and go to `Disconnected`.
    pub fn disconnect(&mut self) {
        if self.state == DeviceState::Disconnected {
            return;
        }
        if self.session.data_streaming && self.state != DeviceState::Error {
            if let Err(e) = send_command(
                &mut *self.transport,
                Command::DataStream(false),
                self.config.command_delay,
            ) {
                warn!("could not stop data stream on disconnect: {}", e);
            }
        }
        self.transport.close();
        self.session.reset();
        self.set_state(DeviceState::Disconnected);
    }

    /// Reopen the port and leave `Disconnected` or `Error` with a fresh session.
    ///
    /// If the device is still absent the state is left as it was.
    pub fn reconnect(&mut self) -> Result<()> {
        self.require("reconnect", &[DeviceState::Disconnected, DeviceState::Error])?;
        self.transport.close();
        if let Err(e) = self.transport.reopen() {
            warn!("reconnect failed: {}", e);
            return Err(e);
        }
        self.transport.clear_input_buffer()?;
        self.session.reset();
        self.set_state(DeviceState::Connected);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    /// Read and apply one status block. Single attempt.
    ///
    /// On failure the previous snapshot stays in place untouched.
    pub fn update_status(&mut self, clear_buffer: bool) -> Result<StatusSnapshot> {
        self.require("update status", LIVE)?;
        let result = self.read_status(clear_buffer);
        self.track(result)
    }

    /// Poll the status until `cancel` fires, handing each snapshot to `on_update`.
    ///
    /// Returns the number of updates delivered.
    pub fn monitor_status(
        &mut self,
        cancel: &CancelToken,
        mut on_update: impl FnMut(&SessionSnapshot),
    ) -> Result<usize> {
        self.require("monitor status", LIVE)?;
        let mut updates = 0;
        while !cancel.is_cancelled() {
            self.poll_status(true)?;
            updates += 1;
            on_update(&self.session.snapshot());
            thread::sleep(self.config.poll_interval);
        }
        debug!("status monitor stopped after {} updates", updates);
        Ok(updates)
    }

    // ------------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------------

    /// Run the sensor's automated startup.
    ///
    /// Non-blocking starts return right after the command; drive the
    /// transition with [`poll_startup`](Self::poll_startup).
    pub fn auto_start(&mut self, options: AutoStartOptions, cancel: &CancelToken) -> Result<()> {
        self.require(
            "auto start",
            &[DeviceState::Connected, DeviceState::Starting, DeviceState::Ready],
        )?;
        self.send(Command::AutoStart)?;
        self.set_state(DeviceState::Starting);

        if !options.block && !options.zero_and_calibrate {
            return Ok(());
        }
        while !self.poll_startup()? {
            if cancel.is_cancelled() {
                info!("auto start cancelled before lock");
                return Err(DriverError::Cancelled);
            }
            thread::sleep(self.config.poll_interval);
        }

        if options.zero_and_calibrate {
            self.zero_and_calibrate(options.zeroing, cancel)?;
        }
        Ok(())
    }

    /// One startup poll. `Ok(true)` once laser on, laser lock and cell
    /// temperature lock are all set in the same snapshot.
    pub fn poll_startup(&mut self) -> Result<bool> {
        match self.state {
            DeviceState::Ready => return Ok(true),
            DeviceState::Starting => {}
            state => return Err(DriverError::invalid_transition(state, "poll startup")),
        }
        let snapshot = self.poll_status(false)?;
        if snapshot.is_ready() {
            info!("sensor locked (laser on, laser lock, cell temperature lock)");
            self.set_state(DeviceState::Ready);
            Ok(true)
        } else {
            debug!("waiting for lock: {:?}", snapshot.leds);
            Ok(false)
        }
    }

    fn zero_and_calibrate(&mut self, zeroing: ZeroingOptions, cancel: &CancelToken) -> Result<()> {
        info!("field zeroing before calibration");
        match self.field_zero(true, zeroing, cancel)? {
            ZeroingOutcome::Running => {
                self.settle(cancel)?;
                self.field_zero(false, zeroing, cancel)?;
            }
            ZeroingOutcome::Cancelled => return Err(DriverError::Cancelled),
            ZeroingOutcome::Converged { .. } | ZeroingOutcome::Stopped => {}
        }
        self.calibrate()?;
        Ok(())
    }

    /// Keep polling the status for the settle period while zeroing runs.
    fn settle(&mut self, cancel: &CancelToken) -> Result<()> {
        let deadline = Instant::now() + self.config.zero_settle;
        while Instant::now() < deadline {
            if cancel.is_cancelled() {
                return Err(DriverError::Cancelled);
            }
            self.poll_status(false)?;
            thread::sleep(self.config.poll_interval);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Calibration
    // ------------------------------------------------------------------------

    /// Calibrate the field-to-voltage response against the internal reference.
    ///
    /// The field must be zeroed first. A figure at or above the OK limit is
    /// reported, not raised; only a missing result is an error.
    pub fn calibrate(&mut self) -> Result<CalibrationReport> {
        self.require("calibrate", &[DeviceState::Ready])?;
        if !self.session.field_zeroed {
            let snapshot = self.poll_status(true)?;
            if !snapshot.leds.field_zeroed {
                return Err(DriverError::invalid_transition(
                    self.state,
                    "calibrate before field zeroing",
                ));
            }
        }

        self.session.invalidate_calibration();
        self.set_state(DeviceState::Calibrating);

        let timeout = self.config.calibration_timeout;
        let outcome =
            self.command_with_reply(Command::Calibrate, timeout, CalibrationReport::parse);
        if self.state == DeviceState::Calibrating {
            self.set_state(DeviceState::Ready);
        }
        let Some(report) = outcome? else {
            warn!("no calibration result within {:?}", timeout);
            return Err(DriverError::CalibrationTimeout(timeout));
        };

        if report.is_ok() {
            info!("calibration ok: figure {}", report.figure);
        } else {
            warn!(
                "calibration degraded: figure {} (limit {})",
                report.figure, CALIBRATION_OK_LIMIT
            );
        }
        self.session.calibration_ok = report.is_ok();
        self.session.calibration = Some(report.clone());
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Field zeroing
    // ------------------------------------------------------------------------

    /// Start (`on`) or stop field zeroing.
    ///
    /// With at least one enabled threshold the call blocks, reading the
    /// offset stream until every enabled threshold holds or `cancel` fires.
    /// Stopping always returns to `Ready`, converged or not.
    pub fn field_zero(
        &mut self,
        on: bool,
        options: ZeroingOptions,
        cancel: &CancelToken,
    ) -> Result<ZeroingOutcome> {
        if !on {
            self.stop_zeroing()?;
            return Ok(ZeroingOutcome::Stopped);
        }

        self.require("start field zeroing", &[DeviceState::Ready])?;
        if self.session.data_streaming {
            return Err(DriverError::invalid_transition(
                self.state,
                "start field zeroing while data streaming",
            ));
        }

        self.session.invalidate_calibration();
        self.send(Command::ZeroingAxes(options.axes))?;
        self.session.zeroing_axes = options.axes;
        self.send(Command::FieldZero(true))?;
        self.session.zeroing_active = true;
        self.session.field_zeroed = false;
        self.set_state(DeviceState::ZeroingActive);

        if !options.thresholds.any_enabled(options.axes) {
            info!("field zeroing on ({:?}) until stopped", options.axes);
            return Ok(ZeroingOutcome::Running);
        }

        let mut tracker = ZeroingTracker::new();
        let mut cycles = 0usize;
        let mut clear = true;
        loop {
            if cancel.is_cancelled() {
                info!("field zeroing cancelled after {} cycles, still on", cycles);
                return Ok(ZeroingOutcome::Cancelled);
            }
            let reading = self.with_retries("offset read", |m| m.read_zeroing_cycle(clear))?;
            clear = false;

            let Some(obs) = tracker.observe(reading) else {
                continue;
            };
            cycles += 1;
            debug!(
                "zeroing cycle {}: dBx={:.3} dBy={:.3} dBz={:.3} dT={:.5}",
                cycles, obs.d_bx, obs.d_by, obs.d_bz, obs.d_temp
            );
            if options.thresholds.is_satisfied(&obs, options.axes) {
                info!("field zeroing converged after {} cycles", cycles);
                self.stop_zeroing()?;
                return Ok(ZeroingOutcome::Converged { cycles });
            }
        }
    }

    /// Only a zeroing run that was actually on leaves the field zeroed.
    fn stop_zeroing(&mut self) -> Result<()> {
        self.require("stop field zeroing", LIVE)?;
        self.send(Command::FieldZero(false))?;
        if std::mem::take(&mut self.session.zeroing_active) {
            self.session.field_zeroed = true;
        } else {
            debug!("field zeroing was not running");
        }
        if self.state == DeviceState::ZeroingActive {
            self.set_state(DeviceState::Ready);
        }
        Ok(())
    }

    fn read_zeroing_cycle(&mut self, clear: bool) -> Result<ZeroingReading> {
        let count = self.config.offset_samples_per_cycle.max(1);
        let reading = self.read_offsets_raw(count, clear)?;
        let field = reading
            .latest_field()
            .ok_or_else(|| DriverError::Parse("offset read returned no sample".into()))?;
        Ok(ZeroingReading {
            field,
            cell_temp_error: reading.cell_temp_error,
        })
    }

    /// Zero the internal coil fields. Invalidates zeroing and calibration.
    pub fn field_reset(&mut self) -> Result<()> {
        self.require("field reset", IDLE)?;
        let timeout = self.config.ack_timeout;
        let reply = self.command_with_reply(Command::FieldReset, timeout, |text| {
            Command::FieldReset.answered_by(text).then_some(())
        })?;
        if reply.is_none() {
            debug!("no message after field reset");
        }
        self.session.field_zeroed = false;
        self.session.invalidate_calibration();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Modes
    // ------------------------------------------------------------------------

    /// Set the analog output gain. Recorded only once the device answers.
    pub fn set_gain(&mut self, mode: GainMode) -> Result<()> {
        self.require("set gain", IDLE)?;
        self.acknowledge(Command::Gain(mode))?;
        self.session.gain_mode = mode;
        info!("gain {} ({} V/nT)", mode, mode.volts_per_nanotesla());
        Ok(())
    }

    /// Change the field-sensitive axis. Triaxial sensors ignore this command,
    /// which surfaces as `CommandIgnored`.
    pub fn set_axis_mode(&mut self, mode: AxisMode) -> Result<()> {
        self.require("set axis mode", IDLE)?;
        self.acknowledge(Command::AxisMode(mode))?;
        self.session.axis_mode = mode;
        self.session.field_zeroed = false;
        self.session.invalidate_calibration();
        info!("axis mode {}", mode);
        Ok(())
    }

    /// Reboot the microcontroller. The sensor must be started again.
    pub fn reboot(&mut self) -> Result<()> {
        self.require("reboot", LIVE)?;
        self.send(Command::Reboot)?;
        self.session.reset();
        self.set_state(DeviceState::Connected);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Acquisition
    // ------------------------------------------------------------------------

    pub fn start_data_stream(&mut self) -> Result<()> {
        self.require("start data stream", IDLE)?;
        if !self.session.data_streaming {
            self.send(Command::DataStream(true))?;
            self.session.data_streaming = true;
        }
        Ok(())
    }

    pub fn stop_data_stream(&mut self) -> Result<()> {
        self.require("stop data stream", LIVE)?;
        self.ensure_status_stream()
    }

    /// Acquire field samples from the configured sample source.
    pub fn read_data(&mut self, request: AcquisitionRequest) -> Result<Vec<DataSample>> {
        self.require("read data", IDLE)?;
        requested_samples(&request, self.config.field_sample_rate_hz)?;
        self.select_read_axis(request.axis)?;
        let mut ctx = AcquisitionContext {
            transport: &mut *self.transport,
            session: &mut self.session,
            config: &self.config,
        };
        let read = match self.sampler.start_acquisition(&mut ctx, &request) {
            Ok(()) => self.sampler.read_samples(&mut ctx, &request),
            Err(e) => Err(e),
        };
        let stopped = self.sampler.stop(&mut ctx);
        let result = read.and_then(|samples| stopped.map(|()| samples));
        self.track(result)
    }

    /// Read field windows of `window` length until `cancel` fires.
    ///
    /// The window must hold at least one sample period. The stream stays on
    /// between windows. Returns the number of batches delivered.
    pub fn monitor_data(
        &mut self,
        axis: ReadAxis,
        window: Duration,
        cancel: &CancelToken,
        mut on_batch: impl FnMut(&[DataSample]),
    ) -> Result<usize> {
        self.require("monitor data", IDLE)?;
        let request = AcquisitionRequest::duration(window, axis);
        if requested_samples(&request, self.config.field_sample_rate_hz)? == 0 {
            return Err(DriverError::UnsupportedOperation(format!(
                "monitor window {window:?} is shorter than one sample period"
            )));
        }
        self.select_read_axis(axis)?;
        let mut ctx = AcquisitionContext {
            transport: &mut *self.transport,
            session: &mut self.session,
            config: &self.config,
        };
        let mut batches = 0;
        let mut run = self.sampler.start_acquisition(&mut ctx, &request);
        while run.is_ok() && !cancel.is_cancelled() {
            match self.sampler.read_samples(&mut ctx, &request) {
                Ok(samples) => {
                    batches += 1;
                    on_batch(&samples);
                }
                Err(e) => run = Err(e),
            }
        }
        let stopped = self.sampler.stop(&mut ctx);
        let result = run.and(stopped).map(|()| batches);
        self.track(result)
    }

    /// Route `axis` to the field stream. Recorded only once the device answers.
    fn select_read_axis(&mut self, axis: ReadAxis) -> Result<()> {
        if self.session.read_axis == axis {
            return Ok(());
        }
        let streaming = self.session.data_streaming;
        self.acknowledge(Command::ReadAxis(axis))?;
        self.session.read_axis = axis;
        info!("reading axis {}", axis);
        if streaming {
            self.send(Command::DataStream(true))?;
            self.session.data_streaming = true;
        }
        Ok(())
    }

    /// Acquire `count` coil offset samples `[x, y, z]` from the status stream.
    pub fn read_offsets(&mut self, count: usize, clear_buffer: bool) -> Result<OffsetReading> {
        self.require(
            "read offsets",
            &[DeviceState::Connected, DeviceState::Ready, DeviceState::ZeroingActive],
        )?;
        let result = self.read_offsets_raw(count, clear_buffer);
        self.track(result)
    }

    fn read_offsets_raw(&mut self, count: usize, clear_buffer: bool) -> Result<OffsetReading> {
        let mut ctx = AcquisitionContext {
            transport: &mut *self.transport,
            session: &mut self.session,
            config: &self.config,
        };
        self.offsets.read_offsets(&mut ctx, count, clear_buffer)
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    fn set_state(&mut self, next: DeviceState) {
        if self.state != next {
            info!("state {} -> {}", self.state, next);
            self.state = next;
        }
    }

    fn require(&self, operation: &str, allowed: &[DeviceState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(DriverError::invalid_transition(self.state, operation))
        }
    }

    /// A lost link ends the session.
    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(DriverError::Connection(reason)) = &result {
            warn!("link lost: {}", reason);
            self.set_state(DeviceState::Error);
        }
        result
    }

    fn send(&mut self, command: Command) -> Result<()> {
        let result = send_command(&mut *self.transport, command, self.config.command_delay);
        self.track(result)
    }

    /// Status lines are only printed while the data stream is off.
    fn ensure_status_stream(&mut self) -> Result<()> {
        if self.session.data_streaming {
            self.send(Command::DataStream(false))?;
            self.session.data_streaming = false;
        }
        Ok(())
    }

    fn read_status(&mut self, clear_buffer: bool) -> Result<StatusSnapshot> {
        self.ensure_status_stream()?;
        if clear_buffer {
            self.transport.clear_input_buffer()?;
        }
        let chunk = self
            .transport
            .read(self.parser.read_size(), self.config.serial.read_timeout)?;
        let parsed = self.parser.parse(&chunk, epoch_micros())?;
        Ok(self.session.apply_status(parsed).clone())
    }

    fn poll_status(&mut self, clear_buffer: bool) -> Result<StatusSnapshot> {
        self.with_retries("status read", |m| m.read_status(clear_buffer))
    }

    /// Run `op` until it succeeds, retrying transient failures with backoff.
    /// An exhausted budget moves the driver to `Error`.
    fn with_retries<T>(
        &mut self,
        what: &str,
        mut op: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let budget = self.config.status_retry_budget.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(self) {
                Ok(value) => return Ok(value),
                Err(e) if retryable(&e) && attempt < budget => {
                    let delay = self.config.backoff(attempt);
                    warn!(
                        "{} attempt {}/{} failed: {} (retrying in {:?})",
                        what, attempt, budget, e, delay
                    );
                    thread::sleep(delay);
                }
                Err(e) if retryable(&e) => {
                    warn!("{} failed {} times, giving up: {}", what, attempt, e);
                    self.set_state(DeviceState::Error);
                    return Err(DriverError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => return self.track(Err(e)),
            }
        }
    }

    /// Read status chunks until `accept` takes a message or `timeout` passes.
    ///
    /// Every message seen is logged whether accepted or not. At least one
    /// read is made even with a zero timeout.
    fn await_message<T>(
        &mut self,
        timeout: Duration,
        mut accept: impl FnMut(&str) -> Option<T>,
    ) -> Result<Option<T>> {
        self.ensure_status_stream()?;
        let deadline = Instant::now() + timeout;
        loop {
            let read = self
                .transport
                .read(self.parser.read_size(), self.config.serial.read_timeout);
            let chunk = self.track(read)?;
            let now = epoch_micros();

            let mut accepted = None;
            for line in codec::complete_lines(&chunk) {
                if codec::classify(line.as_bytes()) != FrameKind::Message {
                    continue;
                }
                if let Some(text) = codec::decode_message(&line) {
                    debug!("device message: {}", text);
                    self.session.messages.push(text, now);
                    if accepted.is_none() {
                        accepted = accept(text);
                    }
                }
            }

            if accepted.is_some() || Instant::now() >= deadline {
                return Ok(accepted);
            }
            if chunk.is_empty() {
                thread::sleep(self.config.poll_interval);
            }
        }
    }

    /// Send `command` on a quiet status stream and wait for `accept` to take a reply.
    ///
    /// Input already buffered before the command is dropped, so a stale
    /// message cannot pass for the answer.
    fn command_with_reply<T>(
        &mut self,
        command: Command,
        timeout: Duration,
        accept: impl FnMut(&str) -> Option<T>,
    ) -> Result<Option<T>> {
        self.ensure_status_stream()?;
        let cleared = self.transport.clear_input_buffer();
        self.track(cleared)?;
        self.send(command)?;
        self.await_message(timeout, accept)
    }

    /// Send `command` and wait for a message naming it.
    fn acknowledge(&mut self, command: Command) -> Result<()> {
        let timeout = self.config.ack_timeout;
        let reply = self.command_with_reply(command, timeout, |text| {
            command.answered_by(text).then(|| text.to_string())
        })?;
        match reply {
            Some(text) => {
                debug!("{} acknowledged: {}", command, text);
                Ok(())
            }
            None => {
                warn!("no answer to {} within {:?}", command, timeout);
                Err(DriverError::CommandIgnored(format!(
                    "{command}: no answer within {timeout:?}"
                )))
            }
        }
    }
}

impl Drop for Magnetometer {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::status_block;
    use crate::transport::MockTransport;

    const SIZE: usize = 64;

    fn config() -> DriverConfig {
        let mut config = DriverConfig {
            command_delay: Duration::ZERO,
            poll_interval: Duration::ZERO,
            retry_delay: Duration::ZERO,
            ack_timeout: Duration::ZERO,
            calibration_timeout: Duration::ZERO,
            zero_settle: Duration::ZERO,
            status_retry_budget: 2,
            ..DriverConfig::default()
        };
        config.serial.status_read_size = SIZE;
        config
    }

    #[test]
    fn display_names() {
        assert_eq!(DeviceState::ZeroingActive.to_string(), "zeroing");
        assert_eq!(DeviceState::Ready.to_string(), "ready");
    }

    #[test]
    fn non_blocking_start_only_sends_command() {
        let mock = MockTransport::new();
        let mut mag = Magnetometer::with_transport(mock.clone(), config());
        let options = AutoStartOptions {
            block: false,
            ..Default::default()
        };

        mag.auto_start(options, &CancelToken::new()).unwrap();

        assert_eq!(mag.state(), DeviceState::Starting);
        assert_eq!(mock.written_bytes(), b">");
        assert_eq!(mock.read_calls(), 0);
    }

    #[test]
    fn garbage_status_exhausts_retries_into_error() {
        let mock = MockTransport::new();
        mock.queue_read(status_block(&["#nothing useful"], SIZE));
        mock.queue_read(status_block(&["#still nothing"], SIZE));
        let mut mag = Magnetometer::with_transport(mock.clone(), config());
        mag.auto_start(
            AutoStartOptions {
                block: false,
                ..Default::default()
            },
            &CancelToken::new(),
        )
        .unwrap();

        let err = mag.poll_startup().unwrap_err();

        assert!(matches!(err, DriverError::RetriesExhausted { attempts: 2, .. }));
        assert_eq!(mag.state(), DeviceState::Error);
        assert!(mag.session().status().is_none());
        assert!(matches!(
            mag.read_data(AcquisitionRequest::samples(1, ReadAxis::Z)),
            Err(DriverError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn lost_link_is_terminal_until_reconnect() {
        let mock = MockTransport::new();
        let mut mag = Magnetometer::with_transport(mock.clone(), config());
        mock.disconnect();

        let err = mag.update_status(true).unwrap_err();
        assert!(matches!(err, DriverError::Connection(_)));
        assert_eq!(mag.state(), DeviceState::Error);

        mock.reconnect();
        mag.reconnect().unwrap();
        assert_eq!(mag.state(), DeviceState::Connected);
    }

    #[test]
    fn disconnect_stops_stream_and_resets_session() {
        let mock = MockTransport::new();
        let mut mag = Magnetometer::with_transport(mock.clone(), config());
        mag.start_data_stream().unwrap();

        mag.disconnect();

        assert_eq!(mock.written_bytes(), b"78");
        assert_eq!(mag.state(), DeviceState::Disconnected);
        assert!(!mag.session().is_data_streaming());
        assert!(!mock.is_open());
        assert!(mag.update_status(true).is_err());
    }
}
