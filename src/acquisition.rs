//! Timestamped sample acquisition.
//!
//! # Timing
//!
//! The QZFM does not timestamp its output. Sample `k` of a read is stamped
//! `T0 + k / rate`, where `T0` is taken right after the input buffer is
//! cleared and `rate` is the nominal rate of the stream being read (200 Hz
//! field stream, 7.5 Hz offset stream while zeroing). The error of a
//! reconstructed timestamp is therefore bounded by one sample period.
//!
//! The first fragment of every read is a partial frame and never becomes a
//! sample, even when the clear happened to land on a frame boundary.
//!
//! A single call may ask for at most [`MAX_REQUEST_SAMPLES`] samples.

use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;

use crate::codec::{self, Command, FrameKind, LineAssembler, ParameterCode, ReadAxis};
use crate::config::DriverConfig;
use crate::errors::{DriverError, Result};
use crate::session::{epoch_micros, SessionState};
use crate::transport::{send_command, Transport};

/// One reconstructed measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataSample {
    /// Microseconds since the Unix epoch.
    pub timestamp_us: u64,
    /// Field in pT: one component for the field stream, `[x, y, z]` for offsets.
    pub field: Vec<f64>,
}

/// How much to acquire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleCount {
    Count(usize),
    /// Converted to `floor(duration * rate)` samples.
    Duration(Duration),
}

impl SampleCount {
    pub fn samples_at(&self, rate_hz: f64) -> usize {
        match *self {
            SampleCount::Count(n) => n,
            SampleCount::Duration(d) => (d.as_secs_f64() * rate_hz).floor() as usize,
        }
    }
}

/// Parameters of one acquisition call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquisitionRequest {
    pub count: SampleCount,
    pub axis: ReadAxis,
    pub clear_buffer_first: bool,
}

impl AcquisitionRequest {
    pub fn samples(n: usize, axis: ReadAxis) -> Self {
        Self {
            count: SampleCount::Count(n),
            axis,
            clear_buffer_first: true,
        }
    }

    pub fn duration(d: Duration, axis: ReadAxis) -> Self {
        Self {
            count: SampleCount::Duration(d),
            axis,
            clear_buffer_first: true,
        }
    }

    pub fn without_clear(mut self) -> Self {
        self.clear_buffer_first = false;
        self
    }
}

/// Borrowed driver internals handed to a [`SampleSource`] for one call.
pub struct AcquisitionContext<'a> {
    pub transport: &'a mut dyn Transport,
    pub session: &'a mut SessionState,
    pub config: &'a DriverConfig,
}

impl AcquisitionContext<'_> {
    pub fn send(&mut self, command: Command) -> Result<()> {
        send_command(&mut *self.transport, command, self.config.command_delay)
    }

    fn log_message(&mut self, text: &str) {
        debug!("device message during acquisition: {}", text);
        self.session.messages.push(text, epoch_micros());
    }
}

/// Something that produces field samples.
///
/// The control state machine only talks to this interface, so an analog
/// digitizer can stand in for the serial stream without touching the
/// procedures. Every `start_acquisition` is followed by exactly one `stop`,
/// also when reading failed.
pub trait SampleSource: Send {
    fn start_acquisition(
        &mut self,
        ctx: &mut AcquisitionContext<'_>,
        request: &AcquisitionRequest,
    ) -> Result<()>;

    fn read_samples(
        &mut self,
        ctx: &mut AcquisitionContext<'_>,
        request: &AcquisitionRequest,
    ) -> Result<Vec<DataSample>>;

    fn stop(&mut self, ctx: &mut AcquisitionContext<'_>) -> Result<()>;
}

/// Largest sample count one acquisition call accepts (a day of field stream).
pub const MAX_REQUEST_SAMPLES: usize = 24 * 3600 * 200;

/// Upper bound on up-front allocation and on a single transport read.
const PREALLOC_SAMPLES: usize = 4096;
const MAX_READ_BYTES: usize = 4096;

/// Timestamp of retained sample `k`.
pub fn sample_timestamp(t0_us: u64, k: usize, rate_hz: f64) -> u64 {
    t0_us + (k as f64 * 1e6 / rate_hz).round() as u64
}

fn check_rate(rate_hz: f64) -> Result<()> {
    if rate_hz.is_finite() && rate_hz > 0.0 {
        Ok(())
    } else {
        Err(DriverError::UnsupportedOperation(format!(
            "sample rate {rate_hz} Hz"
        )))
    }
}

/// Number of samples `request` asks for at `rate_hz`, bounded by [`MAX_REQUEST_SAMPLES`].
pub fn requested_samples(request: &AcquisitionRequest, rate_hz: f64) -> Result<usize> {
    check_rate(rate_hz)?;
    let requested = request.count.samples_at(rate_hz);
    if requested > MAX_REQUEST_SAMPLES {
        return Err(DriverError::UnsupportedOperation(format!(
            "{requested} samples in one call (limit {MAX_REQUEST_SAMPLES})"
        )));
    }
    Ok(requested)
}

/// Clear (if requested) and return the reference time of sample 0.
fn mark_t0(ctx: &mut AcquisitionContext<'_>, clear: bool) -> Result<u64> {
    if clear {
        ctx.transport.clear_input_buffer()?;
    }
    Ok(epoch_micros())
}

// ============================================================================
// Field stream
// ============================================================================

/// Reads the digital field stream over the serial link.
#[derive(Debug, Default)]
pub struct SerialReader {
    toggled_stream: bool,
}

impl SerialReader {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SampleSource for SerialReader {
    /// The read axis is selected by the caller; this only turns the stream on.
    fn start_acquisition(
        &mut self,
        ctx: &mut AcquisitionContext<'_>,
        _request: &AcquisitionRequest,
    ) -> Result<()> {
        if !ctx.session.data_streaming {
            ctx.send(Command::DataStream(true))?;
            ctx.session.data_streaming = true;
            self.toggled_stream = true;
        }
        Ok(())
    }

    fn read_samples(
        &mut self,
        ctx: &mut AcquisitionContext<'_>,
        request: &AcquisitionRequest,
    ) -> Result<Vec<DataSample>> {
        let rate = ctx.config.field_sample_rate_hz;
        let requested = requested_samples(request, rate)?;
        if requested == 0 {
            return Ok(Vec::new());
        }

        let t0 = mark_t0(ctx, request.clear_buffer_first)?;
        let mut assembler = LineAssembler::new();
        let mut samples = Vec::with_capacity(requested.min(PREALLOC_SAMPLES));
        let mut idle_reads = 0u32;
        let mut bad_words = 0usize;

        while samples.len() < requested {
            // One extra frame covers the lead-in fragment.
            let want = (requested - samples.len())
                .saturating_add(1)
                .saturating_mul(codec::FIELD_FRAME_BYTES)
                .min(MAX_READ_BYTES);
            let chunk = ctx.transport.read(want, ctx.config.serial.read_timeout)?;
            let before = samples.len();

            for line in assembler.push(&chunk) {
                match codec::classify(line.as_bytes()) {
                    FrameKind::Data => {
                        if samples.len() == requested {
                            break;
                        }
                        if let Some(value) = codec::decode_field(&line) {
                            if value.is_nan() {
                                bad_words += 1;
                            }
                            samples.push(DataSample {
                                timestamp_us: sample_timestamp(t0, samples.len(), rate),
                                field: vec![value],
                            });
                        }
                    }
                    FrameKind::Message => {
                        if let Some(text) = codec::decode_message(&line) {
                            ctx.log_message(text);
                        }
                    }
                    FrameKind::Status | FrameKind::Unrecognized => {}
                }
            }

            if samples.len() > before {
                idle_reads = 0;
            } else {
                idle_reads += 1;
                if idle_reads >= ctx.config.acquisition_read_attempts {
                    return Err(DriverError::AcquisitionTimeout {
                        requested,
                        received: samples.len(),
                        attempts: idle_reads,
                    });
                }
            }
        }

        if bad_words > 0 {
            warn!("{} malformed field words in batch (stored as NaN)", bad_words);
        }
        debug!(
            "read {} field samples on axis {} from t0={}",
            samples.len(),
            request.axis,
            t0
        );
        Ok(samples)
    }

    fn stop(&mut self, ctx: &mut AcquisitionContext<'_>) -> Result<()> {
        if std::mem::take(&mut self.toggled_stream) {
            ctx.send(Command::DataStream(false))?;
            ctx.session.data_streaming = false;
        }
        Ok(())
    }
}

// ============================================================================
// Offset stream
// ============================================================================

/// Result of an offset read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OffsetReading {
    /// One sample per complete x/y/z triplet, components `[x, y, z]` in pT.
    pub samples: Vec<DataSample>,
    /// Latest cell temperature error seen during the read.
    pub cell_temp_error: Option<f64>,
}

impl OffsetReading {
    pub fn latest_field(&self) -> Option<[f64; 3]> {
        self.samples
            .last()
            .and_then(|s| <[f64; 3]>::try_from(s.field.as_slice()).ok())
    }
}

/// Reads the coil compensation fields from the status stream while zeroing.
#[derive(Debug, Default)]
pub struct OffsetReader {
    toggled_stream: bool,
    cell_temp_error: Option<f64>,
}

impl OffsetReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `count` offset samples.
    pub fn read_offsets(
        &mut self,
        ctx: &mut AcquisitionContext<'_>,
        count: usize,
        clear_buffer_first: bool,
    ) -> Result<OffsetReading> {
        let request = AcquisitionRequest {
            count: SampleCount::Count(count),
            axis: ctx.session.read_axis,
            clear_buffer_first,
        };
        self.start_acquisition(ctx, &request)?;
        let read = self.read_samples(ctx, &request);
        let stopped = self.stop(ctx);
        let samples = read?;
        stopped?;
        Ok(OffsetReading {
            samples,
            cell_temp_error: self.cell_temp_error,
        })
    }
}

impl SampleSource for OffsetReader {
    fn start_acquisition(
        &mut self,
        ctx: &mut AcquisitionContext<'_>,
        _request: &AcquisitionRequest,
    ) -> Result<()> {
        // Offsets only appear in the status stream.
        if ctx.session.data_streaming {
            ctx.send(Command::DataStream(false))?;
            ctx.session.data_streaming = false;
            self.toggled_stream = true;
        }
        self.cell_temp_error = None;
        Ok(())
    }

    fn read_samples(
        &mut self,
        ctx: &mut AcquisitionContext<'_>,
        request: &AcquisitionRequest,
    ) -> Result<Vec<DataSample>> {
        let rate = ctx.config.offset_sample_rate_hz;
        let requested = requested_samples(request, rate)?;
        if requested == 0 {
            return Ok(Vec::new());
        }

        let t0 = mark_t0(ctx, request.clear_buffer_first)?;
        let mut assembler = LineAssembler::new();
        let mut samples = Vec::with_capacity(requested.min(PREALLOC_SAMPLES));
        let mut triplet: [Option<f64>; 3] = [None; 3];
        let mut idle_reads = 0u32;

        while samples.len() < requested {
            let chunk = ctx
                .transport
                .read(ctx.config.serial.status_read_size, ctx.config.serial.read_timeout)?;
            let before = samples.len();

            for line in assembler.push(&chunk) {
                match codec::classify(line.as_bytes()) {
                    FrameKind::Status => {
                        let Some((code, value)) = codec::decode_parameter(&line) else {
                            continue;
                        };
                        match code {
                            ParameterCode::B0 => triplet[0] = Some(value),
                            ParameterCode::By => triplet[1] = Some(value),
                            ParameterCode::Bz => triplet[2] = Some(value),
                            ParameterCode::CellTempError => self.cell_temp_error = Some(value),
                            ParameterCode::CellTempVoltage => {}
                        }
                        if let [Some(x), Some(y), Some(z)] = triplet {
                            if samples.len() < requested {
                                samples.push(DataSample {
                                    timestamp_us: sample_timestamp(t0, samples.len(), rate),
                                    field: vec![x, y, z],
                                });
                            }
                            triplet = [None; 3];
                        }
                    }
                    FrameKind::Message => {
                        if let Some(text) = codec::decode_message(&line) {
                            ctx.log_message(text);
                        }
                    }
                    FrameKind::Data | FrameKind::Unrecognized => {}
                }
            }

            if samples.len() > before {
                idle_reads = 0;
            } else {
                idle_reads += 1;
                if idle_reads >= ctx.config.acquisition_read_attempts {
                    return Err(DriverError::AcquisitionTimeout {
                        requested,
                        received: samples.len(),
                        attempts: idle_reads,
                    });
                }
            }
        }

        debug!("read {} offset samples from t0={}", samples.len(), t0);
        Ok(samples)
    }

    fn stop(&mut self, ctx: &mut AcquisitionContext<'_>) -> Result<()> {
        if std::mem::take(&mut self.toggled_stream) {
            ctx.send(Command::DataStream(true))?;
            ctx.session.data_streaming = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{field_line, status_block};
    use crate::transport::MockTransport;

    fn quick_config() -> DriverConfig {
        DriverConfig {
            command_delay: Duration::ZERO,
            acquisition_read_attempts: 3,
            ..DriverConfig::default()
        }
    }

    fn stream(values: &[f64]) -> Vec<u8> {
        // Truncated word left over from before the clear.
        let mut bytes = b"8708\r\n".to_vec();
        for v in values {
            bytes.extend_from_slice(field_line(*v).as_bytes());
        }
        bytes
    }

    fn acquire(
        mock: &MockTransport,
        session: &mut SessionState,
        config: &DriverConfig,
        request: AcquisitionRequest,
    ) -> Result<Vec<DataSample>> {
        let mut link = mock.clone();
        let mut ctx = AcquisitionContext {
            transport: &mut link,
            session,
            config,
        };
        let mut reader = SerialReader::new();
        reader.start_acquisition(&mut ctx, &request)?;
        let read = reader.read_samples(&mut ctx, &request);
        reader.stop(&mut ctx)?;
        read
    }

    #[test]
    fn lead_in_is_never_a_sample() {
        let mock = MockTransport::new();
        mock.queue_read(stream(&[1.0, 2.0, 3.0]));
        let config = quick_config();
        let mut session = SessionState::default();

        let samples = acquire(
            &mock,
            &mut session,
            &config,
            AcquisitionRequest::samples(3, ReadAxis::Z),
        )
        .unwrap();

        let values: Vec<f64> = samples.iter().map(|s| s.field[0]).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
        assert_eq!(mock.clear_calls(), 1);
    }

    #[test]
    fn exact_count_with_nominal_spacing() {
        let mock = MockTransport::new();
        let values: Vec<f64> = (0..12).map(|i| i as f64 * 0.5).collect();
        let bytes = stream(&values);
        let (head, tail) = bytes.split_at(37);
        mock.queue_read(head.to_vec());
        mock.queue_silence();
        mock.queue_read(tail.to_vec());
        let config = quick_config();
        let mut session = SessionState::default();

        let samples = acquire(
            &mock,
            &mut session,
            &config,
            AcquisitionRequest::samples(10, ReadAxis::Z),
        )
        .unwrap();

        assert_eq!(samples.len(), 10);
        for pair in samples.windows(2) {
            let dt = pair[1].timestamp_us - pair[0].timestamp_us;
            assert_eq!(dt, 5_000);
        }
    }

    #[test]
    fn duration_request_is_floored_to_samples() {
        let count = SampleCount::Duration(Duration::from_millis(52));
        assert_eq!(count.samples_at(200.0), 10);
        assert_eq!(SampleCount::Count(4).samples_at(200.0), 4);
    }

    #[test]
    fn stream_is_toggled_and_restored() {
        let mock = MockTransport::new();
        mock.queue_read(stream(&[0.0]));
        let config = quick_config();
        let mut session = SessionState::default();

        acquire(
            &mock,
            &mut session,
            &config,
            AcquisitionRequest::samples(1, ReadAxis::Y),
        )
        .unwrap();

        // Axis selection needs an answer from the device, so the reader leaves it alone.
        assert_eq!(mock.written_bytes(), b"78");
        assert!(!session.is_data_streaming());
        assert_eq!(session.read_axis(), ReadAxis::Z);
    }

    #[test]
    fn oversized_requests_are_refused_before_reading() {
        let mock = MockTransport::new();
        let config = quick_config();
        let mut session = SessionState::default();

        for request in [
            AcquisitionRequest::samples(usize::MAX, ReadAxis::Z),
            AcquisitionRequest::duration(Duration::from_secs(u64::MAX), ReadAxis::Z),
        ] {
            let err = acquire(&mock, &mut session, &config, request).unwrap_err();
            assert!(matches!(err, DriverError::UnsupportedOperation(_)));
        }
        assert_eq!(mock.read_calls(), 0);
        assert!(!session.is_data_streaming());
    }

    #[test]
    fn day_long_request_is_within_limit() {
        let request = AcquisitionRequest::duration(Duration::from_secs(24 * 3600), ReadAxis::Z);
        assert_eq!(requested_samples(&request, 200.0).unwrap(), MAX_REQUEST_SAMPLES);
    }

    #[test]
    fn already_streaming_is_left_on() {
        let mock = MockTransport::new();
        mock.queue_read(stream(&[0.0]));
        let config = quick_config();
        let mut session = SessionState::default();
        session.data_streaming = true;

        acquire(
            &mock,
            &mut session,
            &config,
            AcquisitionRequest::samples(1, ReadAxis::Z),
        )
        .unwrap();

        assert!(mock.written_bytes().is_empty());
        assert!(session.is_data_streaming());
    }

    #[test]
    fn starved_read_times_out_and_still_restores_stream() {
        let mock = MockTransport::new();
        mock.queue_read(stream(&[1.0]));
        let config = quick_config();
        let mut session = SessionState::default();

        let err = acquire(
            &mock,
            &mut session,
            &config,
            AcquisitionRequest::samples(4, ReadAxis::Z),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            DriverError::AcquisitionTimeout {
                requested: 4,
                received: 1,
                attempts: 3
            }
        ));
        assert!(!session.is_data_streaming());
        assert_eq!(mock.written_bytes(), b"78");
    }

    #[test]
    fn bad_width_word_keeps_its_slot() {
        let mock = MockTransport::new();
        let mut bytes = stream(&[1.0]);
        bytes.extend_from_slice(b"!838860\r\n");
        bytes.extend_from_slice(field_line(3.0).as_bytes());
        mock.queue_read(bytes);
        let config = quick_config();
        let mut session = SessionState::default();

        let samples = acquire(
            &mock,
            &mut session,
            &config,
            AcquisitionRequest::samples(3, ReadAxis::Z),
        )
        .unwrap();

        assert!(samples[1].field[0].is_nan());
        assert_eq!(samples[2].field[0], 3.0);
        assert_eq!(samples[2].timestamp_us - samples[0].timestamp_us, 10_000);
    }

    #[test]
    fn offsets_emit_complete_triplets() {
        let mock = MockTransport::new();
        let config = DriverConfig {
            serial: crate::config::SerialSettings {
                status_read_size: 96,
                ..Default::default()
            },
            ..quick_config()
        };
        mock.queue_read(status_block(
            &["~0732868", "~0832768", "~0932668", "~048388608", "#zeroing", "~0732870"],
            96,
        ));
        mock.queue_read(status_block(&["~0832770", "~0932670"], 96));
        let mut session = SessionState::default();
        let mut link = mock.clone();
        let mut ctx = AcquisitionContext {
            transport: &mut link,
            session: &mut session,
            config: &config,
        };

        let reading = OffsetReader::new().read_offsets(&mut ctx, 2, true).unwrap();

        assert_eq!(reading.samples.len(), 2);
        assert_eq!(reading.samples[0].field, vec![-100.0, 0.0, 100.0]);
        assert_eq!(reading.latest_field(), Some([-98.0, 2.0, 102.0]));
        assert_eq!(reading.cell_temp_error, Some(0.0));
        let dt = reading.samples[1].timestamp_us - reading.samples[0].timestamp_us;
        assert_eq!(dt, 133_333);
        assert_eq!(session.messages().len(), 1);
    }
}
