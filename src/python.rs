//! Python bindings, exposed as the `_core` extension module.

use std::time::Duration;

use log::LevelFilter;
use pyo3::exceptions::{
    PyConnectionError, PyKeyboardInterrupt, PyRuntimeError, PyTimeoutError, PyValueError,
};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::acquisition::{AcquisitionRequest, DataSample};
use crate::cancel::CancelToken;
use crate::codec::{AxisMode, GainMode, ReadAxis, ZeroingAxes};
use crate::config::{DriverConfig, FIELD_SAMPLE_RATE_HZ, OFFSET_SAMPLE_RATE_HZ};
use crate::errors::DriverError;
use crate::logging;
use crate::magnetometer::{AutoStartOptions, Magnetometer, ZeroingOptions, ZeroingOutcome};
use crate::status::StatusSnapshot;
use crate::zeroing::ZeroingThresholds;

impl From<DriverError> for PyErr {
    fn from(err: DriverError) -> Self {
        let msg = err.to_string();
        match err {
            DriverError::Io(_) | DriverError::Serial(_) | DriverError::Connection(_) => {
                PyConnectionError::new_err(msg)
            }
            DriverError::UnsupportedOperation(_) => PyValueError::new_err(msg),
            DriverError::AcquisitionTimeout { .. } | DriverError::CalibrationTimeout(_) => {
                PyTimeoutError::new_err(msg)
            }
            DriverError::Cancelled => PyKeyboardInterrupt::new_err(msg),
            _ => PyRuntimeError::new_err(msg),
        }
    }
}

/// A token that fires on Ctrl-C (or any signal handler that raises).
///
/// The pending exception is consumed here; callers that stop on it return
/// normally or raise `KeyboardInterrupt` through [`DriverError::Cancelled`].
fn interruptible() -> CancelToken {
    CancelToken::with_check(|| Python::attach(|py| py.check_signals().is_err()))
}

fn duration_from_secs(seconds: f64) -> PyResult<Duration> {
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| PyValueError::new_err(format!("seconds={seconds}: {e}")))
}

fn status_dict<'py>(py: Python<'py>, status: &StatusSnapshot) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    dict.set_item("laser_on", status.leds.laser_on)?;
    dict.set_item("cell_temp_locked", status.leds.cell_temp_locked)?;
    dict.set_item("laser_locked", status.leds.laser_locked)?;
    dict.set_item("field_zeroed", status.leds.field_zeroed)?;
    dict.set_item("is_master", status.leds.is_master)?;
    for (parameter, value) in &status.parameters {
        dict.set_item(parameter.name(), *value)?;
    }
    dict.set_item("timestamp_us", status.timestamp_us)?;
    Ok(dict)
}

fn thresholds(dbx: f64, dby: f64, dbz: f64, dt: f64) -> ZeroingThresholds {
    ZeroingThresholds::disabled()
        .with_bx(dbx)
        .with_by(dby)
        .with_bz(dbz)
        .with_temp(dt)
}

fn zeroing_axes(axes_xyz: bool) -> ZeroingAxes {
    if axes_xyz {
        ZeroingAxes::All
    } else {
        ZeroingAxes::YZ
    }
}

/// A single timestamped field sample.
///
/// Attributes:
///     timestamp_us: Microseconds since the Unix epoch (reconstructed, not device time).
///     field: Field in pT. One value for field data, [x, y, z] for offsets.
#[pyclass(name = "DataSample", frozen)]
#[derive(Clone)]
struct PyDataSample {
    #[pyo3(get)]
    timestamp_us: u64,
    #[pyo3(get)]
    field: Vec<f64>,
}

#[pymethods]
impl PyDataSample {
    fn __repr__(&self) -> String {
        format!(
            "DataSample(timestamp_us={}, field={:?})",
            self.timestamp_us, self.field
        )
    }

    /// Timestamp in seconds since the Unix epoch.
    #[getter]
    fn time(&self) -> f64 {
        self.timestamp_us as f64 * 1e-6
    }

    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("timestamp_us", self.timestamp_us)?;
        dict.set_item("field", self.field.clone())?;
        Ok(dict)
    }
}

impl From<DataSample> for PyDataSample {
    fn from(s: DataSample) -> Self {
        PyDataSample {
            timestamp_us: s.timestamp_us,
            field: s.field,
        }
    }
}

/// QuSpin QZFM magnetometer on a serial port.
///
/// Example:
///     >>> mag = Magnetometer("/dev/ttyUSB0")
///     >>> mag.auto_start(zero_calibrate=True, dbz=5.0)
///     >>> samples = mag.read_data(seconds=1.0, axis="z")
///     >>> mag.disconnect()
#[pyclass(name = "Magnetometer", unsendable)]
struct PyMagnetometer {
    inner: Magnetometer,
}

#[pymethods]
impl PyMagnetometer {
    /// Open the serial port at `port` (e.g. `/dev/ttyUSB0` or `COM3`).
    #[new]
    #[pyo3(signature = (port, status_read_size=1000))]
    fn new(port: &str, status_read_size: usize) -> PyResult<Self> {
        let mut config = DriverConfig::default();
        config.serial.status_read_size = status_read_size;
        Ok(PyMagnetometer {
            inner: Magnetometer::connect_serial(port, config)?,
        })
    }

    /// Run the automated startup.
    ///
    /// Args:
    ///     block: Wait for laser and temperature lock.
    ///     zero_calibrate: Field zero and calibrate once locked. Forces block.
    ///     dbx, dby, dbz, dt: Zeroing convergence thresholds (pT, temperature
    ///         error units). inf disables a threshold.
    ///     axes_xyz: Zero all three axes, or only Y and Z.
    #[pyo3(signature = (block=true, zero_calibrate=false, dbx=f64::INFINITY, dby=f64::INFINITY, dbz=f64::INFINITY, dt=f64::INFINITY, axes_xyz=true))]
    #[allow(clippy::too_many_arguments)]
    fn auto_start(
        &mut self,
        block: bool,
        zero_calibrate: bool,
        dbx: f64,
        dby: f64,
        dbz: f64,
        dt: f64,
        axes_xyz: bool,
    ) -> PyResult<()> {
        let options = AutoStartOptions {
            block,
            zero_and_calibrate: zero_calibrate,
            zeroing: ZeroingOptions {
                axes: zeroing_axes(axes_xyz),
                thresholds: thresholds(dbx, dby, dbz, dt),
            },
        };
        let result = self.inner.auto_start(options, &interruptible());
        let interrupted = matches!(result, Err(DriverError::Cancelled));
        if interrupted && self.inner.session().is_zeroing_active() {
            self.inner.field_zero(false, options.zeroing, &CancelToken::new())?;
        }
        Ok(result?)
    }

    /// Poll once after a non-blocking start. True once locked.
    fn poll_startup(&mut self) -> PyResult<bool> {
        Ok(self.inner.poll_startup()?)
    }

    /// Calibrate against the internal reference.
    ///
    /// Returns:
    ///     The calibration figure (lower is better, at most 15.9).
    fn calibrate(&mut self) -> PyResult<f64> {
        Ok(self.inner.calibrate()?.figure)
    }

    /// Start or stop field zeroing.
    ///
    /// With a threshold set the call blocks until convergence. Ctrl-C ends
    /// the wait and switches zeroing off.
    ///
    /// Returns:
    ///     "converged", "running" or "stopped".
    #[pyo3(signature = (on=true, axes_xyz=true, dbx=f64::INFINITY, dby=f64::INFINITY, dbz=f64::INFINITY, dt=f64::INFINITY))]
    fn field_zero(
        &mut self,
        on: bool,
        axes_xyz: bool,
        dbx: f64,
        dby: f64,
        dbz: f64,
        dt: f64,
    ) -> PyResult<&'static str> {
        let options = ZeroingOptions {
            axes: zeroing_axes(axes_xyz),
            thresholds: thresholds(dbx, dby, dbz, dt),
        };
        let outcome = match self.inner.field_zero(on, options, &interruptible())? {
            ZeroingOutcome::Cancelled => {
                self.inner.field_zero(false, options, &CancelToken::new())?
            }
            outcome => outcome,
        };
        Ok(match outcome {
            ZeroingOutcome::Converged { .. } => "converged",
            ZeroingOutcome::Running => "running",
            ZeroingOutcome::Stopped => "stopped",
            ZeroingOutcome::Cancelled => "cancelled",
        })
    }

    /// Set the internal coil fields to zero.
    fn field_reset(&mut self) -> PyResult<()> {
        Ok(self.inner.field_reset()?)
    }

    /// Set analog gain: 0.1x|0.33x|1x|3x.
    fn set_gain(&mut self, mode: &str) -> PyResult<()> {
        let mode: GainMode = mode.parse()?;
        Ok(self.inner.set_gain(mode)?)
    }

    /// Set the field-sensitive axis: z|y|dual.
    fn set_axis_mode(&mut self, mode: &str) -> PyResult<()> {
        let mode: AxisMode = mode.parse()?;
        Ok(self.inner.set_axis_mode(mode)?)
    }

    fn reboot(&mut self) -> PyResult<()> {
        Ok(self.inner.reboot()?)
    }

    fn disconnect(&mut self) {
        self.inner.disconnect();
    }

    fn reconnect(&mut self) -> PyResult<()> {
        Ok(self.inner.reconnect()?)
    }

    /// Read field data.
    ///
    /// Args:
    ///     seconds: Duration; floor(seconds * 200 Hz) samples are returned.
    ///     axis: x|y|z
    ///     clear_buffer: Drop buffered data first so time[0] is "now".
    #[pyo3(signature = (seconds=1.0, axis="z", clear_buffer=true))]
    fn read_data(
        &mut self,
        seconds: f64,
        axis: &str,
        clear_buffer: bool,
    ) -> PyResult<Vec<PyDataSample>> {
        let axis: ReadAxis = axis.parse()?;
        let duration = duration_from_secs(seconds)?;
        let mut request = AcquisitionRequest::duration(duration, axis);
        request.clear_buffer_first = clear_buffer;
        let samples = self.inner.read_data(request)?;
        Ok(samples.into_iter().map(PyDataSample::from).collect())
    }

    /// Poll the status until Ctrl-C, passing each status dict to `callback`.
    ///
    /// An exception raised by `callback` stops the loop and propagates.
    ///
    /// Returns:
    ///     Number of status updates read.
    #[pyo3(signature = (callback=None))]
    fn monitor_status<'py>(
        &mut self,
        py: Python<'py>,
        callback: Option<Bound<'py, PyAny>>,
    ) -> PyResult<usize> {
        let cancel = interruptible();
        let mut failure: Option<PyErr> = None;
        let result = self.inner.monitor_status(&cancel, |snapshot| {
            let Some(callback) = &callback else {
                return;
            };
            let delivered = snapshot
                .status
                .as_ref()
                .map(|status| status_dict(py, status))
                .transpose()
                .and_then(|dict| callback.call1((dict,)));
            if let Err(e) = delivered {
                failure = Some(e);
                cancel.cancel();
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(result?)
    }

    /// Stream field windows of `window_s` seconds to `callback` until Ctrl-C.
    ///
    /// `callback` receives a list of DataSample per window. An exception
    /// raised by it stops the stream and propagates.
    ///
    /// Returns:
    ///     Number of windows delivered.
    #[pyo3(signature = (callback, axis="z", window_s=5.0))]
    fn monitor_data(
        &mut self,
        callback: Bound<'_, PyAny>,
        axis: &str,
        window_s: f64,
    ) -> PyResult<usize> {
        let axis: ReadAxis = axis.parse()?;
        let window = duration_from_secs(window_s)?;
        let cancel = interruptible();
        let mut failure: Option<PyErr> = None;
        let result = self.inner.monitor_data(axis, window, &cancel, |batch| {
            let samples: Vec<PyDataSample> =
                batch.iter().cloned().map(PyDataSample::from).collect();
            if let Err(e) = callback.call1((samples,)) {
                failure = Some(e);
                cancel.cancel();
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(result?)
    }

    /// Read `npts` coil offset samples [x, y, z] (about 7.5 Hz).
    #[pyo3(signature = (npts, clear_buffer=true))]
    fn read_offsets(&mut self, npts: usize, clear_buffer: bool) -> PyResult<Vec<PyDataSample>> {
        let reading = self.inner.read_offsets(npts, clear_buffer)?;
        Ok(reading
            .samples
            .into_iter()
            .map(PyDataSample::from)
            .collect())
    }

    /// Read one status block and return it as a dict.
    #[pyo3(signature = (clear_buffer=true))]
    fn update_status<'py>(
        &mut self,
        py: Python<'py>,
        clear_buffer: bool,
    ) -> PyResult<Bound<'py, PyDict>> {
        let status = self.inner.update_status(clear_buffer)?;
        status_dict(py, &status)
    }

    /// Last known status as a dict, or None before the first read.
    #[getter]
    fn status<'py>(&self, py: Python<'py>) -> PyResult<Option<Bound<'py, PyDict>>> {
        self.inner
            .session()
            .status()
            .map(|s| status_dict(py, s))
            .transpose()
    }

    /// Device messages as (text, timestamp_us), oldest first.
    #[pyo3(signature = (last_n=None))]
    fn messages(&self, last_n: Option<usize>) -> Vec<(String, u64)> {
        let entries = match last_n {
            Some(n) => self.inner.last_messages(n),
            None => self.inner.messages(),
        };
        entries
            .iter()
            .map(|e| (e.text.clone(), e.timestamp_us))
            .collect()
    }

    #[getter]
    fn state(&self) -> String {
        self.inner.state().to_string()
    }

    /// Analog gain in V/nT.
    #[getter]
    fn gain(&self) -> f64 {
        self.inner.session().gain()
    }

    #[getter]
    fn axis_mode(&self) -> String {
        self.inner.session().axis_mode().to_string()
    }

    #[getter]
    fn is_calibrated(&self) -> bool {
        self.inner.session().is_calibrated()
    }

    #[getter]
    fn is_field_zeroed(&self) -> bool {
        self.inner.session().is_field_zeroed()
    }

    #[getter]
    fn is_data_streaming(&self) -> bool {
        self.inner.session().is_data_streaming()
    }

    fn __repr__(&self) -> String {
        format!(
            "Magnetometer(state={}, gain={} V/nT, axis_mode={})",
            self.inner.state(),
            self.inner.session().gain(),
            self.inner.session().axis_mode()
        )
    }
}

/// Forward Rust logs to Python's `logging`, optionally at `level`.
#[pyfunction]
#[pyo3(signature = (level=None))]
fn init_logging(level: Option<&str>) -> PyResult<()> {
    logging::init_python_logging();
    if let Some(level) = level {
        let level: LevelFilter = logging::parse_level(level)
            .ok_or_else(|| PyValueError::new_err(format!("unknown log level \"{level}\"")))?;
        logging::set_python_log_level(level);
    }
    Ok(())
}

/// The Python module definition
#[pymodule]
fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyMagnetometer>()?;
    m.add_class::<PyDataSample>()?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;

    m.add("FIELD_SAMPLE_RATE_HZ", FIELD_SAMPLE_RATE_HZ)?;
    m.add("OFFSET_SAMPLE_RATE_HZ", OFFSET_SAMPLE_RATE_HZ)?;
    m.add("GAIN_MODES", vec!["0.1x", "0.33x", "1x", "3x"])?;

    Ok(())
}
