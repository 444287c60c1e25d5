use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, info};
use serialport::{ClearBuffer, FlowControl, SerialPort};

use super::Transport;
use crate::config::SerialSettings;
use crate::errors::{DriverError, Result};

const READ_SCRATCH: usize = 256;

/// [`Transport`] over a local serial port (e.g. `/dev/ttyUSB0` or `COM3`).
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    /// Known only for ports opened by path; wrapped ports cannot be reopened.
    path: Option<String>,
    settings: SerialSettings,
}

impl SerialTransport {
    /// Open the port at `path` with the given link parameters.
    pub fn open(path: &str, settings: &SerialSettings) -> Result<Self> {
        let port = open_port(path, settings)?;
        Ok(Self {
            port: Some(port),
            path: Some(path.to_string()),
            settings: settings.clone(),
        })
    }

    /// Wrap an already opened port.
    pub fn from_port(port: Box<dyn SerialPort>, settings: &SerialSettings) -> Self {
        Self {
            port: Some(port),
            path: None,
            settings: settings.clone(),
        }
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| DriverError::Connection("serial port is closed".into()))
    }
}

fn open_port(path: &str, settings: &SerialSettings) -> Result<Box<dyn SerialPort>> {
    let port = serialport::new(path, settings.baud_rate)
        .data_bits(settings.serialport_data_bits())
        .parity(settings.parity.into())
        .stop_bits(settings.stop_bits.into())
        .flow_control(FlowControl::None)
        .timeout(settings.read_timeout)
        .open()
        .map_err(|e| {
            DriverError::Connection(format!("failed to open serial port at {path}: {e}"))
        })?;

    info!(
        "serial port opened: path={}, baud={}",
        path, settings.baud_rate
    );
    Ok(port)
}

fn link_error(e: io::Error) -> DriverError {
    match e.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::UnexpectedEof => DriverError::Connection(e.to_string()),
        _ => DriverError::Io(e),
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let write_timeout = self.settings.write_timeout;
        let port = self.port()?;
        port.set_timeout(write_timeout)?;
        port.write_all(bytes).map_err(link_error)?;
        port.flush().map_err(link_error)?;
        debug!("wrote {:02X?}", bytes);
        Ok(())
    }

    fn read(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>> {
        let port = self.port()?;
        let deadline = Instant::now() + timeout;
        let mut out = Vec::with_capacity(max_bytes.min(READ_SCRATCH));
        let mut buf = [0u8; READ_SCRATCH];

        while out.len() < max_bytes {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            port.set_timeout(remaining)?;

            let want = (max_bytes - out.len()).min(buf.len());
            match port.read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(link_error(e)),
            }
        }

        Ok(out)
    }

    fn clear_input_buffer(&mut self) -> Result<()> {
        self.port()?.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!("serial port closed: path={}", self.path.as_deref().unwrap_or("<wrapped>"));
        }
    }

    fn reopen(&mut self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Err(DriverError::Connection(
                "wrapped serial port cannot be reopened".into(),
            ));
        };
        // Release the stale handle first; some platforms refuse a second open.
        self.port = None;
        self.port = Some(open_port(path, &self.settings)?);
        Ok(())
    }
}
