//! Byte transport abstraction.
//!
//! The driver needs little from the link: write a command, read a bounded
//! chunk with a timeout, drop whatever is waiting in the input buffer, and
//! release or reacquire the underlying device. [`SerialTransport`] provides
//! these over a serial port and [`MockTransport`] replays scripted device
//! output for tests.

use std::thread;
use std::time::Duration;

use log::debug;

use crate::codec::Command;
use crate::errors::Result;

pub mod mock;
mod serial;

pub use mock::MockTransport;
pub use serial::SerialTransport;

/// Half-duplex byte channel to the device.
pub trait Transport: Send {
    /// Write the full command and flush it.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Read up to `max_bytes`, returning early when `timeout` expires.
    ///
    /// A short (or empty) result means the timeout fired; it is not an error.
    fn read(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>>;

    /// Discard everything currently waiting in the input buffer.
    fn clear_input_buffer(&mut self) -> Result<()>;

    /// Release the device. Later reads and writes fail until [`reopen`](Self::reopen).
    fn close(&mut self);

    /// Reacquire the device, replacing a dead or closed handle.
    fn reopen(&mut self) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).write(bytes)
    }

    fn read(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>> {
        (**self).read(max_bytes, timeout)
    }

    fn clear_input_buffer(&mut self) -> Result<()> {
        (**self).clear_input_buffer()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn reopen(&mut self) -> Result<()> {
        (**self).reopen()
    }
}

/// Encode and write one command, then give the device `delay` to act on it.
pub(crate) fn send_command(link: &mut dyn Transport, command: Command, delay: Duration) -> Result<()> {
    let bytes = command.encode()?;
    debug!("-> {} ({:?})", command, String::from_utf8_lossy(&bytes));
    link.write(&bytes)?;
    if !delay.is_zero() {
        thread::sleep(delay);
    }
    Ok(())
}
