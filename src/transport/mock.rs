//! Scripted transport for tests and dry runs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::Transport;
use crate::errors::{DriverError, Result};

#[derive(Debug, Default)]
struct MockState {
    reads: VecDeque<Vec<u8>>,
    writes: Vec<Vec<u8>>,
    read_calls: usize,
    clears: usize,
    reopens: usize,
    disconnected: bool,
    closed: bool,
}

impl MockState {
    fn check_link(&self) -> Result<()> {
        if self.disconnected {
            Err(DriverError::Connection("mock device disconnected".into()))
        } else if self.closed {
            Err(DriverError::Connection("mock port closed".into()))
        } else {
            Ok(())
        }
    }
}

/// Replays queued device output and records every command written.
///
/// Clones share state, so a test can keep one handle while the driver owns
/// another. Clearing the input buffer does not drop queued chunks: the queue
/// models bytes that arrive *after* the clear.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicked test thread must not hide the recorded traffic.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a chunk returned by a future `read`.
    pub fn queue_read(&self, bytes: impl Into<Vec<u8>>) {
        self.lock().reads.push_back(bytes.into());
    }

    /// Queue a read that times out with no data.
    pub fn queue_silence(&self) {
        self.queue_read(Vec::new());
    }

    /// All writes so far, one entry per `write` call.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    /// All written bytes concatenated.
    pub fn written_bytes(&self) -> Vec<u8> {
        self.lock().writes.concat()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    pub fn read_calls(&self) -> usize {
        self.lock().read_calls
    }

    pub fn clear_calls(&self) -> usize {
        self.lock().clears
    }

    /// Chunks still waiting to be read.
    pub fn pending_reads(&self) -> usize {
        self.lock().reads.len()
    }

    /// Simulate the device dropping off the bus.
    pub fn disconnect(&self) {
        self.lock().disconnected = true;
    }

    pub fn reconnect(&self) {
        self.lock().disconnected = false;
    }

    /// False after `close` until a successful `reopen`.
    pub fn is_open(&self) -> bool {
        !self.lock().closed
    }

    pub fn reopen_calls(&self) -> usize {
        self.lock().reopens
    }
}

impl Transport for MockTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut state = self.lock();
        state.check_link()?;
        state.writes.push(bytes.to_vec());
        Ok(())
    }

    fn read(&mut self, max_bytes: usize, _timeout: Duration) -> Result<Vec<u8>> {
        let mut state = self.lock();
        state.check_link()?;
        state.read_calls += 1;
        let Some(mut chunk) = state.reads.pop_front() else {
            return Ok(Vec::new());
        };
        if chunk.len() > max_bytes {
            let rest = chunk.split_off(max_bytes);
            state.reads.push_front(rest);
        }
        Ok(chunk)
    }

    fn clear_input_buffer(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.check_link()?;
        state.clears += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.lock().closed = true;
    }

    fn reopen(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.reopens += 1;
        if state.disconnected {
            return Err(DriverError::Connection("mock device not present".into()));
        }
        state.closed = false;
        Ok(())
    }
}

/// Build a status block of exactly `size` bytes.
///
/// The block starts with a partial line (as a real read that begins
/// mid-stream does), then carries `lines` CRLF-terminated, padded with NULs.
/// Panics if the lines do not fit.
pub fn status_block(lines: &[&str], size: usize) -> Vec<u8> {
    let mut block = b"0\r\n".to_vec();
    for line in lines {
        block.extend_from_slice(line.as_bytes());
        block.extend_from_slice(b"\r\n");
    }
    assert!(
        block.len() <= size,
        "status lines need {} bytes, block is {size}",
        block.len()
    );
    block.resize(size, 0);
    block
}

/// Encode a field-stream line for a value in pT.
pub fn field_line(picotesla: f64) -> String {
    format!("!{:07}\r\n", (picotesla / 0.01).round() as i64 + 8_388_608)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_replay_in_order_and_split_on_max() {
        let mock = MockTransport::new();
        let mut link = mock.clone();
        mock.queue_read(b"abcdef".to_vec());
        mock.queue_read(b"gh".to_vec());

        assert_eq!(link.read(4, Duration::ZERO).unwrap(), b"abcd");
        assert_eq!(link.read(4, Duration::ZERO).unwrap(), b"ef");
        assert_eq!(link.read(4, Duration::ZERO).unwrap(), b"gh");
        assert!(link.read(4, Duration::ZERO).unwrap().is_empty());
        assert_eq!(mock.read_calls(), 4);
    }

    #[test]
    fn records_writes_and_disconnects() {
        let mock = MockTransport::new();
        let mut link = mock.clone();
        link.write(b">").unwrap();
        link.write(b"7").unwrap();
        assert_eq!(mock.written_bytes(), b">7");

        mock.disconnect();
        assert!(matches!(link.write(b"8"), Err(DriverError::Connection(_))));
    }

    #[test]
    fn closed_port_refuses_traffic_until_reopened() {
        let mock = MockTransport::new();
        let mut link = mock.clone();
        link.close();
        assert!(!mock.is_open());
        assert!(matches!(link.read(4, Duration::ZERO), Err(DriverError::Connection(_))));
        assert!(matches!(link.clear_input_buffer(), Err(DriverError::Connection(_))));

        mock.disconnect();
        assert!(link.reopen().is_err());
        mock.reconnect();
        link.reopen().unwrap();
        assert!(mock.is_open());
        assert_eq!(mock.reopen_calls(), 2);
        link.write(b"7").unwrap();
    }

    #[test]
    fn status_block_has_exact_size() {
        let block = status_block(&["|11", "~0432768"], 64);
        assert_eq!(block.len(), 64);
        assert!(block.starts_with(b"0\r\n|11\r\n"));
    }

    #[test]
    fn field_line_encodes_offset() {
        assert_eq!(field_line(0.0), "!8388608\r\n");
        assert_eq!(field_line(1.5), "!8388758\r\n");
    }
}
