//! Scripted serial port for engine tests
//!
//! A `MockPort` pairs expected writes with canned replies. Engines under
//! test drive it exactly like hardware: each write is matched against the
//! front of the script, queueing that exchange's reply for subsequent
//! reads. An unexpected write fails the test immediately with a hex dump.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Result;
use crate::port::Port;

/// Shared observation log, kept behind an `Arc` so tests can inspect it
/// after the port has been moved into an engine.
#[derive(Debug, Default)]
pub(crate) struct PortState {
    pub written: Vec<u8>,
    /// `('D', level)` for DTR, `('R', level)` for RTS.
    pub signals: Vec<(char, bool)>,
    pub baud_history: Vec<u32>,
    pub opens: u32,
    pub closes: u32,
}

pub(crate) struct MockPort {
    pub baud: u32,
    open: bool,
    timeout: Duration,
    script: VecDeque<(Vec<u8>, Vec<u8>)>,
    pending: Vec<u8>,
    rx: VecDeque<u8>,
    pub state: Arc<Mutex<PortState>>,
}

impl MockPort {
    pub fn new() -> Self {
        MockPort {
            baud: 115_200,
            open: true,
            timeout: Duration::from_millis(100),
            script: VecDeque::new(),
            pending: Vec::new(),
            rx: VecDeque::new(),
            state: Arc::new(Mutex::new(PortState::default())),
        }
    }

    /// Script one request/reply exchange.
    pub fn expect(&mut self, request: impl Into<Vec<u8>>, reply: impl Into<Vec<u8>>) {
        self.script.push_back((request.into(), reply.into()));
    }

    /// Queue unsolicited bytes (boot banners, stub handshakes).
    pub fn push_rx(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    pub fn state_handle(&self) -> Arc<Mutex<PortState>> {
        Arc::clone(&self.state)
    }

    pub fn script_exhausted(&self) -> bool {
        self.script.is_empty() && self.pending.is_empty()
    }

    fn match_script(&mut self) {
        while let Some((expected, _)) = self.script.front() {
            if self.pending.len() >= expected.len() {
                let (head, rest) = self.pending.split_at(expected.len());
                assert_eq!(
                    head,
                    expected.as_slice(),
                    "unexpected write\n  expected: {expected:02x?}\n  got:      {head:02x?}"
                );
                self.pending = rest.to_vec();
                let (_, reply) = self.script.pop_front().unwrap();
                self.rx.extend(reply);
            } else {
                assert!(
                    expected.starts_with(&self.pending),
                    "unexpected write prefix\n  expected: {:02x?}\n  got:      {:02x?}",
                    expected,
                    self.pending
                );
                break;
            }
        }
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "mock port silent"));
        }
        let n = buf.len().min(self.rx.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.rx.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state.lock().unwrap().written.extend_from_slice(buf);
        self.pending.extend_from_slice(buf);
        self.match_script();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        self.state.lock().unwrap().opens += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        self.state.lock().unwrap().closes += 1;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        self.baud = baud;
        self.state.lock().unwrap().baud_history.push(baud);
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.state.lock().unwrap().signals.push(('D', level));
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.state.lock().unwrap().signals.push(('R', level));
        Ok(())
    }

    fn read_cts(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn read_dsr(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn clear_input(&mut self) -> Result<()> {
        self.rx.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_replies_after_matching_write() {
        let mut port = MockPort::new();
        port.expect(vec![0x30, 0x20], vec![0x14, 0x10]);

        port.write_all(&[0x30, 0x20]).unwrap();
        let mut buf = [0u8; 2];
        port.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0x14, 0x10]);
        assert!(port.script_exhausted());
    }

    #[test]
    fn split_writes_accumulate_until_matched() {
        let mut port = MockPort::new();
        port.expect(vec![0x41, 0x00, 0x10], vec![0x0D]);

        port.write_all(&[0x41]).unwrap();
        port.write_all(&[0x00, 0x10]).unwrap();
        let mut buf = [0u8; 1];
        port.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0x0D]);
    }

    #[test]
    #[should_panic(expected = "unexpected write")]
    fn mismatched_write_panics() {
        let mut port = MockPort::new();
        port.expect(vec![0x30, 0x20], vec![0x14, 0x10]);
        port.write_all(&[0x31, 0x20]).unwrap();
    }

    #[test]
    fn silent_port_times_out() {
        let mut port = MockPort::new();
        let err = port.read(&mut [0u8; 1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
