//! Serial port capability
//!
//! The engines own no serial implementation; they drive any byte-duplex
//! device that implements [Port]. A native adapter over the `serialport`
//! crate is provided behind the `serialport` feature; browser or test
//! environments supply their own.

use std::io::{self, Read, Write};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

#[cfg(test)]
pub(crate) mod mock;
#[cfg(feature = "serialport")]
pub mod native;

/// A byte-duplex serial device.
///
/// Reads honor the configured timeout: a read that produces no data within
/// it returns `Ok(0)` or an `io::ErrorKind::TimedOut` error, whichever is
/// natural for the implementation; the engines treat both as a timeout.
/// Implementations may re-open an already-open port as a no-op and may make
/// `flush` a no-op.
pub trait Port: Read + Write + Send {
    /// Open the device. Opening an open port succeeds silently.
    fn open(&mut self) -> Result<()>;

    /// Close the device and release the OS handle.
    fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    fn baud_rate(&self) -> u32;

    fn set_baud_rate(&mut self, baud: u32) -> Result<()>;

    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    fn timeout(&self) -> Duration;

    /// Set the DTR modem line.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Set the RTS modem line.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Set both modem lines, DTR first.
    fn set_signals(&mut self, dtr: bool, rts: bool) -> Result<()> {
        self.set_dtr(dtr)?;
        self.set_rts(rts)
    }

    /// Assert or release a break condition. Optional; defaults to a no-op.
    fn set_break(&mut self, _on: bool) -> Result<()> {
        Ok(())
    }

    fn read_cts(&mut self) -> Result<bool>;

    fn read_dsr(&mut self) -> Result<bool>;

    fn read_dcd(&mut self) -> Result<bool> {
        Ok(false)
    }

    /// Discard any bytes already received but not yet read.
    fn clear_input(&mut self) -> Result<()>;

    /// Block until all written bytes have left the host. Optional.
    fn drain(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Fill `buf` from the port or fail with [Error::ReceiveTimeout].
///
/// `timeout` bounds the whole read, not each syscall; a trickling port gets
/// the full window, a silent one gives up at the first expiry.
pub(crate) fn read_exact_timeout(
    port: &mut dyn Port,
    buf: &mut [u8],
    timeout: Duration,
    context: &'static str,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut filled = 0;

    while filled < buf.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::ReceiveTimeout(context));
        }
        port.set_timeout(remaining)?;

        match port.read(&mut buf[filled..]) {
            Ok(0) => return Err(Error::ReceiveTimeout(context)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(Error::ReceiveTimeout(context))
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::IoRead(e)),
        }
    }

    Ok(())
}

/// Read and discard everything until the port is silent for `window`.
///
/// Returns the discarded bytes so callers can log boot banners.
pub(crate) fn drain_input(port: &mut dyn Port, window: Duration) -> Result<Vec<u8>> {
    let mut drained = Vec::new();
    let mut chunk = [0u8; 256];

    port.set_timeout(window)?;
    loop {
        match port.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => drained.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::IoRead(e)),
        }
    }

    Ok(drained)
}

/// Parameters handed to the reconnect callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectParams {
    pub baud_rate: u32,
}

/// Caller-supplied hook that produces a fresh port after the target
/// re-enumerates (AVR109 1200-baud touch).
pub type ReconnectCallback =
    Arc<dyn Fn(ReconnectParams) -> Result<Box<dyn Port>> + Send + Sync>;

/// Run the reconnect callback, bounded by `timeout`.
///
/// The callback may legitimately take tens of seconds (a human picking a
/// port in a browser dialog), so it runs on its own thread and we wait on
/// a channel. Expiry is [Error::ReconnectTimeout]; a callback error is
/// reported as [Error::ReconnectRejected].
pub(crate) fn reconnect_within(
    callback: &ReconnectCallback,
    params: ReconnectParams,
    timeout: Duration,
) -> Result<Box<dyn Port>> {
    let (tx, rx) = mpsc::channel();
    let callback = Arc::clone(callback);

    thread::spawn(move || {
        // The receiver may be gone if we already timed out.
        let _ = tx.send(callback(params));
    });

    match rx.recv_timeout(timeout) {
        Ok(Ok(port)) => Ok(port),
        Ok(Err(e)) => Err(Error::ReconnectRejected(e.to_string())),
        Err(_) => Err(Error::ReconnectTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockPort;
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn read_exact_timeout_fills_from_buffered_data() {
        let mut port = MockPort::new();
        port.push_rx(&[0x14, 0x10, 0xAA]);

        let mut buf = [0u8; 3];
        read_exact_timeout(&mut port, &mut buf, Duration::from_millis(50), "test").unwrap();
        assert_eq!(buf, [0x14, 0x10, 0xAA]);
    }

    #[test]
    fn read_exact_timeout_reports_silence() {
        let mut port = MockPort::new();
        let mut buf = [0u8; 2];
        let err =
            read_exact_timeout(&mut port, &mut buf, Duration::from_millis(10), "probe").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReceiveTimeout);
    }

    #[test]
    fn drain_input_swallows_banner_then_stops() {
        let mut port = MockPort::new();
        port.push_rx(b"ets Jan  8 2013,rst cause:2\r\n");
        let banner = drain_input(&mut port, Duration::from_millis(10)).unwrap();
        assert!(banner.starts_with(b"ets"));
        assert!(drain_input(&mut port, Duration::from_millis(10))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn reconnect_within_times_out() {
        let callback: ReconnectCallback = Arc::new(|_| {
            thread::sleep(Duration::from_millis(200));
            Ok(Box::new(MockPort::new()) as Box<dyn Port>)
        });
        let err = match reconnect_within(
            &callback,
            ReconnectParams { baud_rate: 57_600 },
            Duration::from_millis(20),
        ) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.kind(), ErrorKind::ReconnectTimeout);
    }

    #[test]
    fn reconnect_within_propagates_rejection() {
        let callback: ReconnectCallback =
            Arc::new(|_| Err(Error::IoOpen(io::Error::other("user dismissed prompt"))));
        let err = match reconnect_within(
            &callback,
            ReconnectParams { baud_rate: 57_600 },
            Duration::from_millis(100),
        ) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.kind(), ErrorKind::ReconnectRejected);
    }

    #[test]
    fn reconnect_within_hands_back_the_new_port() {
        let callback: ReconnectCallback = Arc::new(|params| {
            let mut port = MockPort::new();
            port.baud = params.baud_rate;
            Ok(Box::new(port) as Box<dyn Port>)
        });
        let port = reconnect_within(
            &callback,
            ReconnectParams { baud_rate: 57_600 },
            Duration::from_millis(100),
        )
        .unwrap();
        assert_eq!(port.baud_rate(), 57_600);
    }
}
