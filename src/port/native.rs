//! Native serial port adapter
//!
//! Bridges the `serialport` crate to the [Port] capability. The adapter
//! remembers its own settings so the port can be closed and re-opened
//! mid-session, which the AVR109 engine relies on after the 1200-baud
//! touch re-enumerates the device.

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, FlowControl, SerialPort as _};

use crate::error::{Error, Result};
use crate::port::Port;

pub struct NativePort {
    name: String,
    baud: u32,
    timeout: Duration,
    inner: Option<Box<dyn serialport::SerialPort>>,
}

impl NativePort {
    /// Open `path` at `baud` with no flow control, the standard bootloader
    /// configuration.
    pub fn open_path(path: &str, baud: u32) -> Result<Self> {
        let mut port = NativePort {
            name: path.to_string(),
            baud,
            timeout: Duration::from_secs(1),
            inner: None,
        };
        port.open()?;
        Ok(port)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn inner_mut(&mut self) -> io::Result<&mut Box<dyn serialport::SerialPort>> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port is closed"))
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner_mut()?.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner_mut()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner_mut()?.flush()
    }
}

impl Port for NativePort {
    fn open(&mut self) -> Result<()> {
        if self.inner.is_some() {
            return Ok(());
        }
        let port = serialport::new(&self.name, self.baud)
            .flow_control(FlowControl::None)
            .timeout(self.timeout)
            .open()
            .map_err(Error::from)?;
        self.inner = Some(port);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.inner = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        if let Some(inner) = self.inner.as_mut() {
            inner.set_baud_rate(baud)?;
        }
        self.baud = baud;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Some(inner) = self.inner.as_mut() {
            inner.set_timeout(timeout)?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.inner_mut()
            .map_err(Error::IoWrite)?
            .write_data_terminal_ready(level)
            .map_err(Error::from)
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.inner_mut()
            .map_err(Error::IoWrite)?
            .write_request_to_send(level)
            .map_err(Error::from)
    }

    fn set_break(&mut self, on: bool) -> Result<()> {
        let inner = self.inner_mut().map_err(Error::IoWrite)?;
        if on {
            inner.set_break().map_err(Error::from)
        } else {
            inner.clear_break().map_err(Error::from)
        }
    }

    fn read_cts(&mut self) -> Result<bool> {
        Ok(self.inner_mut().map_err(Error::IoRead)?.read_clear_to_send()?)
    }

    fn read_dsr(&mut self) -> Result<bool> {
        Ok(self.inner_mut().map_err(Error::IoRead)?.read_data_set_ready()?)
    }

    fn read_dcd(&mut self) -> Result<bool> {
        Ok(self.inner_mut().map_err(Error::IoRead)?.read_carrier_detect()?)
    }

    fn clear_input(&mut self) -> Result<()> {
        self.inner_mut()
            .map_err(Error::IoRead)?
            .clear(ClearBuffer::Input)
            .map_err(Error::from)
    }

    fn drain(&mut self) -> Result<()> {
        self.inner_mut().map_err(Error::IoWrite)?.flush().map_err(Error::IoWrite)
    }
}
