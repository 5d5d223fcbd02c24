//! ESP connection
//!
//! Owns the serial port for the duration of an ESP session and provides
//! the command/response plumbing on top of SLIP framing: reset into the
//! ROM bootloader, the sync dance, register access and response decoding.

use std::thread::sleep;
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};
use crate::esp::command::{Command, CommandType};
use crate::logging::Logger;
use crate::port::{drain_input, Port};
use crate::slip::{self, SlipDecoder};

/// Reset variants alternate between these hold times; the longer one works
/// around the ESP32 rev 0 silicon that misses short IO0 pulses.
const RESET_HOLD: Duration = Duration::from_millis(100);
const RESET_HOLD_R0_EXTRA: Duration = Duration::from_millis(2000);
const RESET_SETTLE: Duration = Duration::from_millis(50);

const BANNER_WINDOW: Duration = Duration::from_millis(500);
const SYNC_PROBES: usize = 8;
const SYNC_PROBE_GAP: Duration = Duration::from_millis(50);
/// Reset/sync cycles before giving up; doubled by variant alternation.
pub(crate) const DEFAULT_CONNECT_ATTEMPTS: usize = 7;

/// How many stray frames we skim past while hunting a command's response.
const MAX_RESPONSE_FRAMES: usize = 100;

/// One decoded response packet.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub return_op: u8,
    pub value: u32,
    pub body: Vec<u8>,
}

pub struct EspConnection {
    port: Box<dyn Port>,
    decoder: SlipDecoder,
    log: Logger,
}

impl EspConnection {
    pub fn new(port: Box<dyn Port>, log: Logger) -> Self {
        EspConnection {
            port,
            decoder: SlipDecoder::new(),
            log,
        }
    }

    pub fn into_port(self) -> Box<dyn Port> {
        self.port
    }

    pub fn baud_rate(&self) -> u32 {
        self.port.baud_rate()
    }

    pub fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        self.port.set_baud_rate(baud)
    }

    pub(crate) fn port_mut(&mut self) -> &mut dyn Port {
        self.port.as_mut()
    }

    /// Reset into the ROM bootloader via the DTR/RTS auto-reset circuit.
    pub fn reset_to_bootloader(&mut self, extra_delay: bool) -> Result<()> {
        debug!("resetting into download mode (extra_delay: {extra_delay})");
        self.port.set_dtr(false)?;
        self.port.set_rts(false)?;
        sleep(RESET_SETTLE);

        self.port.set_dtr(true)?;
        self.port.set_rts(true)?;
        self.port.set_dtr(false)?; // IO0 high, EN low: chip held in reset
        self.port.set_rts(true)?;
        sleep(if extra_delay {
            RESET_HOLD + RESET_HOLD_R0_EXTRA
        } else {
            RESET_HOLD
        });

        self.port.set_dtr(true)?; // IO0 low, EN high: boot into download mode
        self.port.set_rts(false)?;
        sleep(RESET_SETTLE);

        self.port.set_dtr(false)?;
        self.port.set_rts(false)?;
        Ok(())
    }

    /// Reboot into the application. Leaves DTR and RTS both low.
    pub fn reboot(&mut self) -> Result<()> {
        self.port.set_dtr(false)?;
        self.port.set_rts(true)?;
        sleep(Duration::from_millis(100));
        self.port.set_dtr(false)?;
        self.port.set_rts(false)?;
        sleep(Duration::from_millis(100));
        Ok(())
    }

    /// Establish synchronization with the ROM bootloader.
    ///
    /// Alternates the normal and long-hold reset variants, drains the boot
    /// banner, then probes with SYNC packets until one is answered.
    pub fn connect(&mut self, attempts: usize) -> Result<()> {
        for attempt in 0..attempts * 2 {
            let extra_delay = attempt % 2 == 1;
            self.reset_to_bootloader(extra_delay)?;

            let banner = drain_input(self.port.as_mut(), BANNER_WINDOW)?;
            if !banner.is_empty() {
                debug!("boot banner: {:?}", String::from_utf8_lossy(&banner));
            }

            for probe in 0..SYNC_PROBES {
                match self.sync() {
                    Ok(()) => {
                        debug!("synced after attempt {attempt}, probe {probe}");
                        return Ok(());
                    }
                    Err(e) if e.is_retryable_sync() => sleep(SYNC_PROBE_GAP),
                    Err(e) => return Err(e),
                }
            }
            self.log.write_line("retrying to connect");
        }
        Err(Error::EspNoSync)
    }

    fn sync(&mut self) -> Result<()> {
        self.with_timeout(CommandType::Sync.timeout(), |conn| {
            conn.write_command(&Command::Sync)?;
            let response = conn.read_response()?;
            if response.return_op != CommandType::Sync as u8 {
                return Err(Error::mismatch(
                    "SYNC",
                    format!("unexpected opcode {:#04x}", response.return_op),
                ));
            }
            Ok(())
        })?;
        // The ROM answers a successful sync eight times over; the rest are
        // noise for the next command.
        self.port.clear_input()?;
        Ok(())
    }

    /// Send `command` and wait for its matching response.
    ///
    /// Returns the VALUE word plus the body with the trailing status bytes
    /// stripped. A failure status becomes [Error::RomStatus].
    pub fn command(&mut self, command: &Command<'_>) -> Result<(u32, Vec<u8>)> {
        let ty = command.command_type();
        self.write_command(command)?;

        for _ in 0..MAX_RESPONSE_FRAMES {
            let response = self.read_response()?;
            if response.return_op != ty as u8 {
                continue;
            }

            let mut body = response.body;
            // Status lives in the last two body bytes: a failure flag and
            // an error code. (The ROM pads with two more zero bytes, which
            // the length-based parse above already keeps out of the way.)
            if body.len() >= 2 {
                let code = body[body.len() - 1];
                let failed = body[body.len() - 2] != 0;
                if failed {
                    let _ = self.port.clear_input();
                    return Err(Error::RomStatus {
                        command: ty.name(),
                        code,
                    });
                }
                body.truncate(body.len() - 2);
            }
            return Ok((response.value, body));
        }
        Err(Error::mismatch(ty.name(), "no matching response"))
    }

    /// Run a command under an explicit response timeout, restoring the
    /// previous port timeout afterwards on every path.
    pub fn with_timeout<T, F>(&mut self, timeout: Duration, mut f: F) -> Result<T>
    where
        F: FnMut(&mut EspConnection) -> Result<T>,
    {
        let old_timeout = self.port.timeout();
        self.port.set_timeout(timeout)?;
        let result = f(self);
        self.port.set_timeout(old_timeout)?;
        result
    }

    pub fn read_reg(&mut self, address: u32) -> Result<u32> {
        self.with_timeout(CommandType::ReadReg.timeout(), |conn| {
            let (value, _) = conn.command(&Command::ReadReg { address })?;
            Ok(value)
        })
    }

    pub fn write_reg(&mut self, address: u32, value: u32, mask: Option<u32>) -> Result<()> {
        self.with_timeout(CommandType::WriteReg.timeout(), |conn| {
            conn.command(&Command::WriteReg {
                address,
                value,
                mask,
            })?;
            Ok(())
        })
    }

    /// Wait for one raw SLIP frame (the stub's "OHAI" greeting).
    pub fn read_raw_frame(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let old_timeout = self.port.timeout();
        self.port.set_timeout(timeout)?;
        let frame = self.decoder.read_frame(self.port.as_mut());
        self.port.set_timeout(old_timeout)?;
        frame
    }

    fn write_command(&mut self, command: &Command<'_>) -> Result<()> {
        debug!("sending {}", command.command_type().name());
        self.port.clear_input()?;
        let framed = slip::encode(&command.encode());
        self.port.write_all(&framed).map_err(Error::IoWrite)?;
        self.port.flush().map_err(Error::IoWrite)?;
        Ok(())
    }

    fn read_response(&mut self) -> Result<CommandResponse> {
        loop {
            let frame = self.decoder.read_frame(self.port.as_mut())?;
            // Direction byte 0x01 marks a response; anything else is debug
            // output from the target leaking between frames.
            if frame.len() < 8 || frame[0] != 0x01 {
                debug!("skipping non-response frame of {} bytes", frame.len());
                continue;
            }
            let value = u32::from_le_bytes(frame[4..8].try_into().unwrap());
            let declared = usize::from(u16::from_le_bytes(frame[2..4].try_into().unwrap()));
            let mut body = frame[8..].to_vec();
            // Trust the declared length when the frame carries trailing
            // padding, but never invent bytes that did not arrive.
            if declared < body.len() {
                body.truncate(declared);
            }
            return Ok(CommandResponse {
                return_op: frame[1],
                value,
                body,
            });
        }
    }
}

/// SLIP-framed response packet: `01 | op | len | value | body`.
#[cfg(test)]
pub(crate) fn response_frame(op: u8, value: u32, body: &[u8]) -> Vec<u8> {
    let mut packet = vec![0x01, op];
    packet.extend_from_slice(&(body.len() as u16).to_le_bytes());
    packet.extend_from_slice(&value.to_le_bytes());
    packet.extend_from_slice(body);
    slip::encode(&packet)
}

#[cfg(test)]
pub(crate) fn request_frame(command: &Command<'_>) -> Vec<u8> {
    slip::encode(&command.encode())
}
