//! STK500 v2 engine
//!
//! Spoken by the Wiring-style bootloaders on ATmega1280/2560 boards.
//! Messages are length-prefixed, sequence-numbered and XOR-checksummed:
//!
//! ```text
//! MESSAGE_START | SEQ | LEN_MSB | LEN_LSB | TOKEN | BODY[LEN] | XOR
//! ```
//!
//! The XOR runs over every byte including the trailer, so a healthy frame
//! checksums to zero. Replies must echo the request's sequence number.

use std::thread::sleep;
use std::time::{Duration, Instant};

use log::debug;

use crate::cpu::{page_slices, CpuProfile};
use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use crate::logging::Logger;
use crate::port::{read_exact_timeout, Port};

const MESSAGE_START: u8 = 0x1B;
const TOKEN: u8 = 0x0E;

const CMD_SIGN_ON: u8 = 0x01;
const CMD_LOAD_ADDRESS: u8 = 0x06;
const CMD_ENTER_PROGMODE_ISP: u8 = 0x10;
const CMD_LEAVE_PROGMODE_ISP: u8 = 0x11;
const CMD_PROGRAM_FLASH_ISP: u8 = 0x13;
const CMD_READ_FLASH_ISP: u8 = 0x14;
const CMD_SPI_MULTI: u8 = 0x1D;

const STATUS_CMD_OK: u8 = 0x00;
const ANSWER_CKSUM_ERROR: u8 = 0xB0;

/// AVR ISP opcode for reading a signature byte, embedded in CMD_SPI_MULTI.
const ISP_READ_SIGNATURE: u8 = 0x30;

const SYNC_ATTEMPTS: usize = 5;
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(200);
const RESET_DELAY1: Duration = Duration::from_millis(10);
const RESET_DELAY2: Duration = Duration::from_millis(1);
const MAX_SCAN_BYTES: usize = 1024;
/// Largest legal body: CMD_PROGRAM_FLASH_ISP with a 256-byte page.
const MAX_BODY_LEN: usize = 0x200;

pub struct Stk500v2 {
    port: Box<dyn Port>,
    profile: &'static CpuProfile,
    log: Logger,
    timeout: Duration,
    sequence: u8,
    entered: bool,
}

impl Stk500v2 {
    pub fn new(port: Box<dyn Port>, profile: &'static CpuProfile, log: Logger) -> Self {
        Stk500v2 {
            port,
            profile,
            log,
            timeout: DEFAULT_TIMEOUT,
            sequence: 0,
            entered: false,
        }
    }

    pub fn bootload(&mut self, image: &FirmwareImage) -> Result<()> {
        if image.bytes.is_empty() {
            return Err(Error::MissingImage);
        }

        self.reset()?;
        self.sign_on()?;

        let outcome = self.transfer(&image.bytes);
        if self.entered {
            let left = self.leave_progmode();
            self.entered = false;
            return outcome.and(left);
        }
        outcome
    }

    pub fn into_port(self) -> Box<dyn Port> {
        self.port
    }

    fn transfer(&mut self, bytes: &[u8]) -> Result<()> {
        self.verify_signature()?;
        self.enter_progmode()?;
        self.program(bytes)?;
        self.verify(bytes)?;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        debug!("pulsing DTR/RTS to reset target");
        self.port.set_dtr(false)?;
        self.port.set_rts(false)?;
        sleep(RESET_DELAY1);
        self.port.set_dtr(true)?;
        self.port.set_rts(true)?;
        sleep(RESET_DELAY2);
        Ok(())
    }

    fn sign_on(&mut self) -> Result<()> {
        for attempt in 1..=SYNC_ATTEMPTS {
            match self.command("sign on", &[CMD_SIGN_ON]) {
                Ok(data) => {
                    // BODY: cmd, status, length, then the programmer name.
                    let name = data
                        .get(3..)
                        .map(|s| String::from_utf8_lossy(s).into_owned())
                        .unwrap_or_default();
                    debug!("programmer signed on as {name:?}");
                    self.log.write_line(&format!("programmer: {name}"));
                    return Ok(());
                }
                Err(e) if e.is_retryable_sync() && attempt < SYNC_ATTEMPTS => {
                    debug!("sign-on attempt {attempt} timed out, re-sending");
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("sign-on loop returns on the final attempt")
    }

    fn verify_signature(&mut self) -> Result<()> {
        let mut found = Vec::with_capacity(3);
        for offset in 0..3u8 {
            let body = [
                CMD_SPI_MULTI,
                4, // bytes to transmit
                4, // bytes to receive
                0, // receive start offset
                ISP_READ_SIGNATURE,
                0x00,
                offset,
                0x00,
            ];
            let data = self.command("spi multi", &body)?;
            // BODY: cmd, status, four SPI bytes, trailing status. The
            // signature comes back in the final SPI byte.
            if data.len() < 7 || data[6] != STATUS_CMD_OK {
                return Err(Error::mismatch(
                    "spi multi",
                    format!("short or unterminated reply: {data:02x?}"),
                ));
            }
            found.push(data[5]);
        }

        if found != self.profile.signature {
            return Err(Error::SignatureMismatch {
                expected: self.profile.signature.to_vec(),
                found,
            });
        }
        self.log
            .write_line(&format!("found device, signature {:02x?}", self.profile.signature));
        Ok(())
    }

    fn enter_progmode(&mut self) -> Result<()> {
        let t = self.profile.timing;
        let body = [
            CMD_ENTER_PROGMODE_ISP,
            t.timeout,
            t.stab_delay,
            t.cmd_exe_delay,
            t.synch_loops,
            t.byte_delay,
            t.poll_value,
            t.poll_index,
            0xAC,
            0x53,
            0x00,
            0x00,
        ];
        self.command("enter progmode", &body)?;
        self.entered = true;
        Ok(())
    }

    fn leave_progmode(&mut self) -> Result<()> {
        self.command("leave progmode", &[CMD_LEAVE_PROGMODE_ISP, 0x01, 0x01])?;
        Ok(())
    }

    fn load_address(&mut self, word_addr: u32) -> Result<()> {
        let addr = word_addr | 0x8000_0000;
        let body = [
            CMD_LOAD_ADDRESS,
            (addr >> 24) as u8,
            (addr >> 16) as u8,
            (addr >> 8) as u8,
            addr as u8,
        ];
        self.command("load address", &body)?;
        Ok(())
    }

    fn program(&mut self, bytes: &[u8]) -> Result<()> {
        let pages = page_slices(bytes, self.profile.page_size);
        let total = pages.len();
        for (index, (addr, page)) in pages.into_iter().enumerate() {
            self.load_address((addr >> 1) as u32)?;

            let mut body = vec![
                CMD_PROGRAM_FLASH_ISP,
                (page.len() >> 8) as u8,
                page.len() as u8,
                0xC1, // paged write with polling
                0x0A,
                0x40, // Load Page Low
                0x4C, // Write Page
                0x20, // Read Low
                0x00,
                0x00,
            ];
            body.extend_from_slice(page);
            self.command("program flash", &body)?;

            self.log
                .write_line(&format!("wrote page {}/{}", index + 1, total));
        }
        Ok(())
    }

    fn verify(&mut self, bytes: &[u8]) -> Result<()> {
        for (addr, page) in page_slices(bytes, self.profile.page_size) {
            self.load_address((addr >> 1) as u32)?;

            let body = [
                CMD_READ_FLASH_ISP,
                (page.len() >> 8) as u8,
                page.len() as u8,
                0x20,
            ];
            let data = self.command("read flash", &body)?;
            if data.len() != page.len() + 3 || data[data.len() - 1] != STATUS_CMD_OK {
                return Err(Error::mismatch(
                    "read flash",
                    format!("expected {} data bytes, got reply of {}", page.len(), data.len()),
                ));
            }
            if &data[2..2 + page.len()] != page {
                return Err(Error::VerifyFailed {
                    address: addr as u32,
                });
            }
        }
        self.log.write_line("flash verified");
        Ok(())
    }

    /// One framed request/response exchange.
    ///
    /// Checks the sequence echo, the command echo and the status byte, and
    /// advances the sequence counter only after a complete exchange.
    fn command(&mut self, context: &'static str, body: &[u8]) -> Result<Vec<u8>> {
        let frame = build_frame(self.sequence, body);
        self.port.write_all(&frame).map_err(Error::IoWrite)?;
        self.port.flush().map_err(Error::IoWrite)?;

        let (seq, data) = self.receive(context)?;
        if seq != self.sequence {
            return Err(Error::mismatch(
                context,
                format!("sequence echo {seq} != {}", self.sequence),
            ));
        }
        self.sequence = self.sequence.wrapping_add(1);

        match data.first() {
            Some(&ANSWER_CKSUM_ERROR) => return Err(Error::PeerChecksumError),
            Some(&cmd) if cmd == body[0] => {}
            other => {
                return Err(Error::mismatch(
                    context,
                    format!("command echo {other:?} != {:#04x}", body[0]),
                ))
            }
        }
        match data.get(1) {
            Some(&STATUS_CMD_OK) => Ok(data),
            Some(&status) => Err(Error::mismatch(
                context,
                format!("status {status:#04x}"),
            )),
            None => Err(Error::mismatch(context, "empty body")),
        }
    }

    /// Receiver state machine: START → SEQNUM → SIZE1 → SIZE2 → TOKEN →
    /// DATA → CSUM. Returns the peer's sequence number and message body.
    fn receive(&mut self, context: &'static str) -> Result<(u8, Vec<u8>)> {
        let deadline = Instant::now() + self.timeout;

        let mut scanned = 0;
        loop {
            let byte = self.read_byte(deadline, context)?;
            if byte == MESSAGE_START {
                break;
            }
            scanned += 1;
            if scanned > MAX_SCAN_BYTES {
                return Err(Error::FramingOverflow(context));
            }
        }

        let mut header = [0u8; 4];
        let remaining = deadline.saturating_duration_since(Instant::now());
        read_exact_timeout(self.port.as_mut(), &mut header, remaining, context)?;
        let [seq, size1, size2, token] = header;
        if token != TOKEN {
            return Err(Error::mismatch(
                context,
                format!("bad token {token:#04x}"),
            ));
        }

        let len = usize::from(size1) << 8 | usize::from(size2);
        if len > MAX_BODY_LEN {
            return Err(Error::FramingOverflow(context));
        }

        let mut rest = vec![0u8; len + 1]; // body + checksum
        let remaining = deadline.saturating_duration_since(Instant::now());
        read_exact_timeout(self.port.as_mut(), &mut rest, remaining, context)?;

        let mut xor = MESSAGE_START ^ seq ^ size1 ^ size2 ^ token;
        for &b in &rest {
            xor ^= b;
        }
        if xor != 0 {
            return Err(Error::mismatch(context, "frame checksum is non-zero"));
        }

        rest.pop(); // drop the checksum byte
        Ok((seq, rest))
    }

    fn read_byte(&mut self, deadline: Instant, context: &'static str) -> Result<u8> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::ReceiveTimeout(context));
        }
        let mut byte = [0u8; 1];
        read_exact_timeout(self.port.as_mut(), &mut byte, remaining, context)?;
        Ok(byte[0])
    }
}

/// Assemble one outbound frame around `body`.
pub(crate) fn build_frame(sequence: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + 6);
    frame.push(MESSAGE_START);
    frame.push(sequence);
    frame.push((body.len() >> 8) as u8);
    frame.push(body.len() as u8);
    frame.push(TOKEN);
    frame.extend_from_slice(body);

    let xor = frame.iter().fold(0u8, |acc, &b| acc ^ b);
    frame.push(xor);
    frame
}
