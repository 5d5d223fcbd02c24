//! STK500 v1 engine
//!
//! The classical Atmel protocol spoken by optiboot-style bootloaders on
//! ATmega328P/168/8 boards. Commands are raw bytes terminated by
//! `CRC_EOP`; every reply is bracketed by `IN_SYNC` ... `OK`.

use std::thread::sleep;
use std::time::{Duration, Instant};

use log::debug;

use crate::cpu::{page_slices, CpuProfile};
use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use crate::logging::Logger;
use crate::port::{read_exact_timeout, Port};

const CRC_EOP: u8 = 0x20;

const GET_SYNC: u8 = 0x30;
const SET_DEVICE: u8 = 0x42;
const ENTER_PROGMODE: u8 = 0x50;
const LEAVE_PROGMODE: u8 = 0x51;
const LOAD_ADDRESS: u8 = 0x55;
const PROG_PAGE: u8 = 0x64;
const READ_PAGE: u8 = 0x74;
const READ_SIGN: u8 = 0x75;

const RESP_IN_SYNC: u8 = 0x14;
const RESP_OK: u8 = 0x10;

const MEMTYPE_FLASH: u8 = 0x46; // 'F'

const SYNC_ATTEMPTS: usize = 3;
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(400);
/// Pause between page writes; optiboot needs a breather while it commits.
const PAGE_PAUSE: Duration = Duration::from_millis(4);
const RESET_HOLD: Duration = Duration::from_millis(250);
const RESET_SETTLE: Duration = Duration::from_millis(50);
/// Junk tolerated while hunting for IN_SYNC before declaring the stream lost.
const MAX_SCAN_BYTES: usize = 1024;

pub struct Stk500v1 {
    port: Box<dyn Port>,
    profile: &'static CpuProfile,
    log: Logger,
    timeout: Duration,
    entered: bool,
}

impl Stk500v1 {
    pub fn new(port: Box<dyn Port>, profile: &'static CpuProfile, log: Logger) -> Self {
        Stk500v1 {
            port,
            profile,
            log,
            timeout: DEFAULT_TIMEOUT,
            entered: false,
        }
    }

    /// Transfer `image` into the target and verify it.
    ///
    /// On both success and failure the target is left outside programming
    /// mode if it was ever entered.
    pub fn bootload(&mut self, image: &FirmwareImage) -> Result<()> {
        if image.bytes.is_empty() {
            return Err(Error::MissingImage);
        }

        self.reset()?;
        // Belt and braces: three full sync rounds, each with its own retry
        // budget, before trusting the link.
        for _ in 0..SYNC_ATTEMPTS {
            self.sync()?;
        }

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
        self.set_device()?;
        self.enter_progmode()?;
        self.program(bytes)?;
        self.verify(bytes)?;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        debug!("pulsing DTR/RTS to reset target");
        self.port.set_dtr(false)?;
        self.port.set_rts(false)?;
        sleep(RESET_HOLD);
        self.port.set_dtr(true)?;
        self.port.set_rts(true)?;
        sleep(RESET_SETTLE);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        for attempt in 1..=SYNC_ATTEMPTS {
            match self.command("get sync", &[GET_SYNC, CRC_EOP], 2) {
                Ok(_) => return Ok(()),
                Err(e) if e.is_retryable_sync() && attempt < SYNC_ATTEMPTS => {
                    debug!("sync attempt {attempt} timed out, re-sending");
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("sync loop returns on the final attempt")
    }

    fn verify_signature(&mut self) -> Result<()> {
        let reply = self.command("read signature", &[READ_SIGN, CRC_EOP], 5)?;
        let found = &reply[1..4];
        if found != self.profile.signature {
            return Err(Error::SignatureMismatch {
                expected: self.profile.signature.to_vec(),
                found: found.to_vec(),
            });
        }
        self.log
            .write_line(&format!("found device, signature {found:02x?}"));
        Ok(())
    }

    fn set_device(&mut self) -> Result<()> {
        let page = self.profile.page_size as u16;
        // Only the page size matters to the bootloader; it ignores the
        // remaining device parameters.
        let mut request = vec![SET_DEVICE];
        request.extend_from_slice(&[0; 12]);
        request.push((page >> 8) as u8);
        request.push(page as u8);
        request.extend_from_slice(&[0; 6]);
        request.push(CRC_EOP);
        self.command("set device", &request, 2)?;
        Ok(())
    }

    fn enter_progmode(&mut self) -> Result<()> {
        self.command("enter progmode", &[ENTER_PROGMODE, CRC_EOP], 2)?;
        self.entered = true;
        Ok(())
    }

    fn leave_progmode(&mut self) -> Result<()> {
        self.command("leave progmode", &[LEAVE_PROGMODE, CRC_EOP], 2)?;
        Ok(())
    }

    fn load_address(&mut self, word_addr: u16) -> Result<()> {
        let request = [
            LOAD_ADDRESS,
            word_addr as u8,
            (word_addr >> 8) as u8,
            CRC_EOP,
        ];
        self.command("load address", &request, 2)?;
        Ok(())
    }

    fn program(&mut self, bytes: &[u8]) -> Result<()> {
        let pages = page_slices(bytes, self.profile.page_size);
        let total = pages.len();
        for (index, (addr, page)) in pages.into_iter().enumerate() {
            self.load_address((addr >> 1) as u16)?;

            let mut request = vec![
                PROG_PAGE,
                (page.len() >> 8) as u8,
                page.len() as u8,
                MEMTYPE_FLASH,
            ];
            request.extend_from_slice(page);
            request.push(CRC_EOP);
            self.command("program page", &request, 2)?;

            self.log
                .write_line(&format!("wrote page {}/{}", index + 1, total));
            sleep(PAGE_PAUSE);
        }
        Ok(())
    }

    fn verify(&mut self, bytes: &[u8]) -> Result<()> {
        for (addr, page) in page_slices(bytes, self.profile.page_size) {
            self.load_address((addr >> 1) as u16)?;

            let request = [
                READ_PAGE,
                (page.len() >> 8) as u8,
                page.len() as u8,
                MEMTYPE_FLASH,
                CRC_EOP,
            ];
            let reply = self.command("read page", &request, page.len() + 2)?;
            if &reply[1..reply.len() - 1] != page {
                return Err(Error::VerifyFailed {
                    address: addr as u32,
                });
            }
        }
        self.log.write_line("flash verified");
        Ok(())
    }

    /// Send a request and receive its canned reply.
    ///
    /// The receiver scans incoming bytes for the first `IN_SYNC`, then
    /// accumulates exactly `reply_len` bytes (sentinel included) which must
    /// end in `OK`.
    fn command(
        &mut self,
        context: &'static str,
        request: &[u8],
        reply_len: usize,
    ) -> Result<Vec<u8>> {
        self.port.write_all(request).map_err(Error::IoWrite)?;
        self.port.flush().map_err(Error::IoWrite)?;
        self.receive(context, reply_len)
    }

    fn receive(&mut self, context: &'static str, reply_len: usize) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;

        let mut scanned = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::ReceiveTimeout(context));
            }
            let mut byte = [0u8; 1];
            read_exact_timeout(self.port.as_mut(), &mut byte, remaining, context)?;
            if byte[0] == RESP_IN_SYNC {
                break;
            }
            scanned += 1;
            if scanned > MAX_SCAN_BYTES {
                return Err(Error::FramingOverflow(context));
            }
        }

        let mut reply = vec![0u8; reply_len];
        reply[0] = RESP_IN_SYNC;
        let remaining = deadline.saturating_duration_since(Instant::now());
        read_exact_timeout(self.port.as_mut(), &mut reply[1..], remaining, context)?;

        if reply[reply_len - 1] != RESP_OK {
            return Err(Error::mismatch(
                context,
                format!("reply did not end in OK: {reply:02x?}"),
            ));
        }
        Ok(reply)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::port::mock::MockPort;

    fn ok() -> Vec<u8> {
        vec![RESP_IN_SYNC, RESP_OK]
    }

    fn set_device_request(page: u16) -> Vec<u8> {
        let mut request = vec![SET_DEVICE];
        request.extend_from_slice(&[0; 12]);
        request.push((page >> 8) as u8);
        request.push(page as u8);
        request.extend_from_slice(&[0; 6]);
        request.push(CRC_EOP);
        request
    }

    /// Script a full, successful ATmega328P upload for `image`.
    pub(crate) fn script_upload(port: &mut MockPort, image: &[u8]) {
        for _ in 0..3 {
            port.expect(vec![GET_SYNC, CRC_EOP], ok());
        }
        port.expect(
            vec![READ_SIGN, CRC_EOP],
            vec![RESP_IN_SYNC, 0x1E, 0x95, 0x0F, RESP_OK],
        );
        port.expect(set_device_request(128), ok());
        port.expect(vec![ENTER_PROGMODE, CRC_EOP], ok());

        for (addr, page) in page_slices(image, 128) {
            let word = (addr >> 1) as u16;
            port.expect(
                vec![LOAD_ADDRESS, word as u8, (word >> 8) as u8, CRC_EOP],
                ok(),
            );
            let mut prog = vec![
                PROG_PAGE,
                (page.len() >> 8) as u8,
                page.len() as u8,
                MEMTYPE_FLASH,
            ];
            prog.extend_from_slice(page);
            prog.push(CRC_EOP);
            port.expect(prog, ok());
        }
        for (addr, page) in page_slices(image, 128) {
            let word = (addr >> 1) as u16;
            port.expect(
                vec![LOAD_ADDRESS, word as u8, (word >> 8) as u8, CRC_EOP],
                ok(),
            );
            let mut reply = vec![RESP_IN_SYNC];
            reply.extend_from_slice(page);
            reply.push(RESP_OK);
            port.expect(
                vec![
                    READ_PAGE,
                    (page.len() >> 8) as u8,
                    page.len() as u8,
                    MEMTYPE_FLASH,
                    CRC_EOP,
                ],
                reply,
            );
        }
        port.expect(vec![LEAVE_PROGMODE, CRC_EOP], ok());
    }

    #[test]
    fn uno_upload_walks_the_documented_wire_sequence() {
        let image: Vec<u8> = (0..1024u32).map(|i| (i * 7) as u8).collect();
        let mut port = MockPort::new();
        script_upload(&mut port, &image);
        let state = port.state_handle();

        let profile = CpuProfile::find("atmega328p").unwrap();
        let mut engine = Stk500v1::new(Box::new(port), profile, Logger::disabled());

        let started = Instant::now();
        engine
            .bootload(&FirmwareImage {
                bytes: image,
                entry: None,
                segments: Vec::new(),
            })
            .unwrap();
        // Eight pages with a 4 ms pause after each.
        assert!(started.elapsed() >= Duration::from_millis(32));

        let state = state.lock().unwrap();
        // Reset toggled both lines low then high before any bytes moved.
        assert_eq!(
            &state.signals[..4],
            &[('D', false), ('R', false), ('D', true), ('R', true)]
        );
        assert_eq!(&state.written[..2], &[GET_SYNC, CRC_EOP]);
    }

    #[test]
    fn sync_resends_after_silence() {
        let mut port = MockPort::new();
        port.expect(vec![GET_SYNC, CRC_EOP], vec![]); // swallowed
        port.expect(vec![GET_SYNC, CRC_EOP], ok());

        let profile = CpuProfile::find("atmega328p").unwrap();
        let mut engine = Stk500v1::new(Box::new(port), profile, Logger::disabled());
        engine.sync().unwrap();
    }

    #[test]
    fn wrong_signature_aborts_before_progmode() {
        let mut port = MockPort::new();
        for _ in 0..3 {
            port.expect(vec![GET_SYNC, CRC_EOP], ok());
        }
        port.expect(
            vec![READ_SIGN, CRC_EOP],
            vec![RESP_IN_SYNC, 0x1E, 0x94, 0x06, RESP_OK],
        );
        let state = port.state_handle();

        let profile = CpuProfile::find("atmega328p").unwrap();
        let mut engine = Stk500v1::new(Box::new(port), profile, Logger::disabled());
        let err = engine
            .bootload(&FirmwareImage {
                bytes: vec![0u8; 256],
                entry: None,
                segments: Vec::new(),
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SignatureMismatch);
        // Programming mode was never entered, so no LEAVE_PROGMODE went out.
        assert!(!state.lock().unwrap().written.contains(&LEAVE_PROGMODE));
    }

    #[test]
    fn receiver_skips_junk_before_in_sync() {
        let mut port = MockPort::new();
        port.push_rx(&[0x00, 0xFF]); // line noise ahead of the reply
        port.expect(vec![GET_SYNC, CRC_EOP], ok());

        let profile = CpuProfile::find("atmega328p").unwrap();
        let mut engine = Stk500v1::new(Box::new(port), profile, Logger::disabled());
        engine.sync().unwrap();
    }

    #[test]
    fn reply_without_ok_is_a_protocol_mismatch() {
        let mut port = MockPort::new();
        port.expect(vec![GET_SYNC, CRC_EOP], vec![RESP_IN_SYNC, 0x00]);

        let profile = CpuProfile::find("atmega328p").unwrap();
        let mut engine = Stk500v1::new(Box::new(port), profile, Logger::disabled());
        let err = engine.sync().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolMismatch);
    }

    #[test]
    fn verify_mismatch_still_leaves_progmode() {
        let image = vec![0x5Au8; 256];
        let mut port = MockPort::new();
        for _ in 0..3 {
            port.expect(vec![GET_SYNC, CRC_EOP], ok());
        }
        port.expect(
            vec![READ_SIGN, CRC_EOP],
            vec![RESP_IN_SYNC, 0x1E, 0x95, 0x0F, RESP_OK],
        );
        port.expect(set_device_request(128), ok());
        port.expect(vec![ENTER_PROGMODE, CRC_EOP], ok());
        for (addr, page) in page_slices(&image, 128) {
            let word = (addr >> 1) as u16;
            port.expect(
                vec![LOAD_ADDRESS, word as u8, (word >> 8) as u8, CRC_EOP],
                ok(),
            );
            let mut prog = vec![
                PROG_PAGE,
                (page.len() >> 8) as u8,
                page.len() as u8,
                MEMTYPE_FLASH,
            ];
            prog.extend_from_slice(page);
            prog.push(CRC_EOP);
            port.expect(prog, ok());
        }
        // First verify read returns corrupted flash.
        port.expect(vec![LOAD_ADDRESS, 0, 0, CRC_EOP], ok());
        let mut bad = vec![RESP_IN_SYNC];
        bad.extend_from_slice(&[0u8; 128]);
        bad.push(RESP_OK);
        port.expect(vec![READ_PAGE, 0, 128, MEMTYPE_FLASH, CRC_EOP], bad);
        port.expect(vec![LEAVE_PROGMODE, CRC_EOP], ok());
        let state = port.state_handle();

        let profile = CpuProfile::find("atmega328p").unwrap();
        let mut engine = Stk500v1::new(Box::new(port), profile, Logger::disabled());
        let err = engine
            .bootload(&FirmwareImage {
                bytes: image,
                entry: None,
                segments: Vec::new(),
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VerifyFailed);
        assert!(state.lock().unwrap().written.contains(&LEAVE_PROGMODE));
    }
}
