//! AVR109 (butterfly) engine
//!
//! Speaks to LUFA-style USB-CDC bootloaders (Caterina on the ATmega32U4).
//! Commands are single ASCII characters; replies are either `\r` for
//! success-without-data, `?` for not-supported, or a fixed-length payload.
//! There is no start sentinel, so exact response-length discipline is
//! mandatory.
//!
//! The engine is entered through the 1200-baud touch: opening the CDC port
//! at 1200 baud and closing it asks the MCU to reboot into its bootloader,
//! after which the host OS re-enumerates the device. The port object the
//! caller handed us may therefore be replaced mid-session through the
//! reconnect callback, and the replacement is what `into_port` returns.

use std::thread::sleep;
use std::time::Duration;

use log::debug;

use crate::cpu::CpuProfile;
use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use crate::logging::Logger;
use crate::port::{
    read_exact_timeout, reconnect_within, Port, ReconnectCallback, ReconnectParams,
};

const ENTER_PROG_MODE: u8 = b'P';
const LEAVE_PROG_MODE: u8 = b'L';
const SET_ADDR: u8 = b'A';
const AUTO_INC_PROBE: u8 = b'a';
const BLOCK_MODE_PROBE: u8 = b'b';
const START_BLOCK_LOAD: u8 = b'B';
const START_BLOCK_READ: u8 = b'g';
const WRITE_PROG_MEM_LOW: u8 = b'c';
const WRITE_PROG_MEM_HIGH: u8 = b'C';
const ISSUE_PAGE_WRITE: u8 = b'm';
const WRITE_DATA_MEM: u8 = b'D';
const READ_DATA_MEM: u8 = b'd';
const READ_PROG_MEM: u8 = b'R';
const READ_LOCK_BITS: u8 = b'r';
const READ_LOW_FUSE: u8 = b'F';
const READ_HIGH_FUSE: u8 = b'N';
const READ_EXT_FUSE: u8 = b'Q';
const CHIP_ERASE: u8 = b'e';
const SELECT_DEVICE_TYPE: u8 = b'T';
const RETURN_SOFTWARE_ID: u8 = b'S';
const RETURN_SOFTWARE_VERSION: u8 = b'V';
const RETURN_HARDWARE_VERSION: u8 = b'v';
const RETURN_PROGRAMMER_TYPE: u8 = b'p';
const RETURN_DEVICE_CODES: u8 = b't';
const EXIT_BOOTLOADER: u8 = b'E';

const RES_OK: u8 = b'\r';
const RES_UNSUPPORTED: u8 = b'?';

const MEMTYPE_FLASH: u8 = b'F';

const SOFTWARE_ID_LEN: usize = 7;
const SYNC_ATTEMPTS: usize = 5;
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
const PAGE_WRITE_TIMEOUT: Duration = Duration::from_millis(4500);
const CHIP_ERASE_TIMEOUT: Duration = Duration::from_millis(9000);
const RECONNECT_BOUND: Duration = Duration::from_secs(30);

const TOUCH_BAUD: u32 = 1200;
const TOUCH_SETTLE: Duration = Duration::from_millis(500);
/// Wait after closing the touched port for the OS to re-enumerate when no
/// reconnect callback is available (native hosts keep the same device path).
const REENUMERATE_SETTLE: Duration = Duration::from_secs(1);
const EXIT_SETTLE: Duration = Duration::from_secs(2);

pub const DEFAULT_SPEED: u32 = 57_600;
const DEFAULT_PAGE_SIZE: usize = 128;

pub struct Avr109 {
    port: Box<dyn Port>,
    profile: &'static CpuProfile,
    log: Logger,
    reconnect: Option<ReconnectCallback>,
    /// Baud rate for the bootloader session after re-enumeration.
    speed: u32,
    original_baud: u32,
    auto_inc: bool,
    block_size: Option<usize>,
    entered: bool,
    synced: bool,
}

impl Avr109 {
    pub fn new(
        port: Box<dyn Port>,
        profile: &'static CpuProfile,
        log: Logger,
        reconnect: Option<ReconnectCallback>,
        speed: Option<u32>,
    ) -> Self {
        let original_baud = port.baud_rate();
        Avr109 {
            port,
            profile,
            log,
            reconnect,
            speed: speed.unwrap_or(DEFAULT_SPEED),
            original_baud,
            auto_inc: false,
            block_size: None,
            entered: false,
            synced: false,
        }
    }

    pub fn bootload(&mut self, image: &FirmwareImage) -> Result<()> {
        if image.bytes.is_empty() {
            return Err(Error::MissingImage);
        }

        self.enter_bootloader()?;
        self.sync()?;

        let outcome = self.session(&image.bytes);
        // The bootloader is left on both paths once we managed to sync.
        let finish = self.finish();
        let restore = self.restore_port();
        outcome.and(finish).and(restore)
    }

    /// Surrender the (possibly replaced) port.
    pub fn into_port(self) -> Box<dyn Port> {
        self.port
    }

    fn session(&mut self, bytes: &[u8]) -> Result<()> {
        self.init()?;
        self.select_device()?;
        self.enter_prog_mode()?;
        self.chip_erase()?;
        self.program_flash(bytes)?;
        self.verify_flash(bytes)?;
        Ok(())
    }

    /// The 1200-baud touch: the bootloader entry convention for USB-CDC
    /// targets. DTR/RTS games are neither needed nor reliable here.
    fn enter_bootloader(&mut self) -> Result<()> {
        debug!("touching port at 1200 baud");
        self.port.set_baud_rate(TOUCH_BAUD)?;
        sleep(TOUCH_SETTLE);
        self.port.close()?;

        match self.reconnect.clone() {
            Some(callback) => {
                self.log.write_line("waiting for the bootloader port");
                let mut fresh = reconnect_within(
                    &callback,
                    ReconnectParams {
                        baud_rate: self.speed,
                    },
                    RECONNECT_BOUND,
                )?;
                fresh.open()?;
                self.port = fresh;
            }
            None => {
                sleep(REENUMERATE_SETTLE);
                self.port.set_baud_rate(self.speed)?;
                self.port.open()?;
            }
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        for attempt in 1..=SYNC_ATTEMPTS {
            match self.request_exact(&[RETURN_SOFTWARE_ID], SOFTWARE_ID_LEN, DEFAULT_TIMEOUT, "software id") {
                Ok(id) => {
                    let id = String::from_utf8_lossy(&id).into_owned();
                    debug!("bootloader id {id:?}");
                    self.log.write_line(&format!("bootloader: {id}"));
                    self.synced = true;
                    return Ok(());
                }
                Err(e) if e.is_retryable_sync() && attempt < SYNC_ATTEMPTS => {
                    debug!("software id attempt {attempt} timed out, re-sending");
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("sync loop returns on the final attempt")
    }

    fn init(&mut self) -> Result<()> {
        let sw = self.request_exact(&[RETURN_SOFTWARE_VERSION], 2, DEFAULT_TIMEOUT, "software version")?;
        debug!("software version {}.{}", sw[0] as char, sw[1] as char);

        // Hardware version is optional; a probe byte of '?' means the
        // bootloader never implemented it.
        match self.request_probe(&[RETURN_HARDWARE_VERSION], 2, "hardware version")? {
            Some(hw) => debug!("hardware version {}.{}", hw[0] as char, hw[1] as char),
            None => debug!("hardware version not implemented"),
        }

        let ptype = self.request_exact(&[RETURN_PROGRAMMER_TYPE], 1, DEFAULT_TIMEOUT, "programmer type")?;
        debug!("programmer type {}", ptype[0] as char);

        let auto = self.request_exact(&[AUTO_INC_PROBE], 1, DEFAULT_TIMEOUT, "auto increment probe")?;
        self.auto_inc = auto[0] == b'Y';

        let block = self.request_exact(&[BLOCK_MODE_PROBE], 1, DEFAULT_TIMEOUT, "block mode probe")?;
        self.block_size = match block[0] {
            b'Y' => {
                let mut size = [0u8; 2];
                read_exact_timeout(self.port.as_mut(), &mut size, DEFAULT_TIMEOUT, "block buffer size")?;
                Some(usize::from(size[0]) << 8 | usize::from(size[1]))
            }
            _ => None,
        };
        debug!(
            "auto increment: {}, block mode buffer: {:?}",
            self.auto_inc, self.block_size
        );
        Ok(())
    }

    fn select_device(&mut self) -> Result<()> {
        let codes = self.read_device_codes()?;
        let wanted = self.profile.device_code;
        let code = if wanted != 0 {
            if !codes.contains(&wanted) {
                return Err(Error::UnknownDeviceCode(wanted));
            }
            wanted
        } else {
            *codes.first().ok_or(Error::UnknownDeviceCode(0))?
        };
        self.request_ack(&[SELECT_DEVICE_TYPE, code], DEFAULT_TIMEOUT, "select device")?;
        Ok(())
    }

    fn read_device_codes(&mut self) -> Result<Vec<u8>> {
        self.port
            .write_all(&[RETURN_DEVICE_CODES])
            .map_err(Error::IoWrite)?;
        self.port.flush().map_err(Error::IoWrite)?;

        let mut codes = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            read_exact_timeout(self.port.as_mut(), &mut byte, DEFAULT_TIMEOUT, "device codes")?;
            if byte[0] == 0 {
                break;
            }
            codes.push(byte[0]);
            if codes.len() > 64 {
                return Err(Error::FramingOverflow("device codes"));
            }
        }
        Ok(codes)
    }

    fn enter_prog_mode(&mut self) -> Result<()> {
        self.request_ack(&[ENTER_PROG_MODE], DEFAULT_TIMEOUT, "enter prog mode")?;
        self.entered = true;
        Ok(())
    }

    fn chip_erase(&mut self) -> Result<()> {
        self.log.write_line("erasing chip");
        self.request_ack(&[CHIP_ERASE], CHIP_ERASE_TIMEOUT, "chip erase")
    }

    fn page_size(&self) -> usize {
        self.block_size.unwrap_or(DEFAULT_PAGE_SIZE)
    }

    fn set_addr(&mut self, word_addr: u16) -> Result<()> {
        let request = [SET_ADDR, (word_addr >> 8) as u8, word_addr as u8];
        self.request_ack(&request, DEFAULT_TIMEOUT, "set address")
    }

    fn program_flash(&mut self, bytes: &[u8]) -> Result<()> {
        let page = self.page_size();
        let total = bytes.len().div_ceil(page);
        let mut addr = 0;
        while addr < bytes.len() {
            let end = usize::min(addr + page, bytes.len());
            let chunk = &bytes[addr..end];
            // Flash addresses are in words.
            self.set_addr((addr >> 1) as u16)?;

            if self.block_size.is_some() {
                let mut request = vec![
                    START_BLOCK_LOAD,
                    (chunk.len() >> 8) as u8,
                    chunk.len() as u8,
                    MEMTYPE_FLASH,
                ];
                request.extend_from_slice(chunk);
                self.request_ack(&request, PAGE_WRITE_TIMEOUT, "block load")?;
            } else {
                for (i, pair) in chunk.chunks(2).enumerate() {
                    if !self.auto_inc && i > 0 {
                        self.set_addr(((addr + i * 2) >> 1) as u16)?;
                    }
                    self.request_ack(&[WRITE_PROG_MEM_LOW, pair[0]], DEFAULT_TIMEOUT, "write low byte")?;
                    if let Some(&high) = pair.get(1) {
                        self.request_ack(&[WRITE_PROG_MEM_HIGH, high], DEFAULT_TIMEOUT, "write high byte")?;
                    }
                }
                // The page buffer commits at the page's start address.
                self.set_addr((addr >> 1) as u16)?;
                self.request_ack(&[ISSUE_PAGE_WRITE], PAGE_WRITE_TIMEOUT, "page write")?;
            }

            self.log
                .write_line(&format!("wrote page {}/{}", addr / page + 1, total));
            addr = end;
        }
        Ok(())
    }

    fn verify_flash(&mut self, bytes: &[u8]) -> Result<()> {
        let page = self.page_size();
        let mut addr = 0;
        while addr < bytes.len() {
            let end = usize::min(addr + page, bytes.len());
            let chunk = &bytes[addr..end];
            self.set_addr((addr >> 1) as u16)?;

            if self.block_size.is_some() {
                let request = [
                    START_BLOCK_READ,
                    (chunk.len() >> 8) as u8,
                    chunk.len() as u8,
                    MEMTYPE_FLASH,
                ];
                let data = self.request_exact(&request, chunk.len(), DEFAULT_TIMEOUT, "block read")?;
                if data != chunk {
                    return Err(Error::VerifyFailed {
                        address: addr as u32,
                    });
                }
            } else {
                for (i, pair) in chunk.chunks(2).enumerate() {
                    if !self.auto_inc && i > 0 {
                        self.set_addr(((addr + i * 2) >> 1) as u16)?;
                    }
                    // 'R' returns the word high byte first; de-swap before
                    // comparing against byte order.
                    let word = self.request_exact(&[READ_PROG_MEM], 2, DEFAULT_TIMEOUT, "read prog mem")?;
                    let low_matches = word[1] == pair[0];
                    let high_matches = pair.get(1).map_or(true, |&h| word[0] == h);
                    if !low_matches || !high_matches {
                        return Err(Error::VerifyFailed {
                            address: (addr + i * 2) as u32,
                        });
                    }
                }
            }
            addr = end;
        }
        self.log.write_line("flash verified");
        Ok(())
    }

    /// Write EEPROM bytes starting at `addr` (byte units, page size 1).
    pub fn write_eeprom(&mut self, addr: u16, data: &[u8]) -> Result<()> {
        self.set_addr(addr)?;
        for (i, &byte) in data.iter().enumerate() {
            if !self.auto_inc && i > 0 {
                self.set_addr(addr + i as u16)?;
            }
            self.request_ack(&[WRITE_DATA_MEM, byte], PAGE_WRITE_TIMEOUT, "write eeprom")?;
        }
        Ok(())
    }

    /// Read `len` EEPROM bytes starting at `addr`.
    pub fn read_eeprom(&mut self, addr: u16, len: usize) -> Result<Vec<u8>> {
        self.set_addr(addr)?;
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            if !self.auto_inc && i > 0 {
                self.set_addr(addr + i as u16)?;
            }
            let byte = self.request_exact(&[READ_DATA_MEM], 1, DEFAULT_TIMEOUT, "read eeprom")?;
            out.push(byte[0]);
        }
        Ok(out)
    }

    /// Read (low, high, extended) fuse bytes.
    pub fn read_fuses(&mut self) -> Result<(u8, u8, u8)> {
        let low = self.request_exact(&[READ_LOW_FUSE], 1, DEFAULT_TIMEOUT, "read low fuse")?;
        let high = self.request_exact(&[READ_HIGH_FUSE], 1, DEFAULT_TIMEOUT, "read high fuse")?;
        let ext = self.request_exact(&[READ_EXT_FUSE], 1, DEFAULT_TIMEOUT, "read ext fuse")?;
        Ok((low[0], high[0], ext[0]))
    }

    pub fn read_lock_bits(&mut self) -> Result<u8> {
        let bits = self.request_exact(&[READ_LOCK_BITS], 1, DEFAULT_TIMEOUT, "read lock bits")?;
        Ok(bits[0])
    }

    fn finish(&mut self) -> Result<()> {
        if !self.synced {
            return Ok(());
        }
        let mut result = Ok(());
        if self.entered {
            result = self.request_ack(&[LEAVE_PROG_MODE], DEFAULT_TIMEOUT, "leave prog mode");
            self.entered = false;
        }
        let exited = self.request_ack(&[EXIT_BOOTLOADER], DEFAULT_TIMEOUT, "exit bootloader");
        self.synced = false;
        result.and(exited)
    }

    /// Hand the caller back a port running at the baud rate we started at.
    fn restore_port(&mut self) -> Result<()> {
        self.port.close()?;
        sleep(EXIT_SETTLE);

        match self.reconnect.clone() {
            Some(callback) => {
                let mut fresh = reconnect_within(
                    &callback,
                    ReconnectParams {
                        baud_rate: self.original_baud,
                    },
                    RECONNECT_BOUND,
                )?;
                fresh.open()?;
                self.port = fresh;
            }
            None => {
                self.port.set_baud_rate(self.original_baud)?;
                self.port.open()?;
            }
        }
        Ok(())
    }

    fn request_ack(
        &mut self,
        request: &[u8],
        timeout: Duration,
        context: &'static str,
    ) -> Result<()> {
        self.port.write_all(request).map_err(Error::IoWrite)?;
        self.port.flush().map_err(Error::IoWrite)?;

        let mut byte = [0u8; 1];
        read_exact_timeout(self.port.as_mut(), &mut byte, timeout, context)?;
        match byte[0] {
            RES_OK => Ok(()),
            RES_UNSUPPORTED => Err(Error::mismatch(context, "command not supported")),
            other => Err(Error::mismatch(
                context,
                format!("expected CR acknowledge, got {other:#04x}"),
            )),
        }
    }

    fn request_exact(
        &mut self,
        request: &[u8],
        len: usize,
        timeout: Duration,
        context: &'static str,
    ) -> Result<Vec<u8>> {
        self.port.write_all(request).map_err(Error::IoWrite)?;
        self.port.flush().map_err(Error::IoWrite)?;

        let mut data = vec![0u8; len];
        read_exact_timeout(self.port.as_mut(), &mut data, timeout, context)?;
        Ok(data)
    }

    /// Like [Self::request_exact], but a lone `?` means the command is not
    /// implemented and yields `None`.
    fn request_probe(
        &mut self,
        request: &[u8],
        len: usize,
        context: &'static str,
    ) -> Result<Option<Vec<u8>>> {
        self.port.write_all(request).map_err(Error::IoWrite)?;
        self.port.flush().map_err(Error::IoWrite)?;

        let mut first = [0u8; 1];
        read_exact_timeout(self.port.as_mut(), &mut first, DEFAULT_TIMEOUT, context)?;
        if first[0] == RES_UNSUPPORTED {
            return Ok(None);
        }

        let mut data = vec![0u8; len];
        data[0] = first[0];
        read_exact_timeout(self.port.as_mut(), &mut data[1..], DEFAULT_TIMEOUT, context)?;
        Ok(Some(data))
    }
}
