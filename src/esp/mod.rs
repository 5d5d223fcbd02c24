//! Espressif ROM/stub loader
//!
//! Drives the serial bootloader protocol common to the ESP8266 and the
//! ESP32 family: synchronize over SLIP, detect the chip from its magic
//! register, optionally hoist a flasher stub into RAM, then stream
//! (optionally deflated) flash blocks and check the result by MD5.

use std::thread::sleep;
use std::time::Duration;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::{debug, warn};
use md5::{Digest, Md5};
use std::io::Write as _;
use strum::{Display, EnumString};

use crate::error::{Error, Result};
use crate::image::Segment;
use crate::logging::Logger;
use crate::port::Port;

pub mod command;
pub mod connection;
pub mod stub;
pub mod targets;

use command::{Command, CommandType};
use connection::EspConnection;
use stub::FlashStub;
use targets::{Chip, CHIP_DETECT_MAGIC_REG_ADDR};

/// Flash block size under the ROM loader.
pub const FLASH_WRITE_SIZE_ROM: usize = 0x400;
/// Flash block size once the stub is running.
pub const FLASH_WRITE_SIZE_STUB: usize = 0x4000;
/// RAM upload block size for the stub itself.
const RAM_BLOCK_SIZE: usize = 0x1800;

/// Application image header magic.
const ESP_IMAGE_MAGIC: u8 = 0xE9;

/// The stub greets us with this sentinel once it is running.
const STUB_HANDSHAKE: &[u8] = b"OHAI";
const STUB_HANDSHAKE_WINDOW: Duration = Duration::from_millis(200);

const BAUD_SWITCH_SETTLE: Duration = Duration::from_millis(50);

/// SPI flash mode as encoded in the image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum FlashMode {
    Qio = 0,
    Qout = 1,
    Dio = 2,
    Dout = 3,
}

/// SPI flash frequency as encoded in the image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum FlashFrequency {
    #[strum(serialize = "20m")]
    Freq20M,
    #[strum(serialize = "26m")]
    Freq26M,
    #[strum(serialize = "40m")]
    Freq40M,
    #[strum(serialize = "80m")]
    Freq80M,
}

impl FlashFrequency {
    fn encoding(self) -> u8 {
        match self {
            FlashFrequency::Freq40M => 0x0,
            FlashFrequency::Freq26M => 0x1,
            FlashFrequency::Freq20M => 0x2,
            FlashFrequency::Freq80M => 0xF,
        }
    }
}

/// Per-upload flash write options. `None` fields mean "keep" whatever the
/// image header already says.
#[derive(Debug, Clone, Default)]
pub struct FlashOptions {
    pub mode: Option<FlashMode>,
    pub freq: Option<FlashFrequency>,
    pub size: Option<String>,
    pub compress: bool,
    pub erase_all: bool,
    /// Upgrade an MD5 mismatch from a logged warning to a fatal error.
    pub strict_md5: bool,
}

pub struct EspLoader {
    conn: EspConnection,
    chip: Chip,
    is_stub: bool,
    flash_write_size: usize,
    log: Logger,
}

impl EspLoader {
    /// Synchronize with the ROM bootloader and detect the chip.
    pub fn connect(port: Box<dyn Port>, log: Logger, attempts: usize) -> Result<Self> {
        let mut conn = EspConnection::new(port, log.clone());
        conn.connect(attempts)?;

        let magic = conn.read_reg(CHIP_DETECT_MAGIC_REG_ADDR)?;
        let chip = Chip::from_magic(magic)?;
        log.write_line(&format!("detected chip: {}", chip.target().chip_name()));

        Ok(EspLoader {
            conn,
            chip,
            is_stub: false,
            flash_write_size: FLASH_WRITE_SIZE_ROM,
            log,
        })
    }

    pub fn chip(&self) -> Chip {
        self.chip
    }

    pub fn is_stub(&self) -> bool {
        self.is_stub
    }

    pub fn into_port(self) -> Box<dyn Port> {
        self.conn.into_port()
    }

    pub fn read_mac(&mut self) -> Result<String> {
        self.chip.target().read_mac(&mut self.conn)
    }

    pub fn chip_description(&mut self) -> Result<String> {
        self.chip.target().chip_description(&mut self.conn)
    }

    pub fn chip_features(&mut self) -> Result<Vec<&'static str>> {
        self.chip.target().chip_features(&mut self.conn)
    }

    pub fn crystal_freq(&mut self) -> Result<u32> {
        self.chip.target().crystal_freq(&mut self.conn)
    }

    /// Upload the flasher stub and wait for its handshake.
    ///
    /// A missing handshake downgrades to ROM mode with a logged warning;
    /// only transport failures abort. `is_stub` flips false → true at most
    /// once per session.
    pub fn run_stub(&mut self, stub: &FlashStub) -> Result<()> {
        if self.is_stub {
            return Ok(());
        }
        self.log.write_line("uploading flasher stub");

        for (start, bytes) in [(stub.text_start, &stub.text), (stub.data_start, &stub.data)] {
            if bytes.is_empty() {
                continue;
            }
            let blocks = bytes.len().div_ceil(RAM_BLOCK_SIZE);
            self.command(Command::MemBegin {
                size: bytes.len() as u32,
                blocks: blocks as u32,
                block_size: RAM_BLOCK_SIZE as u32,
                offset: start,
            })?;
            for (sequence, block) in bytes.chunks(RAM_BLOCK_SIZE).enumerate() {
                self.command(Command::MemData {
                    data: block,
                    sequence: sequence as u32,
                })?;
            }
        }

        debug!("jumping to stub entry {:#010x}", stub.entry);
        self.command(Command::MemEnd { entry: stub.entry })?;

        match self.conn.read_raw_frame(STUB_HANDSHAKE_WINDOW) {
            Ok(frame) if frame == STUB_HANDSHAKE => {
                self.is_stub = true;
                self.flash_write_size = FLASH_WRITE_SIZE_STUB;
                self.log.write_line("stub running");
                Ok(())
            }
            Ok(frame) => {
                warn!("unexpected stub handshake {frame:02x?}, staying in ROM mode");
                self.log.write_line("stub handshake failed, using ROM loader");
                Ok(())
            }
            Err(e) if e.is_retryable_sync() => {
                self.log.write_line("stub handshake timed out, using ROM loader");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Switch to a faster baud rate. Stub only; the ROM loader's UART
    /// timing is too fragile for this to be worth attempting.
    pub fn change_baudrate(&mut self, new_baud: u32) -> Result<()> {
        if !self.is_stub {
            debug!("skipping baud change without the stub");
            return Ok(());
        }
        let prior_baud = self.conn.baud_rate();
        self.command(Command::ChangeBaud {
            new_baud,
            prior_baud,
        })?;
        self.conn.set_baud_rate(new_baud)?;
        sleep(BAUD_SWITCH_SETTLE);
        self.conn.port_mut().clear_input()?;
        self.log.write_line(&format!("baud rate changed to {new_baud}"));
        Ok(())
    }

    /// Erase the entire flash. Stub only.
    pub fn erase_flash(&mut self) -> Result<()> {
        if !self.is_stub {
            return Err(Error::EspStubFailed(
                "ERASE_FLASH requires the flasher stub".into(),
            ));
        }
        self.log.write_line("erasing flash, this can take a while");
        self.command(Command::EraseFlash)?;
        Ok(())
    }

    /// Erase `size` bytes at `offset`. Stub only.
    pub fn erase_region(&mut self, offset: u32, size: u32) -> Result<()> {
        if !self.is_stub {
            return Err(Error::EspStubFailed(
                "ERASE_REGION requires the flasher stub".into(),
            ));
        }
        self.conn
            .with_timeout(CommandType::EraseRegion.timeout_for_size(size), |conn| {
                conn.command(&Command::EraseRegion { offset, size })
            })?;
        Ok(())
    }

    /// Write every file to flash and leave the loader resident.
    ///
    /// Ends with the `FLASH_BEGIN(0,0)` + `*_END(stay_in_loader=1)` pair;
    /// rebooting into the application is a separate, explicit call.
    pub fn write_flash(&mut self, files: &[Segment], options: &FlashOptions) -> Result<()> {
        self.prepare_flash()?;
        if options.erase_all {
            self.erase_flash()?;
        }

        let compress = options.compress && (self.is_stub || self.chip != Chip::Esp8266);
        if options.compress && !compress {
            debug!("ESP8266 ROM loader cannot inflate, writing uncompressed");
        }

        for file in files {
            self.write_file(file, options, compress)?;
        }

        self.command(Command::FlashBegin {
            size: 0,
            blocks: 0,
            block_size: self.flash_write_size as u32,
            offset: 0,
            supports_encryption: self.begin_takes_encryption(),
        })?;
        if compress {
            self.command(Command::FlashDeflEnd {
                stay_in_loader: true,
            })?;
        } else {
            self.command(Command::FlashEnd {
                stay_in_loader: true,
            })?;
        }
        Ok(())
    }

    /// Reboot into the application.
    pub fn reboot(&mut self) -> Result<()> {
        self.log.write_line("rebooting");
        self.conn.reboot()
    }

    fn begin_takes_encryption(&self) -> bool {
        self.chip.target().supports_encryption() && !self.is_stub
    }

    /// Attach the SPI flash. The ESP8266 ROM has no SPI_ATTACH and uses an
    /// empty FLASH_BEGIN instead.
    fn prepare_flash(&mut self) -> Result<()> {
        if self.chip == Chip::Esp8266 {
            self.command(Command::FlashBegin {
                size: 0,
                blocks: 0,
                block_size: self.flash_write_size as u32,
                offset: 0,
                supports_encryption: false,
            })?;
        } else {
            self.command(Command::SpiAttach {
                hspi_arg: 0,
                stub: self.is_stub,
            })?;
        }
        Ok(())
    }

    fn write_file(
        &mut self,
        file: &Segment,
        options: &FlashOptions,
        compress: bool,
    ) -> Result<()> {
        let target = self.chip.target();
        let mut image = file.bytes.clone();
        // Flash writes operate on 4-byte words.
        while image.len() % 4 != 0 {
            image.push(0xFF);
        }

        let wants_header_patch =
            options.mode.is_some() || options.freq.is_some() || options.size.is_some();
        if file.addr == target.bootloader_flash_offset() && wants_header_patch {
            self.patch_image_header(&mut image, options)?;
        }

        let mut hasher = Md5::new();
        hasher.update(&image);
        let expected_md5: [u8; 16] = hasher.finalize().into();

        let flash_write_size = self.flash_write_size;
        self.log.write_line(&format!(
            "writing {} bytes at {:#010x}",
            image.len(),
            file.addr
        ));

        if compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
            encoder.write_all(&image).map_err(Error::IoWrite)?;
            let compressed = encoder.finish().map_err(Error::IoWrite)?;

            let blocks = compressed.len().div_ceil(flash_write_size);
            self.conn.with_timeout(
                CommandType::FlashDeflBegin.timeout_for_size(image.len() as u32),
                |conn| {
                    conn.command(&Command::FlashDeflBegin {
                        size: image.len() as u32,
                        blocks: blocks as u32,
                        block_size: flash_write_size as u32,
                        offset: file.addr,
                        supports_encryption: target.supports_encryption() && !self.is_stub,
                    })
                },
            )?;

            for (sequence, block) in compressed.chunks(flash_write_size).enumerate() {
                self.conn.with_timeout(
                    CommandType::FlashDeflData.timeout_for_size(flash_write_size as u32),
                    |conn| {
                        conn.command(&Command::FlashDeflData {
                            data: block,
                            sequence: sequence as u32,
                        })
                    },
                )?;
                self.log_progress(sequence + 1, blocks);
            }
        } else {
            let blocks = image.len().div_ceil(flash_write_size);
            // The ESP8266 ROM rounds erases oddly; its descriptor corrects
            // the size we announce.
            let erase_size = if self.is_stub {
                image.len() as u32
            } else {
                target.erase_size(file.addr, image.len() as u32)
            };
            self.conn.with_timeout(
                CommandType::FlashBegin.timeout_for_size(erase_size),
                |conn| {
                    conn.command(&Command::FlashBegin {
                        size: erase_size,
                        blocks: blocks as u32,
                        block_size: flash_write_size as u32,
                        offset: file.addr,
                        supports_encryption: target.supports_encryption() && !self.is_stub,
                    })
                },
            )?;

            for (sequence, block) in image.chunks(flash_write_size).enumerate() {
                self.conn.with_timeout(
                    CommandType::FlashData.timeout_for_size(flash_write_size as u32),
                    |conn| {
                        conn.command(&Command::FlashData {
                            data: block,
                            pad_to: flash_write_size,
                            sequence: sequence as u32,
                        })
                    },
                )?;
                self.log_progress(sequence + 1, blocks);
            }
        }

        if self.is_stub {
            // One register read to make sure the stub has drained its queue.
            self.conn.read_reg(CHIP_DETECT_MAGIC_REG_ADDR)?;
        }

        // The ESP8266 ROM predates SPI_FLASH_MD5.
        if self.is_stub || self.chip != Chip::Esp8266 {
            self.check_md5(file.addr, image.len() as u32, expected_md5, options.strict_md5)?;
        }
        Ok(())
    }

    fn check_md5(
        &mut self,
        addr: u32,
        size: u32,
        expected: [u8; 16],
        strict: bool,
    ) -> Result<()> {
        let (_, body) = self.conn.with_timeout(
            CommandType::FlashMd5.timeout_for_size(size),
            |conn| {
                conn.command(&Command::FlashMd5 {
                    offset: addr,
                    size,
                })
            },
        )?;
        let actual = parse_md5_body(&body)?;

        if actual != expected {
            // Mismatches are logged, not raised, matching the historical
            // behavior; strict_md5 upgrades them.
            self.log.write_line(&format!(
                "MD5 mismatch at {:#010x}: flash {}, image {}",
                addr,
                hex_digest(&actual),
                hex_digest(&expected)
            ));
            warn!("flash MD5 mismatch at {addr:#010x}");
            if strict {
                return Err(Error::VerifyFailed { address: addr });
            }
        } else {
            self.log.write_line("hash of data verified");
        }
        Ok(())
    }

    fn log_progress(&self, written: usize, total: usize) {
        self.log
            .write_line(&format!("writing: {}%", written * 100 / total.max(1)));
    }

    /// Rewrite the flash mode/size/frequency bytes of a bootloader image
    /// header in place.
    fn patch_image_header(&self, image: &mut [u8], options: &FlashOptions) -> Result<()> {
        if image.len() < 4 || image[0] != ESP_IMAGE_MAGIC {
            return Err(Error::InvalidImage(
                "bootloader image lacks the 0xE9 header magic".into(),
            ));
        }
        if let Some(mode) = options.mode {
            image[2] = mode as u8;
        }
        if let Some(freq) = options.freq {
            image[3] = (image[3] & 0xF0) | freq.encoding();
        }
        if let Some(size) = &options.size {
            let encodings = self.chip.target().flash_size_encodings();
            let encoded = encodings
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(size))
                .map(|(_, enc)| *enc)
                .ok_or_else(|| {
                    Error::InvalidImage(format!(
                        "flash size '{size}' is not supported by the {}",
                        self.chip.target().chip_name()
                    ))
                })?;
            image[3] = (image[3] & 0x0F) | encoded;
        }
        Ok(())
    }

    /// Issue a command under its type's default timeout.
    fn command(&mut self, command: Command<'_>) -> Result<(u32, Vec<u8>)> {
        let timeout = command.command_type().timeout();
        self.conn.with_timeout(timeout, |conn| conn.command(&command))
    }
}

/// Extract the 16 digest bytes from an MD5 response body: the stub sends
/// them raw, the ROM as 32 ASCII hex characters.
fn parse_md5_body(body: &[u8]) -> Result<[u8; 16]> {
    if body.len() >= 32 {
        let text = std::str::from_utf8(&body[..32])
            .map_err(|_| Error::mismatch("SPI_FLASH_MD5", "digest is not ASCII hex"))?;
        let mut digest = [0u8; 16];
        for (i, chunk) in digest.iter_mut().enumerate() {
            *chunk = u8::from_str_radix(&text[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::mismatch("SPI_FLASH_MD5", "digest is not ASCII hex"))?;
        }
        Ok(digest)
    } else if body.len() >= 16 {
        Ok(body[..16].try_into().unwrap())
    } else {
        Err(Error::mismatch(
            "SPI_FLASH_MD5",
            format!("digest body too short: {} bytes", body.len()),
        ))
    }
}

fn hex_digest(digest: &[u8; 16]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::esp::connection::{request_frame, response_frame};
    use crate::port::mock::MockPort;
    use crate::slip;

    const ACK: &[u8] = &[0, 0];

    fn expect(port: &mut MockPort, command: &Command<'_>, value: u32, body: &[u8]) {
        port.expect(
            request_frame(command),
            response_frame(command.command_type() as u8, value, body),
        );
    }

    fn script_connect(port: &mut MockPort, magic: u32) {
        expect(port, &Command::Sync, 0, ACK);
        expect(
            port,
            &Command::ReadReg {
                address: CHIP_DETECT_MAGIC_REG_ADDR,
            },
            magic,
            ACK,
        );
    }

    fn sample_stub() -> FlashStub {
        FlashStub {
            entry: 0x4010_0000,
            text: vec![0x11; 8],
            text_start: 0x4010_0000,
            data: vec![0x22; 4],
            data_start: 0x3FFE_0000,
        }
    }

    fn script_run_stub(port: &mut MockPort, stub: &FlashStub) {
        expect(
            port,
            &Command::MemBegin {
                size: stub.text.len() as u32,
                blocks: 1,
                block_size: RAM_BLOCK_SIZE as u32,
                offset: stub.text_start,
            },
            0,
            ACK,
        );
        expect(
            port,
            &Command::MemData {
                data: &stub.text,
                sequence: 0,
            },
            0,
            ACK,
        );
        expect(
            port,
            &Command::MemBegin {
                size: stub.data.len() as u32,
                blocks: 1,
                block_size: RAM_BLOCK_SIZE as u32,
                offset: stub.data_start,
            },
            0,
            ACK,
        );
        expect(
            port,
            &Command::MemData {
                data: &stub.data,
                sequence: 0,
            },
            0,
            ACK,
        );
        // MEM_END ack, then the stub announces itself.
        let mut reply = response_frame(CommandType::MemEnd as u8, 0, ACK);
        reply.extend(slip::encode(STUB_HANDSHAKE));
        port.expect(
            request_frame(&Command::MemEnd { entry: stub.entry }),
            reply,
        );
    }

    fn compress(image: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(image).unwrap();
        encoder.finish().unwrap()
    }

    fn md5_of(image: &[u8]) -> [u8; 16] {
        let mut hasher = Md5::new();
        hasher.update(image);
        hasher.finalize().into()
    }

    #[test]
    fn esp32_stub_session_flashes_compressed_and_verifies() {
        let image: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let mut padded = image.clone();
        while padded.len() % 4 != 0 {
            padded.push(0xFF);
        }
        let compressed = compress(&padded);
        let stub = sample_stub();

        let mut port = MockPort::new();
        script_connect(&mut port, 0x00F0_1D83);
        script_run_stub(&mut port, &stub);
        expect(
            &mut port,
            &Command::ChangeBaud {
                new_baud: 921_600,
                prior_baud: 115_200,
            },
            0,
            ACK,
        );
        expect(
            &mut port,
            &Command::SpiAttach {
                hspi_arg: 0,
                stub: true,
            },
            0,
            ACK,
        );
        expect(
            &mut port,
            &Command::FlashDeflBegin {
                size: padded.len() as u32,
                blocks: 1,
                block_size: FLASH_WRITE_SIZE_STUB as u32,
                offset: 0x1_0000,
                supports_encryption: false,
            },
            0,
            ACK,
        );
        expect(
            &mut port,
            &Command::FlashDeflData {
                data: &compressed,
                sequence: 0,
            },
            0,
            ACK,
        );
        // Stub synchronization ping.
        expect(
            &mut port,
            &Command::ReadReg {
                address: CHIP_DETECT_MAGIC_REG_ADDR,
            },
            0x00F0_1D83,
            ACK,
        );
        // Stub MD5 responses carry the raw digest ahead of the status.
        let mut md5_body = md5_of(&padded).to_vec();
        md5_body.extend_from_slice(ACK);
        port.expect(
            request_frame(&Command::FlashMd5 {
                offset: 0x1_0000,
                size: padded.len() as u32,
            }),
            response_frame(CommandType::FlashMd5 as u8, 0, &md5_body),
        );
        expect(
            &mut port,
            &Command::FlashBegin {
                size: 0,
                blocks: 0,
                block_size: FLASH_WRITE_SIZE_STUB as u32,
                offset: 0,
                supports_encryption: false,
            },
            0,
            ACK,
        );
        expect(
            &mut port,
            &Command::FlashDeflEnd {
                stay_in_loader: true,
            },
            0,
            ACK,
        );
        let state = port.state_handle();

        let mut loader =
            EspLoader::connect(Box::new(port), Logger::disabled(), 2).unwrap();
        assert_eq!(loader.chip(), Chip::Esp32);

        loader.run_stub(&stub).unwrap();
        assert!(loader.is_stub());

        loader.change_baudrate(921_600).unwrap();

        loader
            .write_flash(
                &[Segment::new(0x1_0000, image)],
                &FlashOptions {
                    compress: true,
                    ..FlashOptions::default()
                },
            )
            .unwrap();

        loader.reboot().unwrap();

        let state = state.lock().unwrap();
        // The baud switch reconfigured the port.
        assert!(state.baud_history.contains(&921_600));
        // Reboot left both modem lines low.
        assert_eq!(
            &state.signals[state.signals.len() - 2..],
            &[('D', false), ('R', false)]
        );
    }

    #[test]
    fn esp8266_rom_session_writes_raw_and_skips_md5() {
        let image = vec![0x42u8; 0x800];

        let mut port = MockPort::new();
        script_connect(&mut port, 0xFFF0_C101);
        // ESP8266 flash attach is an empty FLASH_BEGIN.
        expect(
            &mut port,
            &Command::FlashBegin {
                size: 0,
                blocks: 0,
                block_size: FLASH_WRITE_SIZE_ROM as u32,
                offset: 0,
                supports_encryption: false,
            },
            0,
            ACK,
        );
        expect(
            &mut port,
            &Command::FlashBegin {
                size: Chip::Esp8266.target().erase_size(0, 0x800),
                blocks: 2,
                block_size: FLASH_WRITE_SIZE_ROM as u32,
                offset: 0,
                supports_encryption: false,
            },
            0,
            ACK,
        );
        for sequence in 0..2u32 {
            expect(
                &mut port,
                &Command::FlashData {
                    data: &image[sequence as usize * 0x400..][..0x400],
                    pad_to: FLASH_WRITE_SIZE_ROM,
                    sequence,
                },
                0,
                ACK,
            );
        }
        // No MD5 exchange is scripted: issuing one would fail the test.
        expect(
            &mut port,
            &Command::FlashBegin {
                size: 0,
                blocks: 0,
                block_size: FLASH_WRITE_SIZE_ROM as u32,
                offset: 0,
                supports_encryption: false,
            },
            0,
            ACK,
        );
        expect(
            &mut port,
            &Command::FlashEnd {
                stay_in_loader: true,
            },
            0,
            ACK,
        );

        let mut loader =
            EspLoader::connect(Box::new(port), Logger::disabled(), 2).unwrap();
        assert_eq!(loader.chip(), Chip::Esp8266);
        assert!(!loader.is_stub());

        // Compression is requested but the ROM loader cannot inflate.
        loader
            .write_flash(
                &[Segment::new(0, image)],
                &FlashOptions {
                    compress: true,
                    ..FlashOptions::default()
                },
            )
            .unwrap();
    }

    #[test]
    fn md5_mismatch_logs_unless_strict() {
        fn scripted_loader(strict: bool) -> (EspLoader, Vec<u8>) {
            let image = vec![0x55u8; 16];
            let mut port = MockPort::new();
            script_connect(&mut port, 0x00F0_1D83);
            expect(
                &mut port,
                &Command::SpiAttach {
                    hspi_arg: 0,
                    stub: false,
                },
                0,
                ACK,
            );
            expect(
                &mut port,
                &Command::FlashBegin {
                    size: 16,
                    blocks: 1,
                    block_size: FLASH_WRITE_SIZE_ROM as u32,
                    offset: 0x2000,
                    supports_encryption: false,
                },
                0,
                ACK,
            );
            expect(
                &mut port,
                &Command::FlashData {
                    data: &image,
                    pad_to: FLASH_WRITE_SIZE_ROM,
                    sequence: 0,
                },
                0,
                ACK,
            );
            // ROM-style ASCII digest of something else entirely.
            let mut body = b"00112233445566778899aabbccddeeff".to_vec();
            body.extend_from_slice(&[0, 0, 0, 0]);
            port.expect(
                request_frame(&Command::FlashMd5 {
                    offset: 0x2000,
                    size: 16,
                }),
                response_frame(CommandType::FlashMd5 as u8, 0, &body),
            );
            if !strict {
                expect(
                    &mut port,
                    &Command::FlashBegin {
                        size: 0,
                        blocks: 0,
                        block_size: FLASH_WRITE_SIZE_ROM as u32,
                        offset: 0,
                        supports_encryption: false,
                    },
                    0,
                    ACK,
                );
                expect(
                    &mut port,
                    &Command::FlashEnd {
                        stay_in_loader: true,
                    },
                    0,
                    ACK,
                );
            }
            let loader = EspLoader::connect(Box::new(port), Logger::disabled(), 2).unwrap();
            (loader, image)
        }

        let (mut loader, image) = scripted_loader(false);
        loader
            .write_flash(
                &[Segment::new(0x2000, image.clone())],
                &FlashOptions::default(),
            )
            .unwrap();

        let (mut loader, image) = scripted_loader(true);
        let err = loader
            .write_flash(
                &[Segment::new(0x2000, image)],
                &FlashOptions {
                    strict_md5: true,
                    ..FlashOptions::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VerifyFailed);
    }

    #[test]
    fn header_patch_validates_magic_and_merges_nibbles() {
        let loader_chip = Chip::Esp32;
        let dummy = EspLoader {
            conn: EspConnection::new(Box::new(MockPort::new()), Logger::disabled()),
            chip: loader_chip,
            is_stub: false,
            flash_write_size: FLASH_WRITE_SIZE_ROM,
            log: Logger::disabled(),
        };

        let mut image = vec![0xE9, 0x04, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00];
        dummy
            .patch_image_header(
                &mut image,
                &FlashOptions {
                    mode: Some(FlashMode::Dio),
                    freq: Some(FlashFrequency::Freq40M),
                    size: Some("4MB".into()),
                    ..FlashOptions::default()
                },
            )
            .unwrap();
        assert_eq!(image[2], 0x02);
        assert_eq!(image[3], 0x20);

        let mut bad = vec![0x00, 0x00, 0x00, 0x00];
        let err = dummy
            .patch_image_header(
                &mut bad,
                &FlashOptions {
                    mode: Some(FlashMode::Dio),
                    ..FlashOptions::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidImage);
    }

    #[test]
    fn stub_handshake_timeout_falls_back_to_rom() {
        let stub = sample_stub();
        let mut port = MockPort::new();
        script_connect(&mut port, 0x00F0_1D83);
        // Same upload script, but no OHAI after the MEM_END ack.
        expect(
            &mut port,
            &Command::MemBegin {
                size: stub.text.len() as u32,
                blocks: 1,
                block_size: RAM_BLOCK_SIZE as u32,
                offset: stub.text_start,
            },
            0,
            ACK,
        );
        expect(
            &mut port,
            &Command::MemData {
                data: &stub.text,
                sequence: 0,
            },
            0,
            ACK,
        );
        expect(
            &mut port,
            &Command::MemBegin {
                size: stub.data.len() as u32,
                blocks: 1,
                block_size: RAM_BLOCK_SIZE as u32,
                offset: stub.data_start,
            },
            0,
            ACK,
        );
        expect(
            &mut port,
            &Command::MemData {
                data: &stub.data,
                sequence: 0,
            },
            0,
            ACK,
        );
        expect(&mut port, &Command::MemEnd { entry: stub.entry }, 0, ACK);

        let mut loader =
            EspLoader::connect(Box::new(port), Logger::disabled(), 2).unwrap();
        loader.run_stub(&stub).unwrap();
        assert!(!loader.is_stub());
    }

    #[test]
    fn md5_bodies_parse_in_both_encodings() {
        let raw: Vec<u8> = (0u8..16).collect();
        assert_eq!(parse_md5_body(&raw).unwrap(), <[u8; 16]>::try_from(&raw[..]).unwrap());

        let ascii = b"000102030405060708090a0b0c0d0e0f".to_vec();
        assert_eq!(
            parse_md5_body(&ascii).unwrap(),
            <[u8; 16]>::try_from(&raw[..]).unwrap()
        );

        assert!(parse_md5_body(&[0u8; 4]).is_err());
    }
}
