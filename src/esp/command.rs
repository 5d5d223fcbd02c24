//! ESP serial-protocol commands
//!
//! Every request is `00 | OP | LEN_le16 | CHECKSUM_le32 | DATA[LEN]`,
//! SLIP-framed on the wire. Only the data-bearing commands (FLASH_DATA,
//! MEM_DATA and the deflate variant) carry a real checksum, seeded with
//! 0xEF; everything else sends zero. Do not generalize the seed.

use std::io::Write;
use std::mem::size_of;
use std::time::Duration;

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::Display;

pub(crate) const CHECKSUM_INIT: u8 = 0xEF;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
const MEM_END_TIMEOUT: Duration = Duration::from_millis(50);
const ERASE_CHIP_TIMEOUT: Duration = Duration::from_secs(120);
const ERASE_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const ERASE_WRITE_TIMEOUT_PER_MB: Duration = Duration::from_secs(40);

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
#[repr(u8)]
#[non_exhaustive]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0A,
    SpiAttach = 0x0D,
    ChangeBaud = 0x0F,
    FlashDeflBegin = 0x10,
    FlashDeflData = 0x11,
    FlashDeflEnd = 0x12,
    FlashMd5 = 0x13,
    // Stub-only commands.
    EraseFlash = 0xD0,
    EraseRegion = 0xD1,
}

impl CommandType {
    pub fn name(self) -> &'static str {
        match self {
            CommandType::FlashBegin => "FLASH_BEGIN",
            CommandType::FlashData => "FLASH_DATA",
            CommandType::FlashEnd => "FLASH_END",
            CommandType::MemBegin => "MEM_BEGIN",
            CommandType::MemEnd => "MEM_END",
            CommandType::MemData => "MEM_DATA",
            CommandType::Sync => "SYNC",
            CommandType::WriteReg => "WRITE_REG",
            CommandType::ReadReg => "READ_REG",
            CommandType::SpiAttach => "SPI_ATTACH",
            CommandType::ChangeBaud => "CHANGE_BAUDRATE",
            CommandType::FlashDeflBegin => "FLASH_DEFL_BEGIN",
            CommandType::FlashDeflData => "FLASH_DEFL_DATA",
            CommandType::FlashDeflEnd => "FLASH_DEFL_END",
            CommandType::FlashMd5 => "SPI_FLASH_MD5",
            CommandType::EraseFlash => "ERASE_FLASH",
            CommandType::EraseRegion => "ERASE_REGION",
        }
    }

    pub fn timeout(self) -> Duration {
        match self {
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::MemEnd => MEM_END_TIMEOUT,
            CommandType::EraseFlash => ERASE_CHIP_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Erase and write timeouts scale with the amount of flash touched.
    pub fn timeout_for_size(self, size: u32) -> Duration {
        fn scaled(timeout_per_mb: Duration, size: u32) -> Duration {
            let mb = f64::from(size) / 1_000_000.0;
            Duration::max(
                DEFAULT_TIMEOUT,
                Duration::from_millis((timeout_per_mb.as_millis() as f64 * mb) as u64),
            )
        }
        match self {
            CommandType::FlashBegin | CommandType::FlashDeflBegin | CommandType::EraseRegion => {
                scaled(ERASE_REGION_TIMEOUT_PER_MB, size)
            }
            CommandType::FlashData | CommandType::FlashDeflData => {
                scaled(ERASE_WRITE_TIMEOUT_PER_MB, size)
            }
            _ => self.timeout(),
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub enum Command<'a> {
    FlashBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
    },
    FlashData {
        data: &'a [u8],
        pad_to: usize,
        sequence: u32,
    },
    FlashEnd {
        stay_in_loader: bool,
    },
    MemBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    MemData {
        data: &'a [u8],
        sequence: u32,
    },
    MemEnd {
        entry: u32,
    },
    Sync,
    WriteReg {
        address: u32,
        value: u32,
        mask: Option<u32>,
    },
    ReadReg {
        address: u32,
    },
    SpiAttach {
        hspi_arg: u32,
        stub: bool,
    },
    ChangeBaud {
        new_baud: u32,
        prior_baud: u32,
    },
    FlashDeflBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
    },
    FlashDeflData {
        data: &'a [u8],
        sequence: u32,
    },
    FlashDeflEnd {
        stay_in_loader: bool,
    },
    FlashMd5 {
        offset: u32,
        size: u32,
    },
    EraseFlash,
    EraseRegion {
        offset: u32,
        size: u32,
    },
}

impl Command<'_> {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::MemBegin { .. } => CommandType::MemBegin,
            Command::MemData { .. } => CommandType::MemData,
            Command::MemEnd { .. } => CommandType::MemEnd,
            Command::Sync => CommandType::Sync,
            Command::WriteReg { .. } => CommandType::WriteReg,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::SpiAttach { .. } => CommandType::SpiAttach,
            Command::ChangeBaud { .. } => CommandType::ChangeBaud,
            Command::FlashDeflBegin { .. } => CommandType::FlashDeflBegin,
            Command::FlashDeflData { .. } => CommandType::FlashDeflData,
            Command::FlashDeflEnd { .. } => CommandType::FlashDeflEnd,
            Command::FlashMd5 { .. } => CommandType::FlashMd5,
            Command::EraseFlash => CommandType::EraseFlash,
            Command::EraseRegion { .. } => CommandType::EraseRegion,
        }
    }

    /// Serialize the packet (header + body, not yet SLIP-framed).
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&[0, self.command_type() as u8])?;
        match *self {
            Command::FlashBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            }
            | Command::FlashDeflBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            } => {
                begin_command(
                    writer,
                    size,
                    blocks,
                    block_size,
                    offset,
                    supports_encryption,
                )?;
            }
            Command::FlashData {
                data,
                pad_to,
                sequence,
            } => {
                data_command(writer, data, pad_to, sequence)?;
            }
            Command::FlashEnd { stay_in_loader } | Command::FlashDeflEnd { stay_in_loader } => {
                write_basic(writer, &[u8::from(stay_in_loader)], 0)?;
            }
            Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct MemBeginParams {
                    size: u32,
                    blocks: u32,
                    block_size: u32,
                    offset: u32,
                }
                let params = MemBeginParams {
                    size,
                    blocks,
                    block_size,
                    offset,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::MemData { data, sequence } => {
                data_command(writer, data, 0, sequence)?;
            }
            Command::MemEnd { entry } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct EntryParams {
                    no_entry: u32,
                    entry: u32,
                }
                let params = EntryParams {
                    no_entry: u32::from(entry == 0),
                    entry,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::Sync => {
                let mut data = [0x55u8; 36];
                data[..4].copy_from_slice(&[0x07, 0x07, 0x12, 0x20]);
                write_basic(writer, &data, 0)?;
            }
            Command::WriteReg {
                address,
                value,
                mask,
            } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct WriteRegParams {
                    addr: u32,
                    value: u32,
                    mask: u32,
                    delay_us: u32,
                }
                let params = WriteRegParams {
                    addr: address,
                    value,
                    mask: mask.unwrap_or(0xFFFF_FFFF),
                    delay_us: 0,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::ReadReg { address } => {
                write_basic(writer, &address.to_le_bytes(), 0)?;
            }
            Command::SpiAttach { hspi_arg, stub } => {
                // The ROM loader takes a second, unused word.
                let mut data = hspi_arg.to_le_bytes().to_vec();
                if !stub {
                    data.extend_from_slice(&[0u8; 4]);
                }
                write_basic(writer, &data, 0)?;
            }
            Command::ChangeBaud {
                new_baud,
                prior_baud,
            } => {
                let mut data = [0u8; 8];
                data[..4].copy_from_slice(&new_baud.to_le_bytes());
                data[4..].copy_from_slice(&prior_baud.to_le_bytes());
                write_basic(writer, &data, 0)?;
            }
            Command::FlashDeflData { data, sequence } => {
                data_command(writer, data, 0, sequence)?;
            }
            Command::FlashMd5 { offset, size } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct Md5Params {
                    addr: u32,
                    size: u32,
                    dummy1: u32,
                    dummy2: u32,
                }
                let params = Md5Params {
                    addr: offset,
                    size,
                    dummy1: 0,
                    dummy2: 0,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::EraseFlash => {
                write_basic(writer, &[], 0)?;
            }
            Command::EraseRegion { offset, size } => {
                let mut data = [0u8; 8];
                data[..4].copy_from_slice(&offset.to_le_bytes());
                data[4..].copy_from_slice(&size.to_le_bytes());
                write_basic(writer, &data, 0)?;
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut packet = Vec::new();
        // Writing into a Vec cannot fail.
        self.write(&mut packet).unwrap();
        packet
    }
}

pub(crate) fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }
    checksum
}

fn write_basic<W: Write>(mut writer: W, data: &[u8], checksum: u32) -> std::io::Result<()> {
    writer.write_all(&(data.len() as u16).to_le_bytes())?;
    writer.write_all(&checksum.to_le_bytes())?;
    writer.write_all(data)?;
    Ok(())
}

fn begin_command<W: Write>(
    writer: W,
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
    supports_encryption: bool,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone)]
    #[repr(C)]
    struct BeginParams {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        encrypted: u32,
    }
    let params = BeginParams {
        size,
        blocks,
        block_size,
        offset,
        encrypted: 0,
    };

    let bytes = bytes_of(&params);
    // The ESP8266 and ESP32 do not take the `encrypted` word.
    let data = if supports_encryption {
        bytes
    } else {
        &bytes[..bytes.len() - 4]
    };
    write_basic(writer, data, 0)
}

fn data_command<W: Write>(
    mut writer: W,
    block_data: &[u8],
    pad_to: usize,
    sequence: u32,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone)]
    #[repr(C)]
    struct BlockParams {
        size: u32,
        sequence: u32,
        dummy1: u32,
        dummy2: u32,
    }

    const PAD_BYTE: u8 = 0xFF;
    let pad_length = pad_to.saturating_sub(block_data.len());

    let params = BlockParams {
        size: (block_data.len() + pad_length) as u32,
        sequence,
        dummy1: 0,
        dummy2: 0,
    };

    let mut check = checksum(block_data, CHECKSUM_INIT);
    for _ in 0..pad_length {
        check = checksum(&[PAD_BYTE], check);
    }

    let total = size_of::<BlockParams>() + block_data.len() + pad_length;
    writer.write_all(&(total as u16).to_le_bytes())?;
    writer.write_all(&u32::from(check).to_le_bytes())?;
    writer.write_all(bytes_of(&params))?;
    writer.write_all(block_data)?;
    for _ in 0..pad_length {
        writer.write_all(&[PAD_BYTE])?;
    }
    Ok(())
}
