//! Espressif target descriptors
//!
//! One static descriptor per supported chip: detection magic, SPI and UART
//! register geometry, flash layout constants, and the eFuse-derived
//! capability reads (MAC address, chip description, features, crystal
//! frequency).

use log::warn;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

use crate::error::{Error, Result};
use crate::esp::connection::EspConnection;

mod esp32;
mod esp32c3;
mod esp32s2;
mod esp32s3;
mod esp8266;

pub use esp32::Esp32;
pub use esp32c3::Esp32c3;
pub use esp32s2::Esp32s2;
pub use esp32s3::Esp32s3;
pub use esp8266::Esp8266;

/// Register read of this address returns the chip-detect magic value.
pub const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;

/// The UART clock-divider register masks to 20 bits.
const UART_CLKDIV_MASK: u32 = 0xF_FFFF;

/// All supported devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString)]
#[non_exhaustive]
pub enum Chip {
    #[strum(serialize = "esp8266", to_string = "ESP8266")]
    Esp8266,
    #[strum(serialize = "esp32", to_string = "ESP32")]
    Esp32,
    #[strum(serialize = "esp32s2", to_string = "ESP32-S2")]
    Esp32s2,
    #[strum(serialize = "esp32c3", to_string = "ESP32-C3")]
    Esp32c3,
    #[strum(serialize = "esp32s3", to_string = "ESP32-S3")]
    Esp32s3,
}

impl Chip {
    /// Select the unique chip whose detect magic matches.
    pub fn from_magic(magic: u32) -> Result<Self> {
        Chip::iter()
            .find(|chip| chip.target().magic_values().contains(&magic))
            .ok_or(Error::ChipDetect(magic))
    }

    /// Map a catalog CPU identifier ("esp32c3") to a chip.
    pub fn from_cpu(cpu: &str) -> Option<Self> {
        let normalized = cpu.to_ascii_lowercase().replace('-', "");
        Chip::iter().find(|chip| {
            chip.target().chip_name().to_ascii_lowercase().replace('-', "") == normalized
        })
    }

    pub fn target(&self) -> &'static dyn EspTarget {
        match self {
            Chip::Esp8266 => &Esp8266,
            Chip::Esp32 => &Esp32,
            Chip::Esp32s2 => &Esp32s2,
            Chip::Esp32c3 => &Esp32c3,
            Chip::Esp32s3 => &Esp32s3,
        }
    }
}

/// SPI controller register addresses for one chip.
#[derive(Debug, Clone, Copy)]
pub struct SpiRegisters {
    pub base: u32,
    pub usr_offset: u32,
    pub usr1_offset: u32,
    pub usr2_offset: u32,
    pub w0_offset: u32,
    pub mosi_length_offset: Option<u32>,
    pub miso_length_offset: Option<u32>,
}

impl SpiRegisters {
    pub fn cmd(&self) -> u32 {
        self.base
    }

    pub fn usr(&self) -> u32 {
        self.base + self.usr_offset
    }

    pub fn usr1(&self) -> u32 {
        self.base + self.usr1_offset
    }

    pub fn usr2(&self) -> u32 {
        self.base + self.usr2_offset
    }

    pub fn w0(&self) -> u32 {
        self.base + self.w0_offset
    }

    pub fn mosi_length(&self) -> Option<u32> {
        self.mosi_length_offset.map(|offset| self.base + offset)
    }

    pub fn miso_length(&self) -> Option<u32> {
        self.miso_length_offset.map(|offset| self.base + offset)
    }
}

/// Static capability record plus eFuse-derived reads for one chip.
pub trait EspTarget: Sync {
    fn chip_name(&self) -> &'static str;

    fn magic_values(&self) -> &'static [u32];

    /// Chip id embedded in application image headers; the ESP8266 predates
    /// the field.
    fn image_chip_id(&self) -> Option<u32>;

    fn spi_registers(&self) -> SpiRegisters;

    fn uart_clkdiv_reg(&self) -> u32;

    fn uart_date_reg(&self) -> u32;

    /// Divider between the UART clock source and the crystal.
    fn xtal_clk_divider(&self) -> u32 {
        1
    }

    /// Where the second-stage bootloader lives in flash.
    fn bootloader_flash_offset(&self) -> u32;

    /// Image-header encodings of the supported flash sizes.
    fn flash_size_encodings(&self) -> &'static [(&'static str, u8)];

    /// Whether the `*_BEGIN` commands take the trailing `encrypted` word.
    fn supports_encryption(&self) -> bool {
        false
    }

    fn efuse_reg(&self) -> u32;

    /// Read the nth word of the eFuse block.
    fn read_efuse(&self, conn: &mut EspConnection, n: u32) -> Result<u32> {
        conn.read_reg(self.efuse_reg() + n * 4)
    }

    /// Factory MAC address as colon-separated hex.
    fn read_mac(&self, conn: &mut EspConnection) -> Result<String>;

    /// Human-readable chip variant, e.g. "ESP32-D0WD (revision 1)".
    fn chip_description(&self, conn: &mut EspConnection) -> Result<String>;

    fn chip_features(&self, conn: &mut EspConnection) -> Result<Vec<&'static str>>;

    /// Crystal frequency in MHz, estimated from the UART clock divider at
    /// the current baud rate and normalized to the 40/26 MHz parts.
    fn crystal_freq(&self, conn: &mut EspConnection) -> Result<u32> {
        let divider = conn.read_reg(self.uart_clkdiv_reg())? & UART_CLKDIV_MASK;
        let estimated = f64::from(conn.baud_rate()) * f64::from(divider)
            / 1e6
            / f64::from(self.xtal_clk_divider());
        let normalized = if estimated > 33.0 { 40 } else { 26 };
        if (estimated - f64::from(normalized)).abs() > 1.0 {
            warn!(
                "crystal frequency estimate {estimated:.1} MHz deviates from {normalized} MHz; \
                 the detected baud rate may be wrong"
            );
        }
        Ok(normalized)
    }

    /// Size actually erased by a write of `size` bytes at `offset`. The
    /// stub erases exactly what it is told; only the ESP8266 ROM rounds.
    fn erase_size(&self, _offset: u32, size: u32) -> u32 {
        size
    }
}

/// Six MAC bytes out of the two eFuse words that store them: `hi` carries
/// the OUI half in its low 16 bits, `low` the device half.
pub(crate) fn mac_from_words(hi: u32, low: u32) -> String {
    let bytes = [
        (hi >> 8) as u8,
        hi as u8,
        (low >> 24) as u8,
        (low >> 16) as u8,
        (low >> 8) as u8,
        low as u8,
    ];
    format_mac(&bytes)
}

pub(crate) fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_values_select_a_unique_chip() {
        assert_eq!(Chip::from_magic(0x00F0_1D83).unwrap(), Chip::Esp32);
        assert_eq!(Chip::from_magic(0xFFF0_C101).unwrap(), Chip::Esp8266);
        assert_eq!(Chip::from_magic(0x0000_07C6).unwrap(), Chip::Esp32s2);
        assert_eq!(Chip::from_magic(0x6921_506F).unwrap(), Chip::Esp32c3);
        assert_eq!(Chip::from_magic(0x1B31_506F).unwrap(), Chip::Esp32c3);
        assert_eq!(Chip::from_magic(0x0000_0009).unwrap(), Chip::Esp32s3);
        assert!(Chip::from_magic(0xDEAD_BEEF).is_err());
    }

    #[test]
    fn no_two_chips_share_a_magic_value() {
        let mut seen = Vec::new();
        for chip in Chip::iter() {
            for &magic in chip.target().magic_values() {
                assert!(!seen.contains(&magic), "{magic:#010x} listed twice");
                seen.push(magic);
            }
        }
    }

    #[test]
    fn cpu_identifiers_resolve() {
        assert_eq!(Chip::from_cpu("esp8266"), Some(Chip::Esp8266));
        assert_eq!(Chip::from_cpu("esp32s2"), Some(Chip::Esp32s2));
        assert_eq!(Chip::from_cpu("ESP32-C3"), Some(Chip::Esp32c3));
        assert_eq!(Chip::from_cpu("esp9000"), None);
    }

    #[test]
    fn bootloader_offsets_follow_the_family_split() {
        assert_eq!(Chip::Esp8266.target().bootloader_flash_offset(), 0x0);
        assert_eq!(Chip::Esp32.target().bootloader_flash_offset(), 0x1000);
        assert_eq!(Chip::Esp32s2.target().bootloader_flash_offset(), 0x1000);
        assert_eq!(Chip::Esp32c3.target().bootloader_flash_offset(), 0x0);
        assert_eq!(Chip::Esp32s3.target().bootloader_flash_offset(), 0x0);
    }

    #[test]
    fn mac_words_format_as_colon_hex() {
        assert_eq!(
            mac_from_words(0x0000_24D7, 0xEB10_8834),
            "24:d7:eb:10:88:34"
        );
    }
}
