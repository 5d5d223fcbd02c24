use crate::error::Result;
use crate::esp::connection::EspConnection;
use crate::esp::targets::{format_mac, EspTarget, SpiRegisters};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0xFFF0_C101];

const FLASH_SECTOR_SIZE: u32 = 0x1000;
const FLASH_SECTORS_PER_BLOCK: u32 = 16;

const FLASH_SIZES: &[(&str, u8)] = &[
    ("512KB", 0x00),
    ("256KB", 0x10),
    ("1MB", 0x20),
    ("2MB", 0x30),
    ("4MB", 0x40),
    ("2MB-c1", 0x50),
    ("4MB-c1", 0x60),
    ("8MB", 0x80),
    ("16MB", 0x90),
];

/// ESP8266 target
pub struct Esp8266;

impl Esp8266 {
    fn is_8285(&self, conn: &mut EspConnection) -> Result<bool> {
        let word0 = self.read_efuse(conn, 0)?;
        let word2 = self.read_efuse(conn, 2)?;
        Ok(word0 & (1 << 4) != 0 || word2 & (1 << 16) != 0)
    }
}

impl EspTarget for Esp8266 {
    fn chip_name(&self) -> &'static str {
        "ESP8266"
    }

    fn magic_values(&self) -> &'static [u32] {
        CHIP_DETECT_MAGIC_VALUES
    }

    fn image_chip_id(&self) -> Option<u32> {
        None
    }

    fn spi_registers(&self) -> SpiRegisters {
        SpiRegisters {
            base: 0x6000_0200,
            usr_offset: 0x1C,
            usr1_offset: 0x20,
            usr2_offset: 0x24,
            w0_offset: 0x40,
            mosi_length_offset: None,
            miso_length_offset: None,
        }
    }

    fn uart_clkdiv_reg(&self) -> u32 {
        0x6000_0014
    }

    fn uart_date_reg(&self) -> u32 {
        0x6000_0078
    }

    fn xtal_clk_divider(&self) -> u32 {
        2
    }

    fn bootloader_flash_offset(&self) -> u32 {
        0x0
    }

    fn flash_size_encodings(&self) -> &'static [(&'static str, u8)] {
        FLASH_SIZES
    }

    fn efuse_reg(&self) -> u32 {
        0x3FF0_0050
    }

    fn read_mac(&self, conn: &mut EspConnection) -> Result<String> {
        let mac0 = self.read_efuse(conn, 0)?;
        let mac1 = self.read_efuse(conn, 1)?;
        let mac3 = self.read_efuse(conn, 3)?;

        // Older parts have no OUI fused in word 3 and use one of two
        // well-known Espressif prefixes instead.
        let oui = if mac3 != 0 {
            [(mac3 >> 16) as u8, (mac3 >> 8) as u8, mac3 as u8]
        } else if (mac1 >> 16) & 0xFF == 0 {
            [0x18, 0xFE, 0x34]
        } else {
            [0xAC, 0xD0, 0x74]
        };

        let bytes = [
            oui[0],
            oui[1],
            oui[2],
            (mac1 >> 8) as u8,
            mac1 as u8,
            (mac0 >> 24) as u8,
        ];
        Ok(format_mac(&bytes))
    }

    fn chip_description(&self, conn: &mut EspConnection) -> Result<String> {
        Ok(if self.is_8285(conn)? {
            "ESP8285".to_string()
        } else {
            "ESP8266EX".to_string()
        })
    }

    fn chip_features(&self, conn: &mut EspConnection) -> Result<Vec<&'static str>> {
        let mut features = vec!["Wi-Fi"];
        if self.is_8285(conn)? {
            features.push("Embedded Flash");
        }
        Ok(features)
    }

    /// The ROM loader erases in 64 KiB blocks but skips the head sectors of
    /// the first block, so the size passed to FLASH_BEGIN must compensate.
    fn erase_size(&self, offset: u32, size: u32) -> u32 {
        let sector_count = size.div_ceil(FLASH_SECTOR_SIZE);
        let start_sector = offset / FLASH_SECTOR_SIZE;

        let head_sectors = u32::min(
            FLASH_SECTORS_PER_BLOCK - (start_sector % FLASH_SECTORS_PER_BLOCK),
            sector_count,
        );

        if sector_count < 2 * head_sectors {
            sector_count.div_ceil(2) * FLASH_SECTOR_SIZE
        } else {
            (sector_count - head_sectors) * FLASH_SECTOR_SIZE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erase_size_compensates_for_the_rom_quirk() {
        // A full 64 KiB starting on a block boundary loses its head
        // sectors' worth of rounding.
        assert_eq!(Esp8266.erase_size(0x0, 0x1000), 0x1000);
        assert_eq!(Esp8266.erase_size(0x0, 0x10000), 0x8000);
        // Off-boundary starts keep more of the tail.
        assert_eq!(Esp8266.erase_size(0xF000, 0x10000), 0xF000);
    }
}
