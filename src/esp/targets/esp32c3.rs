use crate::error::Result;
use crate::esp::connection::EspConnection;
use crate::esp::targets::{mac_from_words, EspTarget, SpiRegisters};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[
    0x6921_506F, // ECO1 + ECO2
    0x1B31_506F, // ECO3
];

const FLASH_SIZES: &[(&str, u8)] = &[
    ("1MB", 0x00),
    ("2MB", 0x10),
    ("4MB", 0x20),
    ("8MB", 0x30),
    ("16MB", 0x40),
];

/// ESP32-C3 target
pub struct Esp32c3;

impl Esp32c3 {
    fn chip_revision(&self, conn: &mut EspConnection) -> Result<u32> {
        // Major revision lives in word 22 bits 24..26; the minor revision
        // is split across word 22 bit 23 (high) and word 20 bits 18..21.
        let word22 = self.read_efuse(conn, 22)?;
        let word20 = self.read_efuse(conn, 20)?;
        let major = (word22 >> 24) & 0x03;
        let minor = ((word22 >> 23) & 0x01) << 3 | (word20 >> 18) & 0x07;
        Ok(major * 100 + minor)
    }
}

impl EspTarget for Esp32c3 {
    fn chip_name(&self) -> &'static str {
        "ESP32-C3"
    }

    fn magic_values(&self) -> &'static [u32] {
        CHIP_DETECT_MAGIC_VALUES
    }

    fn image_chip_id(&self) -> Option<u32> {
        Some(5)
    }

    fn spi_registers(&self) -> SpiRegisters {
        SpiRegisters {
            base: 0x6000_2000,
            usr_offset: 0x18,
            usr1_offset: 0x1C,
            usr2_offset: 0x20,
            w0_offset: 0x58,
            mosi_length_offset: Some(0x24),
            miso_length_offset: Some(0x28),
        }
    }

    fn uart_clkdiv_reg(&self) -> u32 {
        0x6000_0014
    }

    fn uart_date_reg(&self) -> u32 {
        0x6000_007C
    }

    fn bootloader_flash_offset(&self) -> u32 {
        0x0
    }

    fn flash_size_encodings(&self) -> &'static [(&'static str, u8)] {
        FLASH_SIZES
    }

    fn supports_encryption(&self) -> bool {
        true
    }

    fn efuse_reg(&self) -> u32 {
        0x6000_8800
    }

    fn read_mac(&self, conn: &mut EspConnection) -> Result<String> {
        let low = conn.read_reg(self.efuse_reg() + 0x44)?;
        let hi = conn.read_reg(self.efuse_reg() + 0x48)? & 0xFFFF;
        Ok(mac_from_words(hi, low))
    }

    fn chip_description(&self, conn: &mut EspConnection) -> Result<String> {
        let revision = self.chip_revision(conn)?;
        Ok(format!(
            "ESP32-C3 (revision v{}.{})",
            revision / 100,
            revision % 100
        ))
    }

    fn chip_features(&self, _conn: &mut EspConnection) -> Result<Vec<&'static str>> {
        Ok(vec!["Wi-Fi", "BLE"])
    }
}
