use crate::error::Result;
use crate::esp::connection::EspConnection;
use crate::esp::targets::{mac_from_words, EspTarget, SpiRegisters};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x0000_0009];

const FLASH_SIZES: &[(&str, u8)] = &[
    ("1MB", 0x00),
    ("2MB", 0x10),
    ("4MB", 0x20),
    ("8MB", 0x30),
    ("16MB", 0x40),
];

/// ESP32-S3 target
pub struct Esp32s3;

impl EspTarget for Esp32s3 {
    fn chip_name(&self) -> &'static str {
        "ESP32-S3"
    }

    fn magic_values(&self) -> &'static [u32] {
        CHIP_DETECT_MAGIC_VALUES
    }

    fn image_chip_id(&self) -> Option<u32> {
        Some(9)
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
        0x6000_0080
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
        0x6000_7000
    }

    fn read_mac(&self, conn: &mut EspConnection) -> Result<String> {
        let low = conn.read_reg(self.efuse_reg() + 0x44)?;
        let hi = conn.read_reg(self.efuse_reg() + 0x48)? & 0xFFFF;
        Ok(mac_from_words(hi, low))
    }

    fn chip_description(&self, _conn: &mut EspConnection) -> Result<String> {
        Ok("ESP32-S3".to_string())
    }

    fn chip_features(&self, _conn: &mut EspConnection) -> Result<Vec<&'static str>> {
        Ok(vec!["Wi-Fi", "BLE"])
    }
}
