use crate::error::Result;
use crate::esp::connection::EspConnection;
use crate::esp::targets::{mac_from_words, EspTarget, SpiRegisters};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x0000_07C6];

const FLASH_SIZES: &[(&str, u8)] = &[
    ("1MB", 0x00),
    ("2MB", 0x10),
    ("4MB", 0x20),
    ("8MB", 0x30),
    ("16MB", 0x40),
];

/// ESP32-S2 target
pub struct Esp32s2;

impl Esp32s2 {
    fn package_version(&self, conn: &mut EspConnection) -> Result<u32> {
        let word3 = self.read_efuse(conn, 3)?;
        Ok((word3 >> 21) & 0x0F)
    }
}

impl EspTarget for Esp32s2 {
    fn chip_name(&self) -> &'static str {
        "ESP32-S2"
    }

    fn magic_values(&self) -> &'static [u32] {
        CHIP_DETECT_MAGIC_VALUES
    }

    fn image_chip_id(&self) -> Option<u32> {
        Some(2)
    }

    fn spi_registers(&self) -> SpiRegisters {
        SpiRegisters {
            base: 0x3F40_2000,
            usr_offset: 0x18,
            usr1_offset: 0x1C,
            usr2_offset: 0x20,
            w0_offset: 0x58,
            mosi_length_offset: Some(0x24),
            miso_length_offset: Some(0x28),
        }
    }

    fn uart_clkdiv_reg(&self) -> u32 {
        0x3F40_0014
    }

    fn uart_date_reg(&self) -> u32 {
        0x6000_0078
    }

    fn bootloader_flash_offset(&self) -> u32 {
        0x1000
    }

    fn flash_size_encodings(&self) -> &'static [(&'static str, u8)] {
        FLASH_SIZES
    }

    fn supports_encryption(&self) -> bool {
        true
    }

    fn efuse_reg(&self) -> u32 {
        0x3F41_A000
    }

    fn read_mac(&self, conn: &mut EspConnection) -> Result<String> {
        let low = conn.read_reg(self.efuse_reg() + 0x44)?;
        let hi = conn.read_reg(self.efuse_reg() + 0x48)? & 0xFFFF;
        Ok(mac_from_words(hi, low))
    }

    fn chip_description(&self, conn: &mut EspConnection) -> Result<String> {
        Ok(match self.package_version(conn)? {
            0 => "ESP32-S2".to_string(),
            1 => "ESP32-S2FH16".to_string(),
            2 => "ESP32-S2FH32".to_string(),
            other => format!("ESP32-S2 (pkg {other})"),
        })
    }

    fn chip_features(&self, conn: &mut EspConnection) -> Result<Vec<&'static str>> {
        let mut features = vec!["Wi-Fi"];
        if matches!(self.package_version(conn)?, 1 | 2) {
            features.push("Embedded Flash");
        }
        Ok(features)
    }
}
