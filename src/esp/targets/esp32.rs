use crate::error::Result;
use crate::esp::connection::EspConnection;
use crate::esp::targets::{mac_from_words, EspTarget, SpiRegisters};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x00F0_1D83];

const FLASH_SIZES: &[(&str, u8)] = &[
    ("1MB", 0x00),
    ("2MB", 0x10),
    ("4MB", 0x20),
    ("8MB", 0x30),
    ("16MB", 0x40),
];

/// ESP32 target
pub struct Esp32;

impl Esp32 {
    fn package_version(&self, conn: &mut EspConnection) -> Result<u32> {
        let word3 = self.read_efuse(conn, 3)?;
        Ok((word3 >> 9) & 0x07)
    }

    fn chip_revision(&self, conn: &mut EspConnection) -> Result<u32> {
        let rev1 = self.read_efuse(conn, 3)? >> 15 & 1 != 0;
        let rev2 = self.read_efuse(conn, 5)? >> 20 & 1 != 0;
        Ok(match (rev1, rev2) {
            (true, true) => 3,
            (true, false) => 1,
            _ => 0,
        })
    }
}

impl EspTarget for Esp32 {
    fn chip_name(&self) -> &'static str {
        "ESP32"
    }

    fn magic_values(&self) -> &'static [u32] {
        CHIP_DETECT_MAGIC_VALUES
    }

    fn image_chip_id(&self) -> Option<u32> {
        Some(0)
    }

    fn spi_registers(&self) -> SpiRegisters {
        SpiRegisters {
            base: 0x3FF4_2000,
            usr_offset: 0x1C,
            usr1_offset: 0x20,
            usr2_offset: 0x24,
            w0_offset: 0x80,
            mosi_length_offset: Some(0x28),
            miso_length_offset: Some(0x2C),
        }
    }

    fn uart_clkdiv_reg(&self) -> u32 {
        0x3FF4_0014
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

    fn efuse_reg(&self) -> u32 {
        0x3FF5_A000
    }

    fn read_mac(&self, conn: &mut EspConnection) -> Result<String> {
        let low = self.read_efuse(conn, 1)?;
        let hi = self.read_efuse(conn, 2)?;
        Ok(mac_from_words(hi, low))
    }

    fn chip_description(&self, conn: &mut EspConnection) -> Result<String> {
        let word3 = self.read_efuse(conn, 3)?;
        let single_core = word3 & 1 != 0;

        let name = match self.package_version(conn)? {
            0 if single_core => "ESP32-S0WDQ6",
            0 => "ESP32-D0WDQ6",
            1 if single_core => "ESP32-S0WD",
            1 => "ESP32-D0WD",
            2 => "ESP32-D2WD",
            4 => "ESP32-U4WDH",
            5 => "ESP32-PICO-D4",
            6 => "ESP32-PICO-V3-02",
            _ => "ESP32",
        };
        let revision = self.chip_revision(conn)?;
        Ok(format!("{name} (revision {revision})"))
    }

    fn chip_features(&self, conn: &mut EspConnection) -> Result<Vec<&'static str>> {
        let word3 = self.read_efuse(conn, 3)?;
        let mut features = vec!["Wi-Fi"];

        if word3 & (1 << 1) == 0 {
            features.push("BT");
        }
        if word3 & 1 == 0 {
            features.push("Dual Core");
        } else {
            features.push("Single Core");
        }
        if matches!(self.package_version(conn)?, 2 | 5 | 6) {
            features.push("Embedded Flash");
        }
        let word4 = self.read_efuse(conn, 4)?;
        if (word4 >> 13) & 1 != 0 {
            features.push("VRef calibration in efuse");
        }
        Ok(features)
    }
}
