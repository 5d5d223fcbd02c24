//! CPU catalog
//!
//! A pure table mapping a CPU identifier to the protocol engine that can
//! program it, its flash geometry, the signature it must report, and the
//! ISP timing constants the STK500 v2 bootloader wants echoed back at it.

use strum::{Display, EnumString};

/// Which engine speaks to a given CPU's bootloader.
#[derive(Debug, Display, EnumString, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum Protocol {
    Stk500v1,
    Stk500v2,
    Avr109,
    Esp,
}

/// ISP timing block sent in `CMD_ENTER_PROGMODE_ISP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IspTiming {
    /// Command timeout in seconds (wire units).
    pub timeout: u8,
    pub stab_delay: u8,
    pub cmd_exe_delay: u8,
    pub synch_loops: u8,
    pub byte_delay: u8,
    pub poll_value: u8,
    pub poll_index: u8,
}

impl IspTiming {
    pub const fn default_isp() -> Self {
        IspTiming {
            timeout: 0xC8,
            stab_delay: 0x64,
            cmd_exe_delay: 0x19,
            synch_loops: 0x20,
            byte_delay: 0x00,
            poll_value: 0x53,
            poll_index: 0x03,
        }
    }
}

/// One catalog row.
#[derive(Debug, Clone, Copy)]
pub struct CpuProfile {
    pub name: &'static str,
    pub protocol: Protocol,
    /// Three-byte device signature (AVR); empty for ESP chips, whose
    /// identity comes from the chip-detect magic register instead.
    pub signature: &'static [u8],
    /// Flash page size in bytes.
    pub page_size: usize,
    pub num_pages: usize,
    /// AVR109 device code used with `SELECT_DEVICE_TYPE`; zero when the
    /// protocol has no such concept.
    pub device_code: u8,
    pub timing: IspTiming,
}

const AVR_DEFAULT: IspTiming = IspTiming::default_isp();

pub const CPU_PROFILES: &[CpuProfile] = &[
    CpuProfile {
        name: "atmega8",
        protocol: Protocol::Stk500v1,
        signature: &[0x1E, 0x93, 0x07],
        page_size: 64,
        num_pages: 128,
        device_code: 0,
        timing: AVR_DEFAULT,
    },
    CpuProfile {
        name: "atmega168",
        protocol: Protocol::Stk500v1,
        signature: &[0x1E, 0x94, 0x06],
        page_size: 128,
        num_pages: 128,
        device_code: 0,
        timing: AVR_DEFAULT,
    },
    CpuProfile {
        name: "atmega328p",
        protocol: Protocol::Stk500v1,
        signature: &[0x1E, 0x95, 0x0F],
        page_size: 128,
        num_pages: 256,
        device_code: 0,
        timing: AVR_DEFAULT,
    },
    CpuProfile {
        name: "atmega1280",
        protocol: Protocol::Stk500v2,
        signature: &[0x1E, 0x97, 0x03],
        page_size: 256,
        num_pages: 512,
        device_code: 0,
        timing: AVR_DEFAULT,
    },
    CpuProfile {
        name: "atmega2560",
        protocol: Protocol::Stk500v2,
        signature: &[0x1E, 0x98, 0x01],
        page_size: 256,
        num_pages: 1024,
        device_code: 0,
        timing: AVR_DEFAULT,
    },
    CpuProfile {
        name: "atmega32u4",
        protocol: Protocol::Avr109,
        signature: &[0x1E, 0x95, 0x87],
        page_size: 128,
        num_pages: 256,
        device_code: 0x44,
        timing: AVR_DEFAULT,
    },
    CpuProfile {
        name: "esp8266",
        protocol: Protocol::Esp,
        signature: &[],
        page_size: 0x400,
        num_pages: 0,
        device_code: 0,
        timing: AVR_DEFAULT,
    },
    CpuProfile {
        name: "esp32",
        protocol: Protocol::Esp,
        signature: &[],
        page_size: 0x400,
        num_pages: 0,
        device_code: 0,
        timing: AVR_DEFAULT,
    },
    CpuProfile {
        name: "esp32s2",
        protocol: Protocol::Esp,
        signature: &[],
        page_size: 0x400,
        num_pages: 0,
        device_code: 0,
        timing: AVR_DEFAULT,
    },
    CpuProfile {
        name: "esp32c3",
        protocol: Protocol::Esp,
        signature: &[],
        page_size: 0x400,
        num_pages: 0,
        device_code: 0,
        timing: AVR_DEFAULT,
    },
    CpuProfile {
        name: "esp32s3",
        protocol: Protocol::Esp,
        signature: &[],
        page_size: 0x400,
        num_pages: 0,
        device_code: 0,
        timing: AVR_DEFAULT,
    },
];

impl CpuProfile {
    /// Pure lookup by CPU identifier (case-insensitive).
    pub fn find(name: &str) -> Option<&'static CpuProfile> {
        CPU_PROFILES
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn all() -> impl Iterator<Item = &'static CpuProfile> {
        CPU_PROFILES.iter()
    }
}

/// Split an image into the page slices both STK500 engines put on the wire.
///
/// Mirrors the historical slicing exactly: an image longer than one page is
/// cut into page-sized slices with the last clamped to the image length,
/// while an image that fits in a single page is sent without its final byte.
/// Verification reads compare against the same slices, so the round-trip
/// law holds either way.
pub(crate) fn page_slices(image: &[u8], page_size: usize) -> Vec<(usize, &[u8])> {
    let mut slices = Vec::new();
    let mut addr = 0;

    while addr < image.len() {
        let end = if image.len() > page_size {
            usize::min(addr + page_size, image.len())
        } else {
            image.len() - 1
        };
        if end <= addr {
            break;
        }
        slices.push((addr, &image[addr..end]));
        addr += page_size;
    }

    slices
}
