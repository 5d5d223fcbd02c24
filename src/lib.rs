//! A library for flashing micro-controllers over their serial bootloaders
//!
//! [mcuflash] implements the four bootloader protocols behind most hobbyist
//! and production boards on one contract:
//!
//! - **STK500 v1**: classical AVR (ATmega328P/168/8, Uno-style boards)
//! - **STK500 v2**: large AVR (ATmega1280/2560)
//! - **AVR109**: USB-CDC bootloaders (ATmega32U4, Leonardo/Micro),
//!   including the 1200-baud touch and device re-enumeration
//! - **Espressif ROM/stub loader**: ESP8266, ESP32, ESP32-S2, ESP32-C3,
//!   ESP32-S3
//!
//! The library owns no serial implementation: engines drive any device
//! behind the [Port](port::Port) capability. A native adapter over the
//! `serialport` crate ships behind the default `serialport` feature.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mcuflash::{upload, UploadRequest};
//! use mcuflash::port::native::NativePort;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = NativePort::open_path("/dev/ttyACM0", 115_200)?;
//!
//!     let mut request = UploadRequest::new("avr", "atmega328p");
//!     request.hex = Some(std::fs::read("firmware.hex")?);
//!
//!     let result = upload(Box::new(port), request)?;
//!     println!("flashed in {:?}", result.elapsed);
//!     Ok(())
//! }
//! ```
//!
//! [mcuflash]: https://crates.io/crates/mcuflash

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod avr109;
pub mod cpu;
pub mod error;
pub mod esp;
pub mod image;
pub mod logging;
pub mod port;
pub mod slip;
pub mod stk500v1;
pub mod stk500v2;
mod uploader;

pub use cpu::{CpuProfile, IspTiming, Protocol};
pub use error::{Error, ErrorKind, Result};
pub use esp::stub::StubFetcher;
pub use esp::{FlashFrequency, FlashMode, FlashOptions};
pub use image::{FirmwareImage, Segment};
pub use logging::{LogSink, Logger};
pub use port::{Port, ReconnectCallback, ReconnectParams};
pub use uploader::{is_supported, upload, UploadRequest, UploadResult, DEFAULT_BOOTLOADER_BAUD};
