//! Upload dispatcher
//!
//! Owns the lifecycle around a single upload: validate the request, decode
//! the firmware image, pick the engine from the tool + CPU pair, bracket
//! the engine run with the baud-rate transitions, and hand back the
//! (possibly replaced) port together with the elapsed time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;

use crate::avr109::Avr109;
use crate::cpu::{CpuProfile, Protocol};
use crate::error::{Error, Result};
use crate::esp::connection::DEFAULT_CONNECT_ATTEMPTS;
use crate::esp::stub::{fetch_stub, StubFetcher, DEFAULT_STUB_BASE_URL};
use crate::esp::targets::Chip;
use crate::esp::{EspLoader, FlashOptions};
use crate::image::{FirmwareImage, Segment};
use crate::logging::{LogSink, Logger};
use crate::port::{Port, ReconnectCallback};
use crate::stk500v1::Stk500v1;
use crate::stk500v2::Stk500v2;

pub const DEFAULT_BOOTLOADER_BAUD: u32 = 115_200;

/// Everything one upload needs. Created by the caller, consumed once.
pub struct UploadRequest {
    /// Tool identifier: "avr"/"avrdude" or "esptool"/"esptool_py".
    pub tool: String,
    /// CPU identifier from the catalog, e.g. "atmega328p" or "esp32".
    pub cpu: String,
    /// Intel-HEX image text.
    pub hex: Option<Vec<u8>>,
    /// Pre-addressed binary segments (the normal ESP input; for AVR tools
    /// the first segment's bytes are used).
    pub segments: Vec<Segment>,
    /// Baud rate the bootloader listens at.
    pub bootloader_baud: u32,
    /// Faster session rate where the protocol supports switching
    /// (AVR109 reconnect baud, ESP stub baud change).
    pub upload_baud: Option<u32>,
    /// ESP flash write options; AVR engines ignore these.
    pub flash: FlashOptions,
    /// Upload the RAM flasher stub before writing (ESP only; requires
    /// `stub_fetcher`).
    pub use_stub: bool,
    pub stub_base_url: Option<String>,
    pub stub_fetcher: Option<Arc<dyn StubFetcher>>,
    pub verbose: bool,
    pub log: Option<Arc<LogSink>>,
    pub reconnect: Option<ReconnectCallback>,
}

impl UploadRequest {
    pub fn new(tool: impl Into<String>, cpu: impl Into<String>) -> Self {
        UploadRequest {
            tool: tool.into(),
            cpu: cpu.into(),
            hex: None,
            segments: Vec::new(),
            bootloader_baud: DEFAULT_BOOTLOADER_BAUD,
            upload_baud: None,
            flash: FlashOptions {
                compress: true,
                ..FlashOptions::default()
            },
            use_stub: true,
            stub_base_url: None,
            stub_fetcher: None,
            verbose: false,
            log: None,
            reconnect: None,
        }
    }
}

pub struct UploadResult {
    /// The port after the upload. May differ from the input: the AVR109
    /// reconnect hands back a fresh port. Configured to the baud rate the
    /// input port had at entry.
    pub port: Box<dyn Port>,
    pub elapsed: Duration,
}

/// True when a `tool` + `cpu` pair routes to an engine. Pure.
pub fn is_supported(tool: &str, cpu: &str) -> bool {
    resolve(tool, cpu).is_ok()
}

fn resolve(tool: &str, cpu: &str) -> Result<&'static CpuProfile> {
    let profile = match tool {
        "avr" | "avrdude" => {
            let profile =
                CpuProfile::find(cpu).ok_or_else(|| Error::UnknownCpu(cpu.to_string()))?;
            if profile.protocol == Protocol::Esp {
                return Err(Error::UnsupportedProtocol(format!(
                    "{cpu} is not an AVR target"
                )));
            }
            profile
        }
        "esptool" | "esptool_py" => {
            let profile =
                CpuProfile::find(cpu).ok_or_else(|| Error::UnknownCpu(cpu.to_string()))?;
            if profile.protocol != Protocol::Esp {
                return Err(Error::UnsupportedProtocol(format!(
                    "{cpu} is not an Espressif target"
                )));
            }
            profile
        }
        other => return Err(Error::UnsupportedTool(other.to_string())),
    };
    Ok(profile)
}

/// Transfer the request's firmware image into the target behind `port`.
///
/// On success the returned port is at the baud rate the input port had at
/// entry (the replacement port, should the engine have swapped it, is
/// configured likewise). On failure the port is dropped, and therefore
/// closed.
pub fn upload(mut port: Box<dyn Port>, request: UploadRequest) -> Result<UploadResult> {
    let started = Instant::now();

    if request.hex.is_none() && request.segments.is_empty() {
        return Err(Error::MissingImage);
    }
    let profile = resolve(&request.tool, &request.cpu)?;

    let original_baud = port.baud_rate();
    if !port.is_open() {
        port.open()?;
    }
    if port.baud_rate() != request.bootloader_baud {
        port.set_baud_rate(request.bootloader_baud)?;
    }

    let image = decode_image(&request)?;
    let logger = Logger::new(request.log.clone(), request.verbose);
    debug!(
        "dispatching {} bytes to {} via {}",
        image.bytes.len(),
        profile.name,
        profile.protocol
    );

    let mut port = match profile.protocol {
        Protocol::Stk500v1 => {
            let mut engine = Stk500v1::new(port, profile, logger);
            let outcome = engine.bootload(&image);
            let port = engine.into_port();
            outcome.map(|()| port)?
        }
        Protocol::Stk500v2 => {
            let mut engine = Stk500v2::new(port, profile, logger);
            let outcome = engine.bootload(&image);
            let port = engine.into_port();
            outcome.map(|()| port)?
        }
        Protocol::Avr109 => {
            let mut engine = Avr109::new(
                port,
                profile,
                logger,
                request.reconnect.clone(),
                request.upload_baud,
            );
            let outcome = engine.bootload(&image);
            let port = engine.into_port();
            outcome.map(|()| port)?
        }
        Protocol::Esp => run_esp(port, &request, &image, logger)?,
    };

    if port.baud_rate() != original_baud {
        port.set_baud_rate(original_baud)?;
    }

    Ok(UploadResult {
        port,
        elapsed: started.elapsed(),
    })
}

fn decode_image(request: &UploadRequest) -> Result<FirmwareImage> {
    match &request.hex {
        Some(hex) => {
            let text = std::str::from_utf8(hex)
                .map_err(|_| Error::InvalidImage("hex file is not valid UTF-8".into()))?;
            FirmwareImage::from_ihex(text)
        }
        None => FirmwareImage::from_segments(request.segments.clone()),
    }
}

fn run_esp(
    port: Box<dyn Port>,
    request: &UploadRequest,
    image: &FirmwareImage,
    logger: Logger,
) -> Result<Box<dyn Port>> {
    let mut loader = EspLoader::connect(port, logger.clone(), DEFAULT_CONNECT_ATTEMPTS)?;

    if let Some(expected) = Chip::from_cpu(&request.cpu) {
        if expected != loader.chip() {
            logger.write_line(&format!(
                "note: configured for {expected} but detected {}",
                loader.chip()
            ));
        }
    }

    if request.use_stub {
        if let Some(fetcher) = &request.stub_fetcher {
            let base = request
                .stub_base_url
                .as_deref()
                .unwrap_or(DEFAULT_STUB_BASE_URL);
            let stub = fetch_stub(
                loader.chip().target().chip_name(),
                base,
                fetcher.as_ref(),
            )?;
            loader.run_stub(&stub)?;
        } else {
            debug!("no stub fetcher supplied, continuing with the ROM loader");
        }
    }

    if let Some(upload_baud) = request.upload_baud {
        if upload_baud != request.bootloader_baud {
            loader.change_baudrate(upload_baud)?;
        }
    }

    let files: Vec<Segment> = if image.segments.is_empty() {
        vec![Segment::new(0, image.bytes.clone())]
    } else {
        image.segments.clone()
    };
    loader.write_flash(&files, &request.flash)?;
    loader.reboot()?;

    Ok(loader.into_port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::port::mock::MockPort;

    #[test]
    fn is_supported_routes_the_catalog() {
        assert!(is_supported("avr", "atmega328p"));
        assert!(is_supported("avrdude", "atmega2560"));
        assert!(is_supported("avr", "atmega32u4"));
        assert!(is_supported("esptool", "esp32"));
        assert!(is_supported("esptool_py", "esp8266"));

        assert!(!is_supported("avr", "atmega420"));
        assert!(!is_supported("avr", "esp32"));
        assert!(!is_supported("esptool", "atmega328p"));
        assert!(!is_supported("openocd", "atmega328p"));
    }

    #[test]
    fn is_supported_is_idempotent() {
        for _ in 0..3 {
            assert!(is_supported("avr", "atmega328p"));
            assert!(!is_supported("avr", "atmega420"));
        }
    }

    #[test]
    fn unknown_cpu_fails_before_touching_the_port() {
        let port = MockPort::new();
        let state = port.state_handle();

        let mut request = UploadRequest::new("avr", "atmega420");
        request.segments = vec![Segment::new(0, vec![0u8; 16])];
        let err = match upload(Box::new(port), request) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.kind(), ErrorKind::UnknownCpu);

        let state = state.lock().unwrap();
        assert!(state.written.is_empty());
        assert!(state.signals.is_empty());
        assert!(state.baud_history.is_empty());
    }

    #[test]
    fn unknown_tool_is_rejected() {
        let mut request = UploadRequest::new("openocd", "atmega328p");
        request.segments = vec![Segment::new(0, vec![0u8; 16])];
        let err = match upload(Box::new(MockPort::new()), request) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.kind(), ErrorKind::UnsupportedTool);
    }

    #[test]
    fn missing_image_is_rejected_first() {
        let request = UploadRequest::new("avr", "atmega328p");
        let err = match upload(Box::new(MockPort::new()), request) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.kind(), ErrorKind::MissingImage);
    }

    #[test]
    fn upload_drives_the_stk500v1_engine_end_to_end() {
        let image: Vec<u8> = (0..1024u32).map(|i| (i * 7) as u8).collect();

        let mut port = MockPort::new();
        crate::stk500v1::tests::script_upload(&mut port, &image);

        let mut request = UploadRequest::new("avr", "atmega328p");
        request.segments = vec![Segment::new(0, image)];
        request.bootloader_baud = 115_200;

        let result = upload(Box::new(port), request).unwrap();
        // Eight pages at a 4 ms pause each puts a floor on the elapsed time.
        assert!(result.elapsed >= Duration::from_millis(32));
        assert_eq!(result.port.baud_rate(), 115_200);
    }

    #[test]
    fn upload_restores_the_entry_baud_rate() {
        let image: Vec<u8> = (0..1024u32).map(|i| (i * 7) as u8).collect();

        let mut port = MockPort::new();
        port.baud = 9_600;
        crate::stk500v1::tests::script_upload(&mut port, &image);
        let state = port.state_handle();

        let mut request = UploadRequest::new("avr", "atmega328p");
        request.segments = vec![Segment::new(0, image)];
        request.bootloader_baud = 115_200;

        let result = upload(Box::new(port), request).unwrap();
        assert_eq!(result.port.baud_rate(), 9_600);
        let history = &state.lock().unwrap().baud_history;
        assert_eq!(history.as_slice(), &[115_200, 9_600]);
    }
}
