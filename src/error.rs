//! Library errors
//!
//! Every failure surfaced by the engines carries a short human-readable
//! message plus a machine-readable [ErrorKind] so callers can decide whether
//! to retry, reconnect, or give up without string matching.

use std::io;

use miette::Diagnostic;
use strum::Display;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("failed to open serial port")]
    #[diagnostic(
        code(mcuflash::io_open),
        help("Make sure the device is connected and not held open by another process")
    )]
    IoOpen(#[source] io::Error),

    #[error("failed to close serial port")]
    #[diagnostic(code(mcuflash::io_close))]
    IoClose(#[source] io::Error),

    #[error("serial write failed")]
    #[diagnostic(code(mcuflash::io_write))]
    IoWrite(#[source] io::Error),

    #[error("serial read failed")]
    #[diagnostic(code(mcuflash::io_read))]
    IoRead(#[source] io::Error),

    #[error("timed out waiting for a reply to {0}")]
    #[diagnostic(
        code(mcuflash::receive_timeout),
        help("Check the wiring and that the target is actually in its bootloader")
    )]
    ReceiveTimeout(&'static str),

    #[error("reply to {0} overflowed the receive buffer")]
    #[diagnostic(code(mcuflash::framing_overflow))]
    FramingOverflow(&'static str),

    #[error("malformed reply to {context}: {detail}")]
    #[diagnostic(code(mcuflash::protocol_mismatch))]
    ProtocolMismatch {
        context: &'static str,
        detail: String,
    },

    #[error("programmer reported a checksum error on our request")]
    #[diagnostic(code(mcuflash::peer_checksum))]
    PeerChecksumError,

    #[error("device signature {found:02x?} does not match expected {expected:02x?}")]
    #[diagnostic(
        code(mcuflash::signature_mismatch),
        help("The connected board carries a different MCU than the one configured")
    )]
    SignatureMismatch { expected: Vec<u8>, found: Vec<u8> },

    #[error("bootloader does not list device code {0:#04x}")]
    #[diagnostic(code(mcuflash::unknown_device_code))]
    UnknownDeviceCode(u8),

    #[error("unsupported tool '{0}'")]
    #[diagnostic(code(mcuflash::unsupported_tool))]
    UnsupportedTool(String),

    #[error("no engine available for protocol '{0}'")]
    #[diagnostic(code(mcuflash::unsupported_protocol))]
    UnsupportedProtocol(String),

    #[error("unknown CPU '{0}'")]
    #[diagnostic(
        code(mcuflash::unknown_cpu),
        help("See CpuProfile::all() for the supported CPU identifiers")
    )]
    UnknownCpu(String),

    #[error("no firmware image: neither hex bytes nor segments were supplied")]
    #[diagnostic(code(mcuflash::missing_image))]
    MissingImage,

    #[error("invalid firmware image: {0}")]
    #[diagnostic(code(mcuflash::invalid_image))]
    InvalidImage(String),

    #[error("verification failed at address {address:#06x}")]
    #[diagnostic(
        code(mcuflash::verify_failed),
        help("The flash contents read back differently than what was written")
    )]
    VerifyFailed { address: u32 },

    #[error("could not synchronize with the ESP ROM bootloader")]
    #[diagnostic(
        code(mcuflash::esp_no_sync),
        help("Hold BOOT/IO0 while resetting if the board lacks auto-reset circuitry")
    )]
    EspNoSync,

    #[error("flasher stub failed: {0}")]
    #[diagnostic(code(mcuflash::esp_stub_failed))]
    EspStubFailed(String),

    #[error("ESP bootloader rejected {command}: error code {code:#04x}")]
    #[diagnostic(code(mcuflash::esp_rom_status))]
    RomStatus { command: &'static str, code: u8 },

    #[error("unrecognized chip magic value {0:#010x}")]
    #[diagnostic(code(mcuflash::chip_detect))]
    ChipDetect(u32),

    #[error("reconnect callback did not produce a port within the allowed time")]
    #[diagnostic(code(mcuflash::reconnect_timeout))]
    ReconnectTimeout,

    #[error("reconnect callback failed: {0}")]
    #[diagnostic(code(mcuflash::reconnect_rejected))]
    ReconnectRejected(String),

    #[error("operation cancelled")]
    #[diagnostic(code(mcuflash::cancelled))]
    Cancelled,
}

/// Machine-readable classification of an [Error].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorKind {
    IoOpen,
    IoClose,
    IoWrite,
    IoRead,
    ReceiveTimeout,
    FramingOverflow,
    ProtocolMismatch,
    PeerChecksumError,
    SignatureMismatch,
    UnknownDeviceCode,
    UnsupportedTool,
    UnsupportedProtocol,
    UnknownCpu,
    MissingImage,
    InvalidImage,
    VerifyFailed,
    EspNoSync,
    EspStubFailed,
    ReconnectTimeout,
    ReconnectRejected,
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::IoOpen(_) => ErrorKind::IoOpen,
            Error::IoClose(_) => ErrorKind::IoClose,
            Error::IoWrite(_) => ErrorKind::IoWrite,
            Error::IoRead(_) => ErrorKind::IoRead,
            Error::ReceiveTimeout(_) => ErrorKind::ReceiveTimeout,
            Error::FramingOverflow(_) => ErrorKind::FramingOverflow,
            Error::ProtocolMismatch { .. } => ErrorKind::ProtocolMismatch,
            Error::PeerChecksumError => ErrorKind::PeerChecksumError,
            Error::SignatureMismatch { .. } => ErrorKind::SignatureMismatch,
            Error::UnknownDeviceCode(_) => ErrorKind::UnknownDeviceCode,
            Error::UnsupportedTool(_) => ErrorKind::UnsupportedTool,
            Error::UnsupportedProtocol(_) => ErrorKind::UnsupportedProtocol,
            Error::UnknownCpu(_) => ErrorKind::UnknownCpu,
            Error::MissingImage => ErrorKind::MissingImage,
            Error::InvalidImage(_) => ErrorKind::InvalidImage,
            Error::VerifyFailed { .. } => ErrorKind::VerifyFailed,
            Error::EspNoSync => ErrorKind::EspNoSync,
            Error::EspStubFailed(_) => ErrorKind::EspStubFailed,
            // Status and detection failures are framing-level disagreements
            // with the peer as far as callers are concerned.
            Error::RomStatus { .. } => ErrorKind::ProtocolMismatch,
            Error::ChipDetect(_) => ErrorKind::ProtocolMismatch,
            Error::ReconnectTimeout => ErrorKind::ReconnectTimeout,
            Error::ReconnectRejected(_) => ErrorKind::ReconnectRejected,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// True when a sync loop is allowed to retry after this error.
    pub(crate) fn is_retryable_sync(&self) -> bool {
        matches!(self, Error::ReceiveTimeout(_))
    }

    pub(crate) fn mismatch(context: &'static str, detail: impl Into<String>) -> Self {
        Error::ProtocolMismatch {
            context,
            detail: detail.into(),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                Error::ReceiveTimeout("serial read")
            }
            io::ErrorKind::NotFound => Error::IoOpen(err),
            _ => Error::IoRead(err),
        }
    }
}

#[cfg(feature = "serialport")]
impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::Io(kind) => Error::from(io::Error::new(kind, err.description)),
            serialport::ErrorKind::NoDevice => {
                Error::IoOpen(io::Error::new(io::ErrorKind::NotFound, err.description))
            }
            _ => Error::IoOpen(io::Error::other(err.description)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timed_out_io_maps_to_receive_timeout() {
        let err = Error::from(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert_eq!(err.kind(), ErrorKind::ReceiveTimeout);
        assert!(err.is_retryable_sync());
    }

    #[test]
    fn kinds_render_snake_case() {
        assert_eq!(ErrorKind::SignatureMismatch.to_string(), "signature_mismatch");
        assert_eq!(ErrorKind::EspNoSync.to_string(), "esp_no_sync");
    }

    #[test]
    fn only_receive_timeout_retries_sync() {
        assert!(!Error::PeerChecksumError.is_retryable_sync());
        assert!(!Error::EspNoSync.is_retryable_sync());
        assert!(Error::ReceiveTimeout("sync").is_retryable_sync());
    }
}
