//! SLIP framing (RFC 1055)
//!
//! The ESP serial protocol wraps every packet in SLIP: frames are delimited
//! by END bytes, with END and ESC occurrences inside the payload escaped.

use std::io::{self, Read};

use crate::error::{Error, Result};

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

/// Upper bound on a decoded frame. The largest legitimate reply is the ROM
/// MD5 response; anything past this is a corrupt stream.
const MAX_FRAME_SIZE: usize = 0x10000;

/// Encode one frame, including both END delimiters.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(END);
    for &byte in payload {
        match byte {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            _ => out.push(byte),
        }
    }
    out.push(END);
    out
}

/// Decode a single complete frame from a byte slice.
///
/// Expects exactly one END-delimited frame; leading END bytes (idle line
/// noise between frames) are skipped.
pub fn decode(frame: &[u8]) -> Result<Vec<u8>> {
    let mut reader: &[u8] = frame;
    let mut decoder = SlipDecoder::new();
    decoder.read_frame(&mut reader)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Before the opening END of the next frame.
    Idle,
    Normal,
    Escape,
}

/// Pull-based frame decoder over any reader.
///
/// Read errors pass through untouched, so a serial timeout surfaces as
/// `io::ErrorKind::TimedOut` and the caller decides how to classify it.
#[derive(Debug)]
pub struct SlipDecoder {
    state: State,
}

impl SlipDecoder {
    pub fn new() -> Self {
        SlipDecoder { state: State::Idle }
    }

    /// Block until one complete frame has been read, returning its payload.
    pub fn read_frame<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            match reader.read(&mut byte) {
                Ok(0) => {
                    return Err(Error::ReceiveTimeout("slip frame"));
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    return Err(Error::ReceiveTimeout("slip frame"));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::IoRead(e)),
            }
            let value = byte[0];

            match self.state {
                State::Idle => {
                    if value == END {
                        self.state = State::Normal;
                    }
                    // Bytes outside a frame are line noise; drop them.
                }
                State::Normal => match value {
                    END if payload.is_empty() => {
                        // Back-to-back END bytes delimit an empty frame;
                        // stay hungry for real content.
                    }
                    END => {
                        self.state = State::Idle;
                        return Ok(payload);
                    }
                    ESC => self.state = State::Escape,
                    _ => payload.push(value),
                },
                State::Escape => {
                    match value {
                        ESC_END => payload.push(END),
                        ESC_ESC => payload.push(ESC),
                        other => {
                            self.state = State::Idle;
                            return Err(Error::mismatch(
                                "slip frame",
                                format!("invalid escape sequence DB {other:02x}"),
                            ));
                        }
                    }
                    self.state = State::Normal;
                }
            }

            if payload.len() > MAX_FRAME_SIZE {
                self.state = State::Idle;
                return Err(Error::FramingOverflow("slip frame"));
            }
        }
    }
}

impl Default for SlipDecoder {
    fn default() -> Self {
        SlipDecoder::new()
    }
}
