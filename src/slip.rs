//! SLIP framing for the ROM bootloader's serial protocol
//!
//! Every command and response travels as `END | escaped payload | END`.
//! The decoder is a small resumable state machine because responses arrive
//! in arbitrary read-sized chunks, often with boot noise in front of the
//! first delimiter.

use std::io::Write;

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

/// Streaming SLIP encoder wrapping a [Write] implementation
///
/// The leading `END` is written on construction, the trailing one by
/// [SlipEncoder::finish].
pub struct SlipEncoder<'a, W: Write> {
    writer: &'a mut W,
    len: usize,
}

impl<'a, W: Write> SlipEncoder<'a, W> {
    /// Creates a new encoder context
    pub fn new(writer: &'a mut W) -> std::io::Result<Self> {
        let len = writer.write(&[END])?;
        Ok(Self { writer, len })
    }

    pub fn finish(mut self) -> std::io::Result<usize> {
        self.len += self.writer.write(&[END])?;
        Ok(self.len)
    }
}

impl<'a, W: Write> Write for SlipEncoder<'a, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for value in buf.iter() {
            match *value {
                END => {
                    self.len += self.writer.write(&[ESC, ESC_END])?;
                }
                ESC => {
                    self.len += self.writer.write(&[ESC, ESC_ESC])?;
                }
                _ => {
                    self.len += self.writer.write(&[*value])?;
                }
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Encode `data` as a single self-delimited frame
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(data.len() * 2 + 2);

    encoded.push(END);
    for byte in data.iter().copied() {
        match byte {
            END => encoded.extend_from_slice(&[ESC, ESC_END]),
            ESC => encoded.extend_from_slice(&[ESC, ESC_ESC]),
            _ => encoded.push(byte),
        }
    }
    encoded.push(END);

    encoded
}

/// Decode a single frame, ignoring any bytes before the first delimiter
///
/// Returns the contents of the first non-empty frame in `data`, or an empty
/// vector when no complete frame is present.
pub fn decode(data: &[u8]) -> Vec<u8> {
    let mut decoder = SlipDecoder::new();
    decoder.process(data).into_iter().next().unwrap_or_default()
}

/// Incremental SLIP decoder
///
/// Feed it raw bytes as they arrive; complete frames come back in arrival
/// order. Bytes seen before the first `END` are discarded, consecutive
/// delimiters collapse without producing empty frames, and an invalid
/// escape passes the following byte through verbatim — the ROM loader is
/// not strict about this and neither are we.
#[derive(Debug, Default)]
pub struct SlipDecoder {
    started: bool,
    in_escape: bool,
    buffer: Vec<u8>,
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self {
            started: false,
            in_escape: false,
            buffer: Vec::with_capacity(1024),
        }
    }

    /// Consume `data` and return every frame completed by it
    pub fn process(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for byte in data.iter().copied() {
            if let Some(frame) = self.feed(byte) {
                frames.push(frame);
            }
        }

        frames
    }

    fn feed(&mut self, byte: u8) -> Option<Vec<u8>> {
        if byte == END {
            if self.started && !self.buffer.is_empty() {
                let frame = std::mem::take(&mut self.buffer);
                self.reset();
                return Some(frame);
            }
            // Frame start, or a repeated delimiter with nothing buffered.
            self.started = true;
            self.in_escape = false;
            self.buffer.clear();
            return None;
        }

        if !self.started {
            return None;
        }

        if self.in_escape {
            self.in_escape = false;
            match byte {
                ESC_END => self.buffer.push(END),
                ESC_ESC => self.buffer.push(ESC),
                other => self.buffer.push(other),
            }
        } else if byte == ESC {
            self.in_escape = true;
        } else {
            self.buffer.push(byte);
        }

        None
    }

    /// Drop any partial frame and return to the synchronizing state
    pub fn reset(&mut self) {
        self.started = false;
        self.in_escape = false;
        self.buffer.clear();
    }
}
