// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix framing for the device link.
//!
//! TCP has no message boundaries, so every JSON message is prefixed with
//! its payload size:
//!
//! ```text
//! +----------------+----------------------+
//! | Length (4B LE) | UTF-8 JSON payload   |
//! +----------------+----------------------+
//! ```
//!
//! # Wire Format
//!
//! - **Length**: `u32` little-endian, payload bytes only
//! - **Payload**: one JSON value
//!
//! Lengths above [`MAX_FRAME_SIZE`] are rejected from the header alone, so a
//! corrupt or hostile length never causes the payload to be buffered.
//!
//! # Example
//!
//! ```
//! use roomhub::transport::frame_codec::{FrameCodec, FrameReader, MAX_FRAME_SIZE};
//! use serde_json::json;
//!
//! let frame = FrameCodec::encode_json(&json!({"temp": 20})).unwrap();
//! assert_eq!(&frame[..4], &11u32.to_le_bytes());
//!
//! let mut reader = FrameReader::new(MAX_FRAME_SIZE);
//! reader.feed(&frame);
//! assert_eq!(reader.next_message().unwrap(), Some(json!({"temp": 20})));
//! ```

use log::warn;
use serde_json::Value;
use thiserror::Error;

/// Frame header size (4 bytes for length).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Largest accepted payload (just under 16 MiB).
pub const MAX_FRAME_SIZE: usize = 0xFF_FFFF;

/// Bytes read from a socket per read call.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Stateless frame encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a payload into a new framed buffer.
    pub fn encode(payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        Self::encode_into(payload, &mut frame);
        frame
    }

    /// Append `[length: u32 LE][payload]` to `buf`.
    pub fn encode_into(payload: &[u8], buf: &mut Vec<u8>) {
        let len = payload.len() as u32;
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(payload);
    }

    /// Serialize a JSON value and frame it.
    pub fn encode_json(message: &Value) -> serde_json::Result<Vec<u8>> {
        let payload = serde_json::to_vec(message)?;
        Ok(Self::encode(&payload))
    }
}

/// Result of attempting to parse a frame from a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// Complete frame found, returns (payload_len, total_frame_len)
    Complete(usize, usize),
    /// Need this many more bytes
    Incomplete(usize),
    /// Declared length exceeds the maximum
    TooLarge(usize),
}

/// Parse the frame header at the start of `buf` without consuming anything.
pub fn peek_frame_header(buf: &[u8], max_size: usize) -> ParseResult {
    if buf.len() < FRAME_HEADER_SIZE {
        return ParseResult::Incomplete(FRAME_HEADER_SIZE - buf.len());
    }

    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if len > max_size {
        return ParseResult::TooLarge(len);
    }

    let total_frame_len = FRAME_HEADER_SIZE + len;
    if buf.len() < total_frame_len {
        return ParseResult::Incomplete(total_frame_len - buf.len());
    }

    ParseResult::Complete(len, total_frame_len)
}

/// Borrow the payload of the first complete frame in `buf`.
pub fn extract_frame(buf: &[u8], max_size: usize) -> Option<&[u8]> {
    match peek_frame_header(buf, max_size) {
        ParseResult::Complete(len, _) => Some(&buf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len]),
        _ => None,
    }
}

/// Conditions that end the connection they were read from.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),

    #[error("empty frame payload")]
    Empty,

    #[error("null frame payload")]
    Null,
}

/// Accumulates inbound bytes and yields decoded JSON messages in order.
#[derive(Debug)]
pub struct FrameReader {
    buffer: Vec<u8>,
    max_size: usize,
    frames_decoded: u64,
    frames_garbled: u64,
}

impl FrameReader {
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(READ_CHUNK_SIZE),
            max_size,
            frames_decoded: 0,
            frames_garbled: 0,
        }
    }

    /// Append raw bytes received from the socket.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Frames whose payload was not valid JSON.
    pub fn frames_garbled(&self) -> u64 {
        self.frames_garbled
    }

    /// Pop the next message.
    ///
    /// - `Ok(Some(value))` - a complete frame decoded to JSON
    /// - `Ok(None)` - need more bytes
    /// - `Err(_)` - the connection must be failed
    ///
    /// Frames holding invalid JSON are logged and skipped.
    pub fn next_message(&mut self) -> Result<Option<Value>, FrameError> {
        loop {
            let (len, total) = match peek_frame_header(&self.buffer, self.max_size) {
                ParseResult::Complete(len, total) => (len, total),
                ParseResult::Incomplete(_) => return Ok(None),
                ParseResult::TooLarge(len) => return Err(FrameError::TooLarge(len)),
            };

            if len == 0 {
                self.buffer.drain(..total);
                return Err(FrameError::Empty);
            }

            let parsed = serde_json::from_slice::<Value>(&self.buffer[FRAME_HEADER_SIZE..total]);
            self.buffer.drain(..total);

            match parsed {
                Ok(Value::Null) => return Err(FrameError::Null),
                Ok(value) => {
                    self.frames_decoded += 1;
                    return Ok(Some(value));
                }
                Err(e) => {
                    self.frames_garbled += 1;
                    warn!("[FRAME] dropping {} byte payload: {}", len, e);
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
