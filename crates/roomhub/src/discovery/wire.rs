// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery datagram framing.
//!
//! Responses are scanned from a per-socket byte buffer. A leading byte that
//! does not start the magic is dropped and the scan restarts, so garbage in
//! front of a response never loses the response itself.

use log::trace;

/// First two bytes of every discovery datagram.
pub const DISCOVERY_MAGIC: [u8; 2] = [0x29, 0xAD];

/// Magic + type + length.
pub const HEADER_SIZE: usize = 4;

/// Receive buffer for a single `recv_from`.
pub const RECV_BUFFER_SIZE: usize = 256;

/// The beacon sent on every bound interface.
pub fn beacon() -> [u8; HEADER_SIZE] {
    [DISCOVERY_MAGIC[0], DISCOVERY_MAGIC[1], 0, 0]
}

/// One framed response, payload still raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub device_type: u8,
    pub payload: Vec<u8>,
}

/// Scan buffer for one socket.
#[derive(Debug, Default)]
pub struct ResponseBuffer {
    bytes: Vec<u8>,
    skipped: u64,
}

impl ResponseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bytes dropped while resynchronizing on the magic.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Pop the next complete response, or `None` when more bytes are needed.
    pub fn next_response(&mut self) -> Option<RawResponse> {
        while self.bytes.len() >= HEADER_SIZE {
            if self.bytes[..2] != DISCOVERY_MAGIC {
                trace!("[DISCOVERY] resync: dropping 0x{:02x}", self.bytes[0]);
                self.bytes.remove(0);
                self.skipped += 1;
                continue;
            }

            let device_type = self.bytes[2];
            let total = HEADER_SIZE + self.bytes[3] as usize;
            if self.bytes.len() < total {
                return None;
            }

            let payload = self.bytes[HEADER_SIZE..total].to_vec();
            self.bytes.drain(..total);
            return Some(RawResponse {
                device_type,
                payload,
            });
        }
        None
    }
}

/// Fields of a `name[:port[:data]]` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePayload {
    pub name: String,
    pub port: u16,
    pub data: String,
}

/// Split a response payload.
///
/// The payload is cut at the first NUL and decoded lossily. A missing or
/// unparsable port falls back to `default_port`.
pub fn parse_payload(payload: &[u8], default_port: u16) -> ResponsePayload {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    let text = String::from_utf8_lossy(&payload[..end]);

    let mut parts = text.splitn(3, ':');
    let name = parts.next().unwrap_or_default().to_string();
    let port = parts
        .next()
        .and_then(|p| p.trim().parse::<u16>().ok())
        .unwrap_or(default_port);
    let data = parts.next().unwrap_or_default().to_string();

    ResponsePayload { name, port, data }
}

/// Build a response datagram. Payloads longer than 255 bytes are truncated.
pub fn encode_response(device_type: u8, payload: &str) -> Vec<u8> {
    let bytes = &payload.as_bytes()[..payload.len().min(u8::MAX as usize)];
    let mut datagram = Vec::with_capacity(HEADER_SIZE + bytes.len());
    datagram.extend_from_slice(&DISCOVERY_MAGIC);
    datagram.push(device_type);
    datagram.push(bytes.len() as u8);
    datagram.extend_from_slice(bytes);
    datagram
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beacon_bytes() {
        assert_eq!(beacon(), [0x29, 0xAD, 0x00, 0x00]);
    }

    #[test]
    fn test_resync_on_leading_garbage() {
        let mut buffer = ResponseBuffer::new();
        buffer.feed(&[b'g', 0x29, 0xAD, 0, 3, b'a', b'b', b'c']);

        let response = buffer.next_response().unwrap();
        assert_eq!(response.device_type, 0);
        assert_eq!(response.payload, b"abc");
        assert_eq!(parse_payload(&response.payload, 7990).name, "abc");
        assert_eq!(buffer.skipped(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_incomplete_waits_for_more() {
        let datagram = encode_response(3, "lamp:8000");
        let mut buffer = ResponseBuffer::new();

        buffer.feed(&datagram[..6]);
        assert!(buffer.next_response().is_none());
        assert_eq!(buffer.len(), 6);

        buffer.feed(&datagram[6..]);
        let response = buffer.next_response().unwrap();
        assert_eq!(response.device_type, 3);
        assert_eq!(response.payload, b"lamp:8000");
    }

    #[test]
    fn test_back_to_back_responses() {
        let mut buffer = ResponseBuffer::new();
        buffer.feed(&encode_response(3, "a"));
        buffer.feed(&[0xFF, 0x29]);
        buffer.feed(&encode_response(1, "b:1"));

        assert_eq!(buffer.next_response().unwrap().payload, b"a");
        assert_eq!(buffer.next_response().unwrap().payload, b"b:1");
        assert!(buffer.next_response().is_none());
        assert_eq!(buffer.skipped(), 2);
    }

    #[test]
    fn test_parse_payload_fields() {
        assert_eq!(
            parse_payload(b"kitchen:8123:v2:extra", 7990),
            ResponsePayload {
                name: "kitchen".into(),
                port: 8123,
                data: "v2:extra".into(),
            }
        );
        assert_eq!(parse_payload(b"kitchen", 7990).port, 7990);
        assert_eq!(parse_payload(b"kitchen:notaport:x", 7990).port, 7990);
        assert_eq!(parse_payload(b"kitchen:70000", 7990).port, 7990);
        assert_eq!(parse_payload(b"kitchen:", 7990).port, 7990);
    }

    #[test]
    fn test_parse_payload_stops_at_nul() {
        let parsed = parse_payload(b"hall\0:9000", 7990);
        assert_eq!(parsed.name, "hall");
        assert_eq!(parsed.port, 7990);
    }
}
