// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Framed connection: one socket, its buffers and its role handler.
//!
//! Only the reactor thread performs socket I/O. Other threads interact with
//! a connection through [`Connection::write`], which appends to the write
//! buffer under its own lock and wakes the reactor.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};
use mio::net::TcpStream;
use mio::{Token, Waker};
use parking_lot::Mutex;
use serde_json::Value;

use super::byte_stream::{robust_read, robust_write};
use super::frame_codec::{FrameCodec, FrameReader, READ_CHUNK_SIZE};
use super::metrics::ReactorMetrics;

/// Per-role behaviour plugged into a [`Connection`].
///
/// Callbacks run on the reactor thread (`on_message`, `on_close`) or on the
/// writing thread (`on_write`); they must not block.
pub trait ConnectionHandler: Sized + Send + Sync + 'static {
    /// A decoded message arrived. Return `false` to drop the connection.
    fn on_message(&self, connection: &Connection<Self>, message: Value) -> bool;

    /// A message was queued for sending.
    fn on_write(&self, _connection: &Connection<Self>, _message: &Value) {}

    /// The connection left the registry.
    fn on_close(&self, _connection: &Connection<Self>) {}
}

/// Outcome of a flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Write buffer is empty.
    Drained,
    /// The transport stopped accepting bytes; wait for writability.
    Pending,
}

/// Outbound byte queue.
#[derive(Debug, Default)]
pub struct WriteQueue {
    buffer: Vec<u8>,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Append an already framed buffer.
    pub fn push(&mut self, frame: &[u8]) {
        self.buffer.extend_from_slice(frame);
    }

    /// Write as much as `writer` accepts, removing sent bytes from the front.
    ///
    /// A zero-length write or a non-retryable error is returned as `Err`;
    /// a persistent would-block leaves the rest queued.
    pub fn flush_into<W: Write + ?Sized>(&mut self, writer: &mut W) -> io::Result<FlushOutcome> {
        let mut sent = 0;
        let result = loop {
            if sent == self.buffer.len() {
                break Ok(FlushOutcome::Drained);
            }
            match robust_write(writer, &self.buffer[sent..]) {
                Ok(0) => break Err(io::Error::new(io::ErrorKind::WriteZero, "peer stopped accepting")),
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(FlushOutcome::Pending),
                Err(e) => break Err(e),
            }
        };
        self.buffer.drain(..sent);
        result
    }
}

/// A registered socket speaking the length-prefixed JSON protocol.
pub struct Connection<H: ConnectionHandler> {
    token: Token,
    identifier: String,
    peer: SocketAddr,
    stream: Mutex<TcpStream>,
    reader: Mutex<FrameReader>,
    writer: Mutex<WriteQueue>,
    /// Write interest currently registered with the poll.
    write_interest: AtomicBool,
    closed: AtomicBool,
    max_frame_size: usize,
    handler: H,
    waker: Arc<Waker>,
    metrics: Arc<ReactorMetrics>,
}

impl<H: ConnectionHandler> Connection<H> {
    pub(crate) fn new(
        token: Token,
        stream: TcpStream,
        peer: SocketAddr,
        handler: H,
        max_frame_size: usize,
        waker: Arc<Waker>,
        metrics: Arc<ReactorMetrics>,
    ) -> Self {
        Self {
            token,
            identifier: identifier_for(&peer),
            peer,
            stream: Mutex::new(stream),
            reader: Mutex::new(FrameReader::new(max_frame_size)),
            writer: Mutex::new(WriteQueue::new()),
            write_interest: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            max_frame_size,
            handler,
            waker,
            metrics,
        }
    }

    /// `ip:port` of the peer, unique within a registry.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.writer.lock().is_empty()
    }

    /// Queue a message and wake the reactor so it gets flushed.
    ///
    /// Returns `false` when the connection is closed or the message cannot
    /// be framed.
    pub fn write(&self, message: &Value) -> bool {
        if self.is_closed() {
            trace!("[REACTOR] write to closed connection {} dropped", self.identifier);
            return false;
        }

        let payload = match serde_json::to_vec(message) {
            Ok(p) => p,
            Err(e) => {
                warn!("[REACTOR] cannot serialize message for {}: {}", self.identifier, e);
                return false;
            }
        };
        if payload.len() > self.max_frame_size {
            warn!(
                "[REACTOR] message for {} exceeds frame limit ({} bytes)",
                self.identifier,
                payload.len()
            );
            return false;
        }

        let frame = FrameCodec::encode(&payload);
        self.writer.lock().push(&frame);
        self.metrics.record_frame_sent(frame.len());
        self.handler.on_write(self, message);

        if let Err(e) = self.waker.wake() {
            warn!("[REACTOR] wake failed after write to {}: {}", self.identifier, e);
        }
        true
    }

    /// Drain the socket and dispatch every complete frame.
    ///
    /// Returns `false` when the connection must be deregistered.
    pub(crate) fn on_readable(&self) -> bool {
        loop {
            let status = {
                let mut stream = self.stream.lock();
                let mut reader = self.reader.lock();
                read_chunk(&mut *stream, &mut reader)
            };
            match status {
                Ok(ReadStatus::Data(n)) => {
                    self.metrics.record_bytes_received(n);
                    if !self.dispatch_frames() {
                        return false;
                    }
                }
                Ok(ReadStatus::Drained) => return true,
                Ok(ReadStatus::Closed) => {
                    debug!("[REACTOR] {} closed by peer", self.identifier);
                    return false;
                }
                Err(e) => {
                    debug!("[REACTOR] read error on {}: {}", self.identifier, e);
                    return false;
                }
            }
        }
    }

    fn dispatch_frames(&self) -> bool {
        loop {
            let next = self.reader.lock().next_message();
            match next {
                Ok(Some(message)) => {
                    self.metrics.record_frame_received();
                    if !self.handler.on_message(self, message) {
                        debug!("[REACTOR] handler released {}", self.identifier);
                        return false;
                    }
                }
                Ok(None) => return true,
                Err(e) => {
                    self.metrics.record_framing_error();
                    warn!("[REACTOR] failing {}: {}", self.identifier, e);
                    return false;
                }
            }
        }
    }

    /// Push queued bytes to the socket.
    ///
    /// Returns `false` when the connection must be deregistered.
    pub(crate) fn on_writable(&self) -> bool {
        let mut stream = self.stream.lock();
        let mut writer = self.writer.lock();
        match writer.flush_into(&mut *stream) {
            Ok(_) => true,
            Err(e) => {
                debug!("[REACTOR] write error on {}: {}", self.identifier, e);
                false
            }
        }
    }

    pub(crate) fn stream(&self) -> &Mutex<TcpStream> {
        &self.stream
    }

    pub(crate) fn swap_write_interest(&self, wanted: bool) -> bool {
        self.write_interest.swap(wanted, Ordering::AcqRel)
    }

    /// Mark closed and shut the socket down. The descriptor itself is
    /// released when the last handle to the connection drops.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let stream = self.stream.lock();
        if let Err(e) = stream.shutdown(Shutdown::Both) {
            trace!("[REACTOR] shutdown of {}: {}", self.identifier, e);
        }
    }
}

impl<H: ConnectionHandler> std::fmt::Debug for Connection<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("token", &self.token)
            .field("identifier", &self.identifier)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Registry key for a peer address.
pub fn identifier_for(peer: &SocketAddr) -> String {
    format!("{}:{}", peer.ip(), peer.port())
}

/// What a single read produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// This many bytes were appended to the frame buffer.
    Data(usize),
    /// Nothing left to read for now.
    Drained,
    /// Zero-length read: the peer is gone.
    Closed,
}

/// Read one chunk from `reader` into `frames`.
pub fn read_chunk<R: Read + ?Sized>(reader: &mut R, frames: &mut FrameReader) -> io::Result<ReadStatus> {
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    match robust_read(reader, &mut chunk) {
        Ok(0) => Ok(ReadStatus::Closed),
        Ok(n) => {
            frames.feed(&chunk[..n]);
            Ok(ReadStatus::Data(n))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadStatus::Drained),
        Err(e) => Err(e),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::byte_stream::mock::MockStream;
    use crate::transport::frame_codec::MAX_FRAME_SIZE;
    use serde_json::json;

    #[test]
    fn test_identifier_format() {
        let v4: SocketAddr = "10.0.0.7:7990".parse().unwrap();
        let v6: SocketAddr = "[fe80::1]:7990".parse().unwrap();
        assert_eq!(identifier_for(&v4), "10.0.0.7:7990");
        assert_eq!(identifier_for(&v6), "fe80::1:7990");
    }

    #[test]
    fn test_flush_drains_queue() {
        let mut queue = WriteQueue::new();
        queue.push(&FrameCodec::encode(b"{}"));
        let mut stream = MockStream::new();

        assert_eq!(queue.flush_into(&mut stream).unwrap(), FlushOutcome::Drained);
        assert!(queue.is_empty());
        assert_eq!(stream.get_written_data(), FrameCodec::encode(b"{}"));
    }

    #[test]
    fn test_partial_writes_keep_order() {
        let mut queue = WriteQueue::new();
        queue.push(b"0123456789");
        let mut stream = MockStream::new();
        stream.limit_writes(3);

        assert_eq!(queue.flush_into(&mut stream).unwrap(), FlushOutcome::Drained);
        assert_eq!(stream.get_written_data(), b"0123456789");
    }

    #[test]
    fn test_persistent_would_block_keeps_remainder() {
        let mut queue = WriteQueue::new();
        queue.push(b"abcdef");
        let mut stream = MockStream::new();
        stream.inject_write_errors(io::ErrorKind::WouldBlock, 100);

        assert_eq!(queue.flush_into(&mut stream).unwrap(), FlushOutcome::Pending);
        assert_eq!(queue.len(), 6);
    }

    #[test]
    fn test_zero_write_fails() {
        let mut queue = WriteQueue::new();
        queue.push(b"abc");
        let mut stream = MockStream::new();
        stream.close();

        let err = queue.flush_into(&mut stream).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_read_chunk_from_mock() {
        let mut stream = MockStream::new();
        stream.feed_read_data(&FrameCodec::encode_json(&json!({"a": 1})).unwrap());
        stream.feed_read_data(&FrameCodec::encode_json(&json!({"b": 2})).unwrap());
        let mut frames = FrameReader::new(MAX_FRAME_SIZE);

        assert_eq!(
            read_chunk(&mut stream, &mut frames).unwrap(),
            ReadStatus::Data(22)
        );
        assert_eq!(read_chunk(&mut stream, &mut frames).unwrap(), ReadStatus::Drained);
        assert_eq!(frames.next_message().unwrap(), Some(json!({"a": 1})));
        assert_eq!(frames.next_message().unwrap(), Some(json!({"b": 2})));
    }

    #[test]
    fn test_read_chunk_reports_eof() {
        let mut stream = MockStream::new();
        stream.close();
        let mut frames = FrameReader::new(MAX_FRAME_SIZE);

        assert_eq!(read_chunk(&mut stream, &mut frames).unwrap(), ReadStatus::Closed);
    }

    #[test]
    fn test_read_chunk_interrupts_then_data() {
        let mut stream = MockStream::new();
        stream.feed_read_data(b"xy");
        stream.inject_read_errors(io::ErrorKind::Interrupted, 2);
        let mut frames = FrameReader::new(MAX_FRAME_SIZE);

        assert_eq!(read_chunk(&mut stream, &mut frames).unwrap(), ReadStatus::Data(2));
        assert_eq!(frames.buffered(), 2);
    }
}
