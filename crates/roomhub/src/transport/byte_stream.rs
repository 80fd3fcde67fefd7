// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Retrying wrappers around raw send/receive primitives.
//!
//! Non-blocking sockets routinely report `Interrupted` or `WouldBlock`. The
//! helpers here retry those transient conditions a bounded number of times
//! and hand the last error back to the caller, which decides whether a
//! persistent condition means "drained" or "failed".
//!
//! # Example
//!
//! ```ignore
//! use roomhub::transport::byte_stream::robust_read;
//!
//! let mut chunk = [0u8; 4096];
//! match robust_read(&mut stream, &mut chunk) {
//!     Ok(0) => { /* peer closed */ }
//!     Ok(n) => { /* consume chunk[..n] */ }
//!     Err(e) if e.kind() == io::ErrorKind::WouldBlock => { /* drained */ }
//!     Err(e) => { /* fatal */ }
//! }
//! ```

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::net::UdpSocket;

/// Attempts made before a transient condition is returned to the caller.
pub const MAX_IO_ATTEMPTS: usize = 5;

/// Whether an error is worth retrying immediately.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

/// Run `op` until it succeeds, fails permanently, or has been attempted
/// [`MAX_IO_ATTEMPTS`] times.
pub fn robust<T, F>(mut op: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if is_transient(&e) && attempt < MAX_IO_ATTEMPTS => attempt += 1,
            other => return other,
        }
    }
}

/// Read into `buf`, retrying transient conditions.
pub fn robust_read<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    robust(|| reader.read(buf))
}

/// Write from `buf`, retrying transient conditions.
pub fn robust_write<W: Write + ?Sized>(writer: &mut W, buf: &[u8]) -> io::Result<usize> {
    robust(|| writer.write(buf))
}

/// Send one datagram, retrying transient conditions.
pub fn robust_send_to(socket: &UdpSocket, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
    robust(|| socket.send_to(buf, target))
}

/// Receive one datagram, retrying transient conditions.
pub fn robust_recv_from(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    robust(|| socket.recv_from(buf))
}

// ============================================================================
// Mock stream (tests)
// ============================================================================


// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::mock::MockStream;
    use super::*;

    #[test]
    fn test_transient_kinds() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::BrokenPipe)));
    }

    #[test]
    fn test_read_recovers_after_interrupts() {
        let mut stream = MockStream::new();
        stream.feed_read_data(b"abc");
        stream.inject_read_errors(io::ErrorKind::Interrupted, MAX_IO_ATTEMPTS - 1);

        let mut buf = [0u8; 8];
        assert_eq!(robust_read(&mut stream, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(stream.reads, MAX_IO_ATTEMPTS);
    }

    #[test]
    fn test_read_gives_up_after_bound() {
        let mut stream = MockStream::new();
        stream.feed_read_data(b"abc");
        stream.inject_read_errors(io::ErrorKind::Interrupted, MAX_IO_ATTEMPTS);

        let mut buf = [0u8; 8];
        let err = robust_read(&mut stream, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert_eq!(stream.reads, MAX_IO_ATTEMPTS);
    }

    #[test]
    fn test_permanent_error_not_retried() {
        let mut stream = MockStream::new();
        stream.inject_read_errors(io::ErrorKind::ConnectionReset, 3);

        let mut buf = [0u8; 8];
        let err = robust_read(&mut stream, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(stream.reads, 1);
    }

    #[test]
    fn test_write_retries_would_block() {
        let mut stream = MockStream::new();
        stream.inject_write_errors(io::ErrorKind::WouldBlock, 2);

        assert_eq!(robust_write(&mut stream, b"hello").unwrap(), 5);
        assert_eq!(stream.get_written_data(), b"hello");
    }

    #[test]
    fn test_udp_roundtrip() {
        let a = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = b.local_addr().unwrap();

        assert_eq!(robust_send_to(&a, b"ping", target).unwrap(), 4);

        let mut buf = [0u8; 16];
        let (n, from) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }
}
