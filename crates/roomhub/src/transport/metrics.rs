// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reactor metrics.
//!
//! Counters for monitoring device link health:
//! - Connection churn (opened, closed, rejected duplicates)
//! - Frame throughput (received, sent)
//! - Byte throughput
//! - Framing errors
//!
//! # Example
//!
//! ```
//! use roomhub::transport::ReactorMetrics;
//!
//! let metrics = ReactorMetrics::new();
//! metrics.record_connection_opened();
//! metrics.record_frame_sent(64);
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.connections_opened, 1);
//! assert_eq!(snapshot.bytes_sent, 64);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the reactor thread and every connection.
#[derive(Debug, Default)]
pub struct ReactorMetrics {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    duplicates_rejected: AtomicU64,
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    /// Oversized, empty or null frames (connection-fatal)
    framing_errors: AtomicU64,
}

impl ReactorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_rejected(&self) {
        self.duplicates_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a queued frame of `bytes` (header included).
    pub fn record_frame_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_bytes_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> ReactorMetricsSnapshot {
        ReactorMetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            duplicates_rejected: self.duplicates_rejected.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`ReactorMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReactorMetricsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub duplicates_rejected: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub framing_errors: u64,
}

impl ReactorMetricsSnapshot {
    /// Connections currently registered, as far as the counters know.
    pub fn active_connections(&self) -> u64 {
        self.connections_opened
            .saturating_sub(self.connections_closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_connections() {
        let metrics = ReactorMetrics::new();
        metrics.record_connection_opened();
        metrics.record_connection_opened();
        metrics.record_connection_closed();

        assert_eq!(metrics.snapshot().active_connections(), 1);
    }
}
