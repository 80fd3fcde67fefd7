// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device link transport.
//!
//! Every device speaks length-prefixed JSON over TCP. One reactor thread
//! ([`Multiplexer`]) owns readiness polling for all device sockets; other
//! threads only queue writes and wake it.
//!
//! # Module Structure
//!
//! - [`byte_stream`] - bounded retry around send/receive primitives
//! - [`frame_codec`] - `u32` LE length prefix + JSON payload
//! - [`connection`] - per-socket buffers and the role handler trait
//! - [`reactor`] - connection registry and the poll loop
//! - [`metrics`] - atomic counters

pub mod byte_stream;
pub mod connection;
pub mod frame_codec;
pub mod metrics;
pub mod reactor;

pub use connection::{identifier_for, Connection, ConnectionHandler};
pub use metrics::{ReactorMetrics, ReactorMetricsSnapshot};
pub use reactor::{Multiplexer, MultiplexerConfig};
