// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Upstream link to the cloud.
//!
//! - [`channel`] - the persistent websocket and its outbound queue
//! - [`registration`] - one-shot HTTP room registration, QR stream URLs
//! - [`backoff`] - reconnect delays

use std::sync::Arc;

use serde_json::Value;

pub mod backoff;
pub mod channel;
pub mod registration;

pub use backoff::{ReconnectBackoff, ReconnectPolicy};
pub use channel::{RelayChannel, RelayConfig, RelayMetricsSnapshot};
pub use registration::{concat_url, stream_url, HttpRoomRegistrar, RoomRegistrar, RoomRegistration};

/// Receives every command the cloud sends.
pub type CommandCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// The upstream side as seen by the device manager.
pub trait RelayLink: Send + Sync {
    /// Queue a message for the cloud. Never blocks on the network.
    fn send_command(&self, command: Value);

    /// Replace the handler for inbound commands.
    fn set_command_callback(&self, callback: CommandCallback);
}
