// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broadcast device discovery.
//!
//! The hub sends a 4-byte beacon on every accepted IPv4 interface; devices
//! answer with a datagram naming themselves and the TCP port they accept
//! hub connections on.
//!
//! ```text
//!  beacon   : 29 AD 00 00                       -> <broadcast>:7991
//!  response : 29 AD <type> <len> name[:port[:data]]
//! ```
//!
//! # Module Structure
//!
//! - [`wire`] - beacon and response framing, payload parsing
//! - [`interfaces`] - IPv4 interface enumeration and the allow-list
//! - [`protocol`] - the background discovery thread

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

pub mod interfaces;
pub mod protocol;
pub mod wire;

pub use interfaces::{InterfaceFilter, NetworkInterface};
pub use protocol::{DiscoveryConfig, DiscoveryMetricsSnapshot, DiscoveryProtocol};

/// Response type announced by room devices.
pub const ROOM_DEVICE_TYPE: u8 = 3;

/// UDP port beacons are sent to.
pub const BROADCAST_PORT: u16 = 7991;

/// TCP port assumed when a response names none (or an invalid one).
pub const DEFAULT_DEVICE_PORT: u16 = 7990;

/// A device that answered a beacon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Interface the response arrived on.
    pub interface: String,
    pub name: String,
    /// Sender address of the response datagram.
    pub ip: IpAddr,
    pub port: u16,
    pub device_type: u8,
    /// Free-form trailer after the second `:`.
    pub data: String,
}

impl DeviceDescriptor {
    /// `ip:port`, the key the connection registry uses.
    pub fn identifier(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// `name:ip:port`, the key credentials are stored under.
    pub fn credential_key(&self) -> String {
        format!("{}:{}:{}", self.name, self.ip, self.port)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn is_room(&self) -> bool {
        self.device_type == ROOM_DEVICE_TYPE
    }
}

/// Invoked for every parsed response.
pub type DiscoveryCallback = Arc<dyn Fn(&DeviceDescriptor) + Send + Sync>;

/// Something that can be asked to look for devices.
pub trait DeviceDiscovery: Send + Sync {
    /// Replace the active callback and trigger a discovery round.
    fn initiate(&self, callback: DiscoveryCallback);
}
