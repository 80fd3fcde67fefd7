// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! roomhub - local IoT aggregation hub.
//!
//! Discovers room devices over UDP broadcast, keeps one length-framed JSON
//! link per device, merges what each device reports into a state snapshot
//! and relays changes to a single upstream cloud endpoint over a websocket.
//!
//! # Architecture
//!
//! ```text
//! +------------------+   descriptors   +------------------+
//! |    Discovery     | --------------> |  DeviceManager   |<---- scheduler thread
//! | (UDP broadcast)  |                 | credentials/file |      (discovery, heartbeat)
//! +------------------+                 +------------------+
//!                                         |           ^
//!                              register   |           | relay commands
//!                                         v           |
//! +------------------+   frames   +------------------+-+    +------------------+
//! |   room devices   | <--------> |   Multiplexer    |      |   RelayChannel   |
//! | (u32 LE + JSON)  |            | (mio reactor)    | ---> | (websocket pump) | <--> cloud
//! +------------------+            | DeviceSession:   | state+----------------+
//!                                 |   merge + route  |
//!                                 +------------------+
//! ```
//!
//! Each box with a thread owns its state through an explicit handle created
//! by [`Hub::start`]; there are no process-wide statics.

pub mod cache;
pub mod config;
pub mod discovery;
pub mod error;
pub mod hub;
pub mod manager;
pub mod relay;
pub mod transport;

pub use cache::merge;
pub use config::{ConfigError, HubConfig};
pub use discovery::{DeviceDescriptor, DiscoveryProtocol};
pub use error::{CredentialError, HubError, RegisterError, RelayError};
pub use hub::{Hub, HubMetrics};
pub use manager::{CredentialStore, DeviceManager, DeviceSession};
pub use relay::{RelayChannel, RelayLink};
pub use transport::{Connection, ConnectionHandler, Multiplexer};
