// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Hub configuration.
//!
//! Loaded from TOML; every key has a default so an empty file is valid.
//!
//! ```toml
//! log_level = "info"
//!
//! [discovery]
//! interfaces = ["eth0", "wlan0"]
//! period_ms = 10000
//!
//! [credentials]
//! file = "/var/lib/roomhub/credentials"
//! default_password = "changeme"
//!
//! [relay]
//! url = "wss://www.verboze.com/stream/hub/"
//! token = "..."
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::discovery::{DiscoveryConfig, InterfaceFilter, BROADCAST_PORT, DEFAULT_DEVICE_PORT};
use crate::manager::ManagerConfig;
use crate::relay::channel::DEFAULT_RELAY_URL;
use crate::relay::{ReconnectPolicy, RelayConfig};
use crate::transport::frame_codec::MAX_FRAME_SIZE;
use crate::transport::MultiplexerConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Log filter used by the daemon.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub discovery: DiscoverySection,

    #[serde(default)]
    pub manager: ManagerSection,

    #[serde(default)]
    pub credentials: CredentialsSection,

    #[serde(default)]
    pub relay: RelaySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    /// Interfaces to broadcast on. Empty accepts every interface.
    #[serde(default = "default_interfaces")]
    pub interfaces: Vec<String>,

    #[serde(default = "default_discovery_period")]
    pub period_ms: u64,

    #[serde(default = "default_broadcast_port")]
    pub broadcast_port: u16,

    #[serde(default = "default_device_port")]
    pub default_device_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSection {
    #[serde(default = "default_heartbeat_period")]
    pub heartbeat_period_ms: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Largest accepted frame payload.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsSection {
    /// Credential file; credentials stay in memory when unset.
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Password offered to devices without a stored token.
    #[serde(default)]
    pub default_password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_relay_url")]
    pub url: String,

    /// Hub token for the relay and the registration endpoint.
    #[serde(default)]
    pub token: Option<String>,

    /// Base of the HTTP API and of QR stream URLs.
    #[serde(default = "default_http_base")]
    pub http_base: String,

    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,

    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interfaces() -> Vec<String> {
    ["en0", "eth0", "eth1", "wlan0", "wlan1"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_discovery_period() -> u64 {
    10_000
}

fn default_broadcast_port() -> u16 {
    BROADCAST_PORT
}

fn default_device_port() -> u16 {
    DEFAULT_DEVICE_PORT
}

fn default_heartbeat_period() -> u64 {
    8_000
}

fn default_connect_timeout() -> u64 {
    3_000
}

fn default_max_frame_size() -> usize {
    MAX_FRAME_SIZE
}

fn default_relay_url() -> String {
    DEFAULT_RELAY_URL.to_string()
}

fn default_http_base() -> String {
    "https://www.verboze.com/".to_string()
}

fn default_reconnect_initial() -> u64 {
    1_000
}

fn default_reconnect_max() -> u64 {
    30_000
}

fn default_io_timeout() -> u64 {
    5_000
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            discovery: DiscoverySection::default(),
            manager: ManagerSection::default(),
            credentials: CredentialsSection::default(),
            relay: RelaySection::default(),
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            interfaces: default_interfaces(),
            period_ms: default_discovery_period(),
            broadcast_port: BROADCAST_PORT,
            default_device_port: DEFAULT_DEVICE_PORT,
        }
    }
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            heartbeat_period_ms: default_heartbeat_period(),
            connect_timeout_ms: default_connect_timeout(),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            token: None,
            http_base: default_http_base(),
            reconnect_initial_ms: default_reconnect_initial(),
            reconnect_max_ms: default_reconnect_max(),
            io_timeout_ms: default_io_timeout(),
        }
    }
}

impl HubConfig {
    /// Load and validate a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML, e.g. for `gen-config`.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery.period_ms == 0 {
            return Err(ConfigError::Invalid("discovery.period_ms cannot be 0".into()));
        }
        if self.manager.heartbeat_period_ms == 0 {
            return Err(ConfigError::Invalid(
                "manager.heartbeat_period_ms cannot be 0".into(),
            ));
        }
        if self.manager.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "manager.connect_timeout_ms cannot be 0".into(),
            ));
        }
        if self.manager.max_frame_size == 0 || self.manager.max_frame_size > MAX_FRAME_SIZE {
            return Err(ConfigError::Invalid(format!(
                "manager.max_frame_size must be in 1..={}",
                MAX_FRAME_SIZE
            )));
        }
        if self.discovery.broadcast_port == 0 {
            return Err(ConfigError::Invalid("discovery.broadcast_port cannot be 0".into()));
        }

        let relay = &self.relay;
        if relay.reconnect_initial_ms == 0 || relay.reconnect_initial_ms > relay.reconnect_max_ms {
            return Err(ConfigError::Invalid(format!(
                "relay.reconnect_initial_ms ({}) must be non-zero and <= reconnect_max_ms ({})",
                relay.reconnect_initial_ms, relay.reconnect_max_ms
            )));
        }
        if relay.io_timeout_ms == 0 {
            return Err(ConfigError::Invalid("relay.io_timeout_ms cannot be 0".into()));
        }
        if !(relay.url.starts_with("ws://") || relay.url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "relay.url must use ws:// or wss:// (got {})",
                relay.url
            )));
        }
        if !(relay.http_base.starts_with("http://") || relay.http_base.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "relay.http_base must use http:// or https:// (got {})",
                relay.http_base
            )));
        }
        Ok(())
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        let interfaces = if self.discovery.interfaces.is_empty() {
            InterfaceFilter::all()
        } else {
            InterfaceFilter::only(self.discovery.interfaces.clone())
        };
        DiscoveryConfig {
            interfaces,
            broadcast_port: self.discovery.broadcast_port,
            default_device_port: self.discovery.default_device_port,
        }
    }

    pub fn multiplexer_config(&self) -> MultiplexerConfig {
        MultiplexerConfig {
            max_frame_size: self.manager.max_frame_size,
            ..Default::default()
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            discovery_period: Duration::from_millis(self.discovery.period_ms),
            heartbeat_period: Duration::from_millis(self.manager.heartbeat_period_ms),
            connect_timeout: Duration::from_millis(self.manager.connect_timeout_ms),
            http_base: self.relay.http_base.clone(),
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            url: self.relay.url.clone(),
            token: self.relay.token.clone(),
            reconnect: ReconnectPolicy {
                initial: Duration::from_millis(self.relay.reconnect_initial_ms),
                max: Duration::from_millis(self.relay.reconnect_max_ms),
            },
            io_timeout: Duration::from_millis(self.relay.io_timeout_ms),
        }
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.relay.io_timeout_ms)
    }
}
