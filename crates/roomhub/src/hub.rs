// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-level wiring.
//!
//! [`Hub::start`] brings components up in dependency order:
//!
//! 1. credential store (file loaded before anything connects)
//! 2. discovery thread
//! 3. reactor thread
//! 4. relay pump thread and the HTTP registrar
//! 5. device manager and its scheduler thread
//!
//! [`Hub::shutdown`] stops them in reverse order and joins every thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};

use crate::config::HubConfig;
use crate::discovery::{DiscoveryMetricsSnapshot, DiscoveryProtocol};
use crate::error::HubError;
use crate::manager::{CredentialStore, DeviceManager, DeviceSession};
use crate::relay::{HttpRoomRegistrar, RelayChannel, RelayMetricsSnapshot};
use crate::transport::{Multiplexer, ReactorMetricsSnapshot};

/// Counters from every component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubMetrics {
    pub reactor: ReactorMetricsSnapshot,
    pub discovery: DiscoveryMetricsSnapshot,
    pub relay: RelayMetricsSnapshot,
    /// Devices currently attached.
    pub devices: usize,
    /// Devices waiting for a password.
    pub pending_passwords: usize,
}

/// A running hub.
pub struct Hub {
    discovery: Arc<DiscoveryProtocol>,
    multiplexer: Multiplexer<DeviceSession>,
    relay: Arc<RelayChannel>,
    manager: DeviceManager,
    stopped: AtomicBool,
}

impl Hub {
    pub fn start(config: HubConfig) -> Result<Self, HubError> {
        config.validate()?;

        let default_password = config.credentials.default_password.clone();
        let credentials = Arc::new(match &config.credentials.file {
            Some(path) => CredentialStore::load(path, default_password)?,
            None => {
                warn!("[HUB] no credential file configured, tokens will not survive a restart");
                CredentialStore::in_memory(default_password)
            }
        });

        let discovery = Arc::new(DiscoveryProtocol::spawn(config.discovery_config())?);
        let multiplexer = Multiplexer::spawn(config.multiplexer_config())?;

        let upstream = RelayChannel::spawn(config.relay_config()).and_then(|relay| {
            let registrar = HttpRoomRegistrar::new(
                &config.relay.http_base,
                config.relay.token.clone(),
                config.io_timeout(),
            )?;
            Ok((Arc::new(relay), Arc::new(registrar)))
        });
        let (relay, registrar) = match upstream {
            Ok(links) => links,
            Err(e) => {
                multiplexer.shutdown();
                discovery.shutdown();
                return Err(e.into());
            }
        };

        let manager = DeviceManager::new(
            config.manager_config(),
            multiplexer.clone(),
            discovery.clone(),
            credentials,
            relay.clone(),
            registrar,
        );
        if let Err(e) = manager.start() {
            relay.shutdown();
            multiplexer.shutdown();
            discovery.shutdown();
            return Err(e.into());
        }

        info!(
            "[HUB] started (relay {}, {} interfaces allowed)",
            relay.url(),
            if config.discovery.interfaces.is_empty() {
                "all".to_string()
            } else {
                config.discovery.interfaces.len().to_string()
            }
        );
        Ok(Self {
            discovery,
            multiplexer,
            relay,
            manager,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn manager(&self) -> &DeviceManager {
        &self.manager
    }

    pub fn discovery(&self) -> &DiscoveryProtocol {
        &self.discovery
    }

    pub fn relay(&self) -> &RelayChannel {
        &self.relay
    }

    pub fn metrics(&self) -> HubMetrics {
        HubMetrics {
            reactor: self.multiplexer.metrics(),
            discovery: self.discovery.metrics(),
            relay: self.relay.metrics(),
            devices: self.multiplexer.len(),
            pending_passwords: self.manager.credentials().requires_password().len(),
        }
    }

    /// Stop every component, newest first. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("[HUB] shutting down");
        self.manager.shutdown();
        self.relay.shutdown();
        self.multiplexer.shutdown();
        self.discovery.shutdown();
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn offline_config(dir: &TempDir, relay_port: u16) -> HubConfig {
        let mut config = HubConfig::default();
        config.discovery.interfaces = vec!["roomhub-test0".into()];
        config.credentials.file = Some(dir.path().join("credentials"));
        config.credentials.default_password = Some("pw".into());
        config.relay.url = format!("ws://127.0.0.1:{}/stream/hub/", relay_port);
        config.relay.http_base = "http://127.0.0.1:9/".into();
        config.relay.reconnect_initial_ms = 10;
        config.relay.reconnect_max_ms = 20;
        config
    }

    #[test]
    fn test_start_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut ws = tungstenite::accept(stream).unwrap();
            // Hold the session until the hub closes it.
            while ws.read().is_ok() {}
        });

        let hub = Hub::start(offline_config(&dir, port)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !hub.relay().is_connected() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(hub.relay().is_connected());
        assert_eq!(hub.metrics().devices, 0);
        assert!(hub.discovery().interfaces().is_empty());

        hub.shutdown();
        hub.shutdown();
        server.join().unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = offline_config(&dir, 1);
        config.relay.url = "http://nope".into();
        assert!(matches!(Hub::start(config), Err(HubError::Config(_))));
    }
}
