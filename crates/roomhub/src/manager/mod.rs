// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device manager.
//!
//! Turns discovery results into authenticated device sessions, keeps them
//! alive with heartbeats and routes relay commands to the right room.
//!
//! ```text
//! Discovered -> Connecting -> Authenticating -> Attached -> Detached
//!                                                  |
//!                                     heartbeat / forwarding
//! ```

use std::io;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};

pub mod control;
pub mod credentials;
pub mod scheduler;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use credentials::{CredentialRecord, CredentialStore};
pub use scheduler::{Schedule, Scheduler, Task};
pub use session::{DeviceSession, SessionLinks};

use control::{code_field, CodeField, ControlCode, QR_CODE, REPLY_TARGET, ROOM_ID, THING, THING_ID};
use crate::discovery::{DeviceDescriptor, DeviceDiscovery};
use crate::error::RegisterError;
use crate::relay::{stream_url, RelayLink, RoomRegistrar};
use crate::transport::{Connection, Multiplexer};

/// Manager timing and URL settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub discovery_period: Duration,
    pub heartbeat_period: Duration,
    pub connect_timeout: Duration,
    /// Base for QR stream URLs.
    pub http_base: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            discovery_period: Duration::from_millis(10_000),
            heartbeat_period: Duration::from_millis(8_000),
            connect_timeout: Duration::from_millis(3_000),
            http_base: "https://www.verboze.com/".to_string(),
        }
    }
}

struct Inner {
    config: ManagerConfig,
    multiplexer: Multiplexer<DeviceSession>,
    discovery: Arc<dyn DeviceDiscovery>,
    links: Arc<SessionLinks>,
}

/// Owns the scheduler and the glue between discovery, devices and relay.
pub struct DeviceManager {
    inner: Arc<Inner>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl DeviceManager {
    pub fn new(
        config: ManagerConfig,
        multiplexer: Multiplexer<DeviceSession>,
        discovery: Arc<dyn DeviceDiscovery>,
        credentials: Arc<CredentialStore>,
        relay: Arc<dyn RelayLink>,
        registrar: Arc<dyn RoomRegistrar>,
    ) -> Self {
        let links = Arc::new(SessionLinks {
            credentials,
            relay,
            registrar,
        });
        Self {
            inner: Arc::new(Inner {
                config,
                multiplexer,
                discovery,
                links,
            }),
            scheduler: Mutex::new(None),
        }
    }

    /// Hook up the relay callback and start the scheduler. The first
    /// discovery round runs right away.
    pub fn start(&self) -> io::Result<()> {
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .links
            .relay
            .set_command_callback(Arc::new(move |command: Value| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_relay_command(command);
                }
            }));

        let schedule = Schedule::new(
            self.inner.config.discovery_period,
            self.inner.config.heartbeat_period,
            Instant::now(),
        );
        let weak = Arc::downgrade(&self.inner);
        let scheduler = Scheduler::spawn(schedule, move |task| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match task {
                Task::Discovery => Inner::run_discovery(&inner),
                Task::Heartbeat => inner.heartbeat(),
            }
        })?;

        let previous = self.scheduler.lock().replace(scheduler);
        if let Some(previous) = previous {
            previous.shutdown();
        }
        info!(
            "[MANAGER] started (discovery every {:?}, heartbeat every {:?})",
            self.inner.config.discovery_period, self.inner.config.heartbeat_period
        );
        Ok(())
    }

    /// Trigger a discovery round now.
    pub fn run_discovery(&self) {
        Inner::run_discovery(&self.inner);
    }

    /// Handle one discovery result.
    pub fn on_device_discovered(&self, device: &DeviceDescriptor) {
        self.inner.on_device_discovered(device);
    }

    /// Write the heartbeat to every device.
    pub fn heartbeat(&self) {
        self.inner.heartbeat();
    }

    /// Route one command from the cloud.
    pub fn on_relay_command(&self, command: Value) {
        self.inner.on_relay_command(command);
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.inner.links.credentials
    }

    pub fn multiplexer(&self) -> &Multiplexer<DeviceSession> {
        &self.inner.multiplexer
    }

    /// Session of the device currently in `room_id`.
    pub fn find_room(&self, room_id: &str) -> Option<Arc<Connection<DeviceSession>>> {
        self.inner.find_room(room_id)
    }

    /// Stop the scheduler. Connections belong to the multiplexer and are
    /// closed when it shuts down.
    pub fn shutdown(&self) {
        let scheduler = self.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown();
            info!("[MANAGER] stopped");
        }
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn run_discovery(this: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(this);
        trace!("[MANAGER] discovery round");
        this.discovery.initiate(Arc::new(move |device: &DeviceDescriptor| {
            if let Some(inner) = weak.upgrade() {
                inner.on_device_discovered(device);
            }
        }));
    }

    fn on_device_discovered(&self, device: &DeviceDescriptor) {
        if !device.is_room() {
            trace!(
                "[MANAGER] ignoring {} (type {})",
                device.identifier(),
                device.device_type
            );
            return;
        }
        let identifier = device.identifier();
        if self.multiplexer.is_registered(&identifier) {
            return;
        }
        if !self.links.credentials.can_authenticate(device) {
            return;
        }

        let session = DeviceSession::new(device.clone(), Arc::clone(&self.links));
        let connection =
            match self
                .multiplexer
                .connect(device.socket_addr(), self.config.connect_timeout, session)
            {
                Ok(connection) => connection,
                Err(RegisterError::Duplicate(_)) => return,
                Err(e) => {
                    warn!("[MANAGER] cannot connect to {} ({}): {}", device.name, identifier, e);
                    return;
                }
            };

        let Some(authentication) = self.links.credentials.authentication_message(device) else {
            warn!("[MANAGER] credentials for {} vanished before authenticating", identifier);
            self.multiplexer.deregister_connection(&connection);
            return;
        };
        connection.write(&authentication);
        connection.write(&ControlCode::GetFullState.request());
        info!("[MANAGER] attached {} ({})", device.name, identifier);
    }

    fn heartbeat(&self) {
        let beat = json!({});
        let connections = self.multiplexer.list();
        trace!("[MANAGER] heartbeat to {} devices", connections.len());
        for connection in connections {
            connection.write(&beat);
        }
    }

    fn find_room(&self, room_id: &str) -> Option<Arc<Connection<DeviceSession>>> {
        self.multiplexer
            .list()
            .into_iter()
            .find(|connection| connection.handler().room_id().as_deref() == Some(room_id))
    }

    fn on_relay_command(&self, mut command: Value) {
        let Some(fields) = command.as_object_mut() else {
            warn!("[MANAGER] relay command is not an object: {}", command);
            return;
        };
        let room_id = match fields.remove(ROOM_ID) {
            Some(Value::String(id)) => id,
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                warn!("[MANAGER] relay command without {}", ROOM_ID);
                return;
            }
        };
        let Some(connection) = self.find_room(&room_id) else {
            debug!("[MANAGER] no device for room {}", room_id);
            return;
        };

        if command.get(THING).is_some() {
            connection.write(&command);
            return;
        }

        match code_field(&command) {
            CodeField::Known(ControlCode::GetFullState) => {
                let state = connection.handler().state_snapshot();
                self.reply(&command, &room_id, state);
            }
            CodeField::Known(ControlCode::GetThingState) => {
                let Some(thing_id) = command.get(THING_ID).and_then(thing_key) else {
                    debug!("[MANAGER] entity state request without {}", THING_ID);
                    return;
                };
                let entry = match connection.handler().state_entry(&thing_id) {
                    None | Some(Value::Null) => return,
                    Some(Value::Object(entry)) => Value::Object(entry),
                    Some(value) => json!({ "value": value }),
                };
                let mut reply = entry;
                if let Some(fields) = reply.as_object_mut() {
                    fields.insert(THING.to_string(), Value::String(thing_id));
                }
                self.reply(&command, &room_id, reply);
            }
            CodeField::Known(ControlCode::SetListeners) => {
                debug!("[MANAGER] set-listeners is not supported (room {})", room_id);
            }
            CodeField::Known(ControlCode::ResetQrCode | ControlCode::SetQrCode) => {
                let url = command
                    .get(QR_CODE)
                    .and_then(Value::as_str)
                    .map(|token| stream_url(&self.config.http_base, token));
                if let (Some(url), Some(fields)) = (url, command.as_object_mut()) {
                    fields.insert(QR_CODE.to_string(), Value::String(url));
                }
                connection.write(&command);
            }
            other => warn!("[MANAGER] unsupported relay command {:?} for room {}", other, room_id),
        }
    }

    /// Tag `reply` with the room and echo the request's reply target.
    fn reply(&self, request: &Value, room_id: &str, mut reply: Value) {
        let Some(fields) = reply.as_object_mut() else {
            return;
        };
        fields.insert(ROOM_ID.to_string(), Value::String(room_id.to_string()));
        if let Some(target) = request.get(REPLY_TARGET) {
            fields.insert(REPLY_TARGET.to_string(), target.clone());
        }
        self.links.relay.send_command(reply);
    }
}

fn thing_key(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}
