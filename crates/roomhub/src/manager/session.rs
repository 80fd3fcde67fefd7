// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-device role on a framed connection.
//!
//! A [`DeviceSession`] owns the merged state snapshot of one device and
//! decides what reaches the relay. Messages are classified in this order:
//!
//! | message has   | action                                                 |
//! |---------------|--------------------------------------------------------|
//! | `noauth`      | invalidate credentials, drop the connection            |
//! | `code`        | reset-QR is forwarded with `__reply_target`; the rest is logged |
//! | `thing`       | ignored                                                |
//! | anything else | merged; forwarded with `__room_id` when it changed state |

use std::sync::Arc;

use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::control::{code_field, config_id, CodeField, ControlCode, NOAUTH, REPLY_TARGET, ROOM_ID, THING};
use super::credentials::CredentialStore;
use crate::cache::merge;
use crate::discovery::DeviceDescriptor;
use crate::relay::{RelayLink, RoomRegistrar, RoomRegistration};
use crate::transport::{Connection, ConnectionHandler};

/// Collaborators every session talks to.
pub struct SessionLinks {
    pub credentials: Arc<CredentialStore>,
    pub relay: Arc<dyn RelayLink>,
    pub registrar: Arc<dyn RoomRegistrar>,
}

/// Connection role for a room device.
pub struct DeviceSession {
    descriptor: DeviceDescriptor,
    state: Mutex<Value>,
    room_id: Mutex<Option<String>>,
    links: Arc<SessionLinks>,
}

impl DeviceSession {
    pub fn new(descriptor: DeviceDescriptor, links: Arc<SessionLinks>) -> Self {
        Self {
            descriptor,
            state: Mutex::new(Value::Object(Map::new())),
            room_id: Mutex::new(None),
            links,
        }
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Room id the device reported in `config.id`, if any yet.
    pub fn room_id(&self) -> Option<String> {
        self.room_id.lock().clone()
    }

    /// Copy of the merged state.
    pub fn state_snapshot(&self) -> Value {
        self.state.lock().clone()
    }

    /// One top-level entry of the merged state.
    pub fn state_entry(&self, key: &str) -> Option<Value> {
        self.state.lock().get(key).cloned()
    }

    fn forward_control(&self, connection: &Connection<Self>, code: CodeField, message: Value) {
        match code {
            CodeField::Known(ControlCode::ResetQrCode) => {
                let Some(target) = self.room_id() else {
                    debug!(
                        "[MANAGER] QR reset from {} before its room id, dropped",
                        connection.identifier()
                    );
                    return;
                };
                let mut forward = message;
                if let Some(fields) = forward.as_object_mut() {
                    fields.insert(REPLY_TARGET.to_string(), Value::String(target));
                }
                debug!("[MANAGER] forwarding QR reset from {}", connection.identifier());
                self.links.relay.send_command(forward);
            }
            other => warn!(
                "[MANAGER] unsupported device control {:?} from {}",
                other,
                connection.identifier()
            ),
        }
    }

    /// Track `config.id`; the first id announces the room.
    fn update_room_id(&self, message: &Value) {
        let Some(id) = config_id(message) else {
            return;
        };
        let first = {
            let mut room_id = self.room_id.lock();
            if room_id.as_deref() == Some(id.as_str()) {
                return;
            }
            room_id.replace(id.clone()).is_none()
        };

        if first {
            info!("[MANAGER] {} is room {}", self.descriptor.identifier(), id);
            self.links
                .registrar
                .register_room(RoomRegistration::new(id, &self.descriptor));
        } else {
            info!("[MANAGER] {} moved to room {}", self.descriptor.identifier(), id);
        }
    }

    fn absorb(&self, connection: &Connection<Self>, message: Value) {
        self.update_room_id(&message);

        let changed = merge(&mut self.state.lock(), &message);
        if !changed {
            trace!("[MANAGER] no state change from {}", connection.identifier());
            return;
        }

        let Some(room_id) = self.room_id() else {
            debug!(
                "[MANAGER] {} changed state before reporting a room id",
                connection.identifier()
            );
            return;
        };
        let mut forward = message;
        if let Some(fields) = forward.as_object_mut() {
            fields.insert(ROOM_ID.to_string(), Value::String(room_id));
            self.links.relay.send_command(forward);
        }
    }
}

impl ConnectionHandler for DeviceSession {
    fn on_message(&self, connection: &Connection<Self>, message: Value) -> bool {
        if message.get(NOAUTH).is_some() {
            self.links.credentials.invalidate(&self.descriptor);
            return false;
        }

        match code_field(&message) {
            CodeField::Absent => {}
            code => {
                self.forward_control(connection, code, message);
                return true;
            }
        }

        if message.get(THING).is_some() {
            trace!("[MANAGER] ignoring thing message from {}", connection.identifier());
            return true;
        }

        self.absorb(connection, message);
        true
    }

    fn on_close(&self, connection: &Connection<Self>) {
        debug!(
            "[MANAGER] session {} ({}) detached",
            connection.identifier(),
            self.descriptor.name
        );
    }
}
