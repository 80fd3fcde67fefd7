// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Recording fakes for the upstream links.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::relay::{CommandCallback, RelayLink, RoomRegistrar, RoomRegistration};

#[derive(Default)]
pub struct RecordingRelay {
    pub sent: Mutex<Vec<Value>>,
    pub callback: Mutex<Option<CommandCallback>>,
}

impl RecordingRelay {
    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }

    /// Deliver `command` as if the cloud had sent it.
    pub fn inject(&self, command: Value) {
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(command);
        }
    }
}

impl RelayLink for RecordingRelay {
    fn send_command(&self, command: Value) {
        self.sent.lock().push(command);
    }

    fn set_command_callback(&self, callback: CommandCallback) {
        *self.callback.lock() = Some(callback);
    }
}

#[derive(Default)]
pub struct RecordingRegistrar {
    pub rooms: Mutex<Vec<RoomRegistration>>,
}

impl RoomRegistrar for RecordingRegistrar {
    fn register_room(&self, registration: RoomRegistration) {
        self.rooms.lock().push(registration);
    }
}

pub fn fakes() -> (Arc<RecordingRelay>, Arc<RecordingRegistrar>) {
    (
        Arc::new(RecordingRelay::default()),
        Arc::new(RecordingRegistrar::default()),
    )
}
