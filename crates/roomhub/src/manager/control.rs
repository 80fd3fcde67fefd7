// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control codes and reserved keys shared by devices and the relay.

use serde_json::Value;

/// Routing key added to everything forwarded upstream.
pub const ROOM_ID: &str = "__room_id";
/// Identifies who should receive the answer to a command.
pub const REPLY_TARGET: &str = "__reply_target";
pub const CODE: &str = "code";
pub const THING: &str = "thing";
pub const THING_ID: &str = "thing-id";
pub const QR_CODE: &str = "qr-code";
pub const NOAUTH: &str = "noauth";
pub const CONFIG: &str = "config";
pub const AUTHENTICATION: &str = "authentication";

/// `code` values understood on both links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCode {
    GetFullState = 0,
    GetThingState = 1,
    SetListeners = 2,
    ResetQrCode = 3,
    SetQrCode = 4,
}

impl TryFrom<i64> for ControlCode {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::GetFullState),
            1 => Ok(Self::GetThingState),
            2 => Ok(Self::SetListeners),
            3 => Ok(Self::ResetQrCode),
            4 => Ok(Self::SetQrCode),
            other => Err(other),
        }
    }
}

impl ControlCode {
    /// The message `{"code": n}` for this code.
    pub fn request(self) -> Value {
        serde_json::json!({ CODE: self as i64 })
    }
}

/// How the `code` field of a message reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeField {
    Absent,
    Known(ControlCode),
    Unknown(i64),
    /// Present but not an integer.
    Malformed,
}

pub fn code_field(message: &Value) -> CodeField {
    match message.get(CODE) {
        None => CodeField::Absent,
        Some(value) => match value.as_i64() {
            Some(raw) => match ControlCode::try_from(raw) {
                Ok(code) => CodeField::Known(code),
                Err(raw) => CodeField::Unknown(raw),
            },
            None => CodeField::Malformed,
        },
    }
}

/// `config.id` as a string, if the message carries one.
pub fn config_id(message: &Value) -> Option<String> {
    match message.get(CONFIG)?.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}
