// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device credentials.
//!
//! Each device is keyed by `name:ip:port`. A record holds the long-lived
//! token and, until the first authentication message is built, the one-time
//! password that goes with it.
//!
//! # File format
//!
//! ```text
//! kitchen:192.168.1.20:7990
//! Jm3...64 alphanumeric characters...
//! hall:192.168.1.21:7990
//! Qx9...
//! ```
//!
//! Passwords are never written. The file is rewritten in full on every
//! change.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};

use super::control::AUTHENTICATION;
use crate::discovery::DeviceDescriptor;
use crate::error::CredentialError;

/// Length of a generated token.
pub const TOKEN_LENGTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub token: String,
    pub one_time_password: Option<String>,
}

impl CredentialRecord {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            one_time_password: None,
        }
    }

    /// `{"authentication": {"token", "password"}}`, clearing the password.
    fn take_authentication(&mut self) -> Value {
        let password = self.one_time_password.take().unwrap_or_default();
        json!({ AUTHENTICATION: { "token": self.token, "password": password } })
    }
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<String, CredentialRecord>,
    requires_password: HashMap<String, DeviceDescriptor>,
}

/// Credential map plus the set of devices waiting for a password.
///
/// Both live under one mutex.
#[derive(Debug)]
pub struct CredentialStore {
    path: Option<PathBuf>,
    default_password: Option<String>,
    inner: Mutex<Inner>,
}

impl CredentialStore {
    /// Store that never touches the filesystem.
    pub fn in_memory(default_password: Option<String>) -> Self {
        Self {
            path: None,
            default_password: default_password.filter(|p| !p.is_empty()),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Load `path` if it exists. A missing file starts an empty store that
    /// will be created on the first change.
    pub fn load(
        path: impl Into<PathBuf>,
        default_password: Option<String>,
    ) -> Result<Self, CredentialError> {
        let path = path.into();
        let records = match fs::read_to_string(&path) {
            Ok(text) => parse_records(&text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("[CREDENTIALS] {} not found, starting empty", path.display());
                HashMap::new()
            }
            Err(source) => {
                return Err(CredentialError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        info!(
            "[CREDENTIALS] using {} ({} records)",
            path.display(),
            records.len()
        );

        let store = Self::in_memory(default_password);
        store.inner.lock().records = records;
        Ok(Self {
            path: Some(path),
            ..store
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<CredentialRecord> {
        self.inner.lock().records.get(key).cloned()
    }

    /// Whether `device` can be sent an authentication message.
    ///
    /// With no record on file, a configured default password produces a
    /// fresh token carrying it; otherwise the device is recorded as
    /// requiring a password.
    pub fn can_authenticate(&self, device: &DeviceDescriptor) -> bool {
        let key = device.credential_key();
        let mut inner = self.inner.lock();
        if inner.records.contains_key(&key) {
            return true;
        }

        match &self.default_password {
            Some(password) => {
                let record = CredentialRecord {
                    token: generate_token(),
                    one_time_password: Some(password.clone()),
                };
                inner.records.insert(key.clone(), record);
                inner.requires_password.remove(&key);
                self.persist(&inner);
                debug!("[CREDENTIALS] new token for {}", key);
                true
            }
            None => {
                Self::mark_requires_password(&mut inner, device);
                false
            }
        }
    }

    /// Build the authentication message for `device` and clear its
    /// one-time password.
    pub fn authentication_message(&self, device: &DeviceDescriptor) -> Option<Value> {
        let mut inner = self.inner.lock();
        inner
            .records
            .get_mut(&device.credential_key())
            .map(CredentialRecord::take_authentication)
    }

    /// The device rejected its token: forget it and ask for a password.
    pub fn invalidate(&self, device: &DeviceDescriptor) {
        let key = device.credential_key();
        warn!("[CREDENTIALS] credentials for {} no longer work", key);
        let mut inner = self.inner.lock();
        inner.records.remove(&key);
        self.persist(&inner);
        Self::mark_requires_password(&mut inner, device);
    }

    /// Devices that cannot authenticate until a password is provided.
    pub fn requires_password(&self) -> Vec<DeviceDescriptor> {
        let inner = self.inner.lock();
        let mut devices: Vec<_> = inner.requires_password.values().cloned().collect();
        devices.sort_by_key(DeviceDescriptor::credential_key);
        devices
    }

    /// Give a waiting device a password; a new token is generated for it.
    pub fn provide_password(&self, device: &DeviceDescriptor, password: &str) {
        let key = device.credential_key();
        let mut inner = self.inner.lock();
        inner.requires_password.remove(&key);
        inner.records.insert(
            key,
            CredentialRecord {
                token: generate_token(),
                one_time_password: Some(password.to_string()),
            },
        );
        self.persist(&inner);
    }

    fn mark_requires_password(inner: &mut Inner, device: &DeviceDescriptor) {
        let key = device.credential_key();
        if !inner.requires_password.contains_key(&key) {
            debug!(
                "[CREDENTIALS] {} ({}) requires a password to authenticate",
                device.name,
                device.identifier()
            );
            inner.requires_password.insert(key, device.clone());
        }
    }

    fn persist(&self, inner: &Inner) {
        let Some(path) = &self.path else {
            return;
        };
        let mut keys: Vec<_> = inner.records.keys().collect();
        keys.sort();
        let mut text = String::new();
        for key in keys {
            text.push_str(key);
            text.push('\n');
            text.push_str(&inner.records[key].token);
            text.push('\n');
        }
        if let Err(e) = fs::write(path, text) {
            warn!("[CREDENTIALS] failed to write {}: {}", path.display(), e);
        }
    }
}

fn parse_records(text: &str) -> HashMap<String, CredentialRecord> {
    let mut records = HashMap::new();
    let mut lines = text.lines();
    while let (Some(key), Some(token)) = (lines.next(), lines.next()) {
        records.insert(key.to_string(), CredentialRecord::new(token));
    }
    records
}

/// 64 characters from `[a-zA-Z0-9]`.
pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn device(name: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            interface: "eth0".into(),
            name: name.into(),
            ip: "10.0.0.5".parse().unwrap(),
            port: 7990,
            device_type: 3,
            data: String::new(),
        }
    }

    #[test]
    fn test_token_shape() {
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_LENGTH);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn test_unknown_device_without_password() {
        let store = CredentialStore::in_memory(None);
        let dev = device("hall");

        assert!(!store.can_authenticate(&dev));
        assert!(!store.can_authenticate(&dev));
        assert_eq!(store.requires_password(), vec![dev.clone()]);
        assert!(store.authentication_message(&dev).is_none());
    }

    #[test]
    fn test_default_password_used_once() {
        let store = CredentialStore::in_memory(Some("hunter2".into()));
        let dev = device("hall");

        assert!(store.can_authenticate(&dev));
        let first = store.authentication_message(&dev).unwrap();
        let token = first["authentication"]["token"].as_str().unwrap().to_string();
        assert_eq!(token.len(), TOKEN_LENGTH);
        assert_eq!(first["authentication"]["password"], "hunter2");

        let second = store.authentication_message(&dev).unwrap();
        assert_eq!(second["authentication"]["token"], token.as_str());
        assert_eq!(second["authentication"]["password"], "");
    }

    #[test]
    fn test_empty_default_password_is_none() {
        let store = CredentialStore::in_memory(Some(String::new()));
        assert!(!store.can_authenticate(&device("hall")));
    }

    #[test]
    fn test_file_roundtrip_and_rotation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials");
        let dev = device("kitchen");

        let store = CredentialStore::load(&path, Some("pw".into())).unwrap();
        assert!(store.can_authenticate(&dev));
        let token = store.get(&dev.credential_key()).unwrap().token;

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, format!("kitchen:10.0.0.5:7990\n{}\n", token));

        let reloaded = CredentialStore::load(&path, None).unwrap();
        let record = reloaded.get(&dev.credential_key()).unwrap();
        assert_eq!(record.token, token);
        assert_eq!(record.one_time_password, None);
        assert!(reloaded.can_authenticate(&dev));

        reloaded.invalidate(&dev);
        assert!(reloaded.get(&dev.credential_key()).is_none());
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
        assert_eq!(reloaded.requires_password(), vec![dev.clone()]);

        reloaded.provide_password(&dev, "fresh");
        assert!(reloaded.requires_password().is_empty());
        let auth = reloaded.authentication_message(&dev).unwrap();
        assert_eq!(auth["authentication"]["password"], "fresh");
        assert_ne!(auth["authentication"]["token"], token.as_str());
    }

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::load(dir.path().join("absent"), None).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_odd_trailing_line_ignored() {
        let records = parse_records("a:1.2.3.4:1\ntok\nb:dangling\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records["a:1.2.3.4:1"].token, "tok");
    }

    #[test]
    fn test_unreadable_path_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            CredentialStore::load(dir.path(), None),
            Err(CredentialError::Io { .. })
        ));
    }
}
