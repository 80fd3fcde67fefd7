// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Room registration over HTTP.
//!
//! The first time a device reports its room id, the hub announces the room
//! with a multipart `POST {http_base}/api/rooms/`. The request runs on a
//! short-lived worker thread; its outcome is only logged.

use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};
use reqwest::blocking::multipart::Form;
use reqwest::blocking::Client;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;

use crate::discovery::DeviceDescriptor;
use crate::error::RelayError;

/// Everything the registration endpoint is told about a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRegistration {
    /// The room id reported by the device.
    pub identifier: String,
    pub room_name: String,
    pub interface: String,
    pub ip: String,
    pub port: u16,
    pub device_type: u8,
    pub data: String,
}

impl RoomRegistration {
    pub fn new(room_id: impl Into<String>, device: &DeviceDescriptor) -> Self {
        Self {
            identifier: room_id.into(),
            room_name: device.name.clone(),
            interface: device.interface.clone(),
            ip: device.ip.to_string(),
            port: device.port,
            device_type: device.device_type,
            data: device.data.clone(),
        }
    }

    fn into_form(self) -> Form {
        Form::new()
            .text("identifier", self.identifier)
            .text("room_name", self.room_name)
            .text("interface", self.interface)
            .text("ip", self.ip)
            .text("port", self.port.to_string())
            .text("type", self.device_type.to_string())
            .text("data", self.data)
    }
}

/// Announces newly identified rooms.
pub trait RoomRegistrar: Send + Sync {
    /// Fire-and-forget; must not block the caller.
    fn register_room(&self, registration: RoomRegistration);
}

/// [`RoomRegistrar`] backed by `reqwest::blocking`.
#[derive(Debug, Clone)]
pub struct HttpRoomRegistrar {
    endpoint: String,
    token: Option<String>,
    client: Client,
}

impl HttpRoomRegistrar {
    pub fn new(
        http_base: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RelayError> {
        if !(http_base.starts_with("http://") || http_base.starts_with("https://")) {
            return Err(RelayError::InvalidUrl(http_base.to_string()));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: concat_url(http_base, "api/rooms/"),
            token: token.filter(|t| !t.is_empty()),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send one registration and wait for the status.
    pub fn post(&self, registration: RoomRegistration) -> Result<StatusCode, RelayError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .multipart(registration.into_form());
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("token {}", token));
        }
        Ok(request.send()?.status())
    }
}

impl RoomRegistrar for HttpRoomRegistrar {
    fn register_room(&self, registration: RoomRegistration) {
        let registrar = self.clone();
        let room = registration.identifier.clone();
        let spawned = thread::Builder::new()
            .name("roomhub-register".to_string())
            .spawn(move || match registrar.post(registration) {
                Ok(status) if status.is_success() => {
                    trace!("[RELAY] room {} registered ({})", room, status)
                }
                Ok(status) => warn!("[RELAY] room {} registration answered {}", room, status),
                Err(e) => warn!("[RELAY] room {} registration failed: {}", room, e),
            });
        if let Err(e) = spawned {
            warn!("[RELAY] cannot spawn registration worker: {}", e);
        } else {
            debug!("[RELAY] registering room with {}", self.endpoint);
        }
    }
}

/// Join two URL pieces with exactly one `/` between them.
pub fn concat_url(base: &str, path: &str) -> String {
    if base.is_empty() {
        return path.to_string();
    }
    if path.is_empty() {
        return base.to_string();
    }
    format!(
        "{}/{}",
        base.strip_suffix('/').unwrap_or(base),
        path.strip_prefix('/').unwrap_or(path)
    )
}

/// Stream URL a QR code token resolves to: `{http_base}/stream/{token}/`.
pub fn stream_url(http_base: &str, token: &str) -> String {
    format!("{}/", concat_url(&concat_url(http_base, "stream"), token))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn test_concat_url() {
        assert_eq!(concat_url("https://a.com/", "/api/rooms/"), "https://a.com/api/rooms/");
        assert_eq!(concat_url("https://a.com", "api"), "https://a.com/api");
        assert_eq!(concat_url("", "api"), "api");
        assert_eq!(concat_url("https://a.com/", ""), "https://a.com/");
    }

    #[test]
    fn test_stream_url() {
        assert_eq!(
            stream_url("https://www.verboze.com/", "abc123"),
            "https://www.verboze.com/stream/abc123/"
        );
    }

    #[test]
    fn test_rejects_non_http_base() {
        assert!(matches!(
            HttpRoomRegistrar::new("ftp://x", None, Duration::from_secs(1)),
            Err(RelayError::InvalidUrl(_))
        ));
    }

    /// Read one HTTP request (Content-Length or chunked body).
    fn read_request(stream: &mut std::net::TcpStream) -> String {
        let mut data = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&data).to_string();
            let Some(header_end) = text.find("\r\n\r\n") else {
                continue;
            };
            let headers = text[..header_end].to_ascii_lowercase();
            let body_len = data.len() - header_end - 4;
            let content_length = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok());
            match content_length {
                Some(len) if body_len >= len => break,
                Some(_) => continue,
                None if text.ends_with("0\r\n\r\n") => break,
                None => continue,
            }
        }
        String::from_utf8_lossy(&data).to_string()
    }

    #[test]
    fn test_post_sends_multipart_form() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}/", listener.local_addr().unwrap());
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let request = read_request(&mut stream);
            stream
                .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .unwrap();
            request
        });

        let registrar =
            HttpRoomRegistrar::new(&base, Some("hubtoken".into()), Duration::from_secs(5)).unwrap();
        let device = DeviceDescriptor {
            interface: "eth0".into(),
            name: "kitchen".into(),
            ip: "10.0.0.9".parse().unwrap(),
            port: 7990,
            device_type: 3,
            data: "fw2".into(),
        };
        let status = registrar.post(RoomRegistration::new("room1", &device)).unwrap();
        assert_eq!(status, StatusCode::CREATED);

        let request = server.join().unwrap();
        let lowered = request.to_ascii_lowercase();
        assert!(request.starts_with("POST /api/rooms/ HTTP/1.1"));
        assert!(lowered.contains("authorization: token hubtoken"));
        assert!(lowered.contains("content-type: multipart/form-data"));
        for (name, value) in [
            ("identifier", "room1"),
            ("room_name", "kitchen"),
            ("interface", "eth0"),
            ("ip", "10.0.0.9"),
            ("port", "7990"),
            ("type", "3"),
            ("data", "fw2"),
        ] {
            let field = format!("name=\"{}\"\r\n\r\n{}\r\n", name, value);
            assert!(request.contains(&field), "missing field {}", name);
        }
    }
}
