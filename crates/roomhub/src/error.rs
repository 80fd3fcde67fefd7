// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types shared across the hub.
//!
//! Connection-level failures never surface here: the reactor handles them by
//! deregistering the connection. These enums cover the operations a caller
//! can act on (startup, registration, relay setup).

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Failure to add a connection to the [`Multiplexer`](crate::Multiplexer).
#[derive(Debug, Error)]
pub enum RegisterError {
    /// A live connection already owns this `ip:port` identifier.
    #[error("connection {0} is already registered")]
    Duplicate(String),

    /// The socket could not be added to the poll set.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Credential file failures.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Relay channel and room registration errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The relay or HTTP URL could not be turned into a request.
    #[error("invalid relay URL: {0}")]
    InvalidUrl(String),

    /// Socket level failure while connecting.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The websocket upgrade was refused or failed.
    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    /// A `wss://` URL was configured without the `relay-tls` feature.
    #[error("wss:// requires the relay-tls feature")]
    TlsUnavailable,

    /// HTTP client construction failed.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Startup failures. Any of these aborts [`Hub::start`](crate::Hub::start).
#[derive(Debug, Error)]
pub enum HubError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("credential error: {0}")]
    Credentials(#[from] CredentialError),

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
}
