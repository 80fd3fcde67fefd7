// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Persistent websocket to the cloud relay.
//!
//! ```text
//!   send_command()            roomhub-relay thread
//!   ----------------          ------------------------------------------
//!   push to Outbox   --wake-> flush Outbox -> websocket (text frames)
//!                             websocket -> JSON -> command callback
//!                             on close: backoff, reconnect, resume
//! ```
//!
//! The outbound queue and the connected flag share one mutex. Commands
//! queued while disconnected stay queued and go out after the next
//! handshake; a message whose send fails is put back at the front.

use std::collections::VecDeque;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use serde_json::Value;
use tungstenite::client::IntoClientRequest;
use tungstenite::error::UrlError;
use tungstenite::handshake::client::Request;
use tungstenite::handshake::HandshakeError;
use tungstenite::http::header::AUTHORIZATION;
use tungstenite::http::HeaderValue;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use super::backoff::{ReconnectBackoff, ReconnectPolicy};
use super::{CommandCallback, RelayLink};
use crate::error::RelayError;

/// Default relay endpoint.
pub const DEFAULT_RELAY_URL: &str = "wss://www.verboze.com/stream/hub/";

const WAKER_TOKEN: Token = Token(0);
const SOCKET_TOKEN: Token = Token(1);
const MAX_EVENTS: usize = 16;

/// Relay channel settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// `ws://` or `wss://` endpoint.
    pub url: String,
    /// Sent as `Authorization: token <token>` on the upgrade request.
    pub token: Option<String>,
    pub reconnect: ReconnectPolicy,
    /// Bound on TCP connect and on each handshake read/write.
    pub io_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_RELAY_URL.to_string(),
            token: None,
            reconnect: ReconnectPolicy::default(),
            io_timeout: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Default)]
struct Outbox {
    queue: VecDeque<Value>,
    connected: bool,
}

#[derive(Debug, Default)]
struct RelayMetrics {
    sent: AtomicU64,
    received: AtomicU64,
    invalid: AtomicU64,
    connects: AtomicU64,
    failed_connects: AtomicU64,
}

/// Plain copy of the relay counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayMetricsSnapshot {
    pub sent: u64,
    pub received: u64,
    /// Inbound frames that were not JSON.
    pub invalid: u64,
    /// Successful handshakes.
    pub connects: u64,
    pub failed_connects: u64,
    pub queued: u64,
}

struct Shared {
    outbox: Mutex<Outbox>,
    callback: Mutex<Option<CommandCallback>>,
    running: AtomicBool,
    metrics: RelayMetrics,
}

/// Handle to the relay pump thread.
pub struct RelayChannel {
    shared: Arc<Shared>,
    waker: Arc<Waker>,
    thread: Mutex<Option<JoinHandle<()>>>,
    url: String,
}

impl RelayChannel {
    /// Validate the URL and start the pump. The first connection attempt
    /// happens on the pump thread.
    pub fn spawn(config: RelayConfig) -> Result<Self, RelayError> {
        let request = build_request(&config)?;
        if request.uri().scheme_str() == Some("wss") && !cfg!(feature = "relay-tls") {
            return Err(RelayError::TlsUnavailable);
        }

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let shared = Arc::new(Shared {
            outbox: Mutex::new(Outbox::default()),
            callback: Mutex::new(None),
            running: AtomicBool::new(true),
            metrics: RelayMetrics::default(),
        });

        let url = config.url.clone();
        let pump = Pump {
            poll,
            shared: Arc::clone(&shared),
            config,
        };
        let handle = thread::Builder::new()
            .name("roomhub-relay".to_string())
            .spawn(move || pump.run())?;

        Ok(Self {
            shared,
            waker,
            thread: Mutex::new(Some(handle)),
            url,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.shared.outbox.lock().connected
    }

    /// Commands waiting to be sent.
    pub fn queued(&self) -> usize {
        self.shared.outbox.lock().queue.len()
    }

    pub fn metrics(&self) -> RelayMetricsSnapshot {
        let m = &self.shared.metrics;
        RelayMetricsSnapshot {
            sent: m.sent.load(Ordering::Relaxed),
            received: m.received.load(Ordering::Relaxed),
            invalid: m.invalid.load(Ordering::Relaxed),
            connects: m.connects.load(Ordering::Relaxed),
            failed_connects: m.failed_connects.load(Ordering::Relaxed),
            queued: self.queued() as u64,
        }
    }

    /// Close the websocket and join the pump thread.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.waker.wake() {
            warn!("[RELAY] wake failed: {}", e);
        }
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("[RELAY] pump thread panicked");
            }
        }
        info!("[RELAY] shut down");
    }
}

impl RelayLink for RelayChannel {
    fn send_command(&self, command: Value) {
        let connected = {
            let mut outbox = self.shared.outbox.lock();
            outbox.queue.push_back(command);
            outbox.connected
        };
        if connected {
            if let Err(e) = self.waker.wake() {
                warn!("[RELAY] wake failed: {}", e);
            }
        }
    }

    fn set_command_callback(&self, callback: CommandCallback) {
        *self.shared.callback.lock() = Some(callback);
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn build_request(config: &RelayConfig) -> Result<Request, RelayError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| RelayError::InvalidUrl(format!("{}: {}", config.url, e)))?;

    match request.uri().scheme_str() {
        Some("ws") | Some("wss") => {}
        _ => return Err(RelayError::InvalidUrl(config.url.clone())),
    }
    if request.uri().host().is_none() {
        return Err(RelayError::InvalidUrl(config.url.clone()));
    }

    if let Some(token) = config.token.as_deref().filter(|t| !t.is_empty()) {
        let value = HeaderValue::from_str(&format!("token {}", token))
            .map_err(|e| RelayError::InvalidUrl(format!("authorization header: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

fn handshake_error<S>(err: HandshakeError<S>) -> RelayError
where
    S: tungstenite::handshake::HandshakeRole,
{
    match err {
        HandshakeError::Interrupted(_) => RelayError::Handshake("handshake timed out".into()),
        HandshakeError::Failure(tungstenite::Error::Url(UrlError::TlsFeatureNotEnabled)) => {
            RelayError::TlsUnavailable
        }
        HandshakeError::Failure(tungstenite::Error::Io(e)) => RelayError::Io(e),
        HandshakeError::Failure(e) => RelayError::Handshake(e.to_string()),
    }
}

// ============================================================================
// Pump thread
// ============================================================================

struct Session {
    socket: WebSocket<MaybeTlsStream<TcpStream>>,
    /// Clone of the raw socket used for readiness polling.
    control: TcpStream,
}

struct Pump {
    poll: Poll,
    shared: Arc<Shared>,
    config: RelayConfig,
}

impl Pump {
    fn running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn run(mut self) {
        let mut backoff = ReconnectBackoff::new(self.config.reconnect);

        while self.running() {
            match self.open() {
                Ok(session) => {
                    backoff.reset();
                    self.shared.metrics.connects.fetch_add(1, Ordering::Relaxed);
                    info!("[RELAY] connected to {}", self.config.url);
                    self.serve(session);
                    info!("[RELAY] disconnected from {}", self.config.url);
                }
                Err(e) => {
                    self.shared
                        .metrics
                        .failed_connects
                        .fetch_add(1, Ordering::Relaxed);
                    warn!("[RELAY] connect to {} failed: {}", self.config.url, e);
                }
            }

            if !self.running() {
                break;
            }
            let delay = backoff.next_delay();
            debug!("[RELAY] reconnecting in {:?}", delay);
            self.pause(delay);
        }
        debug!("[RELAY] pump stopped");
    }

    /// Sleep until `delay` elapses or shutdown is requested.
    fn pause(&mut self, delay: Duration) {
        let deadline = Instant::now() + delay;
        let mut events = Events::with_capacity(MAX_EVENTS);
        while self.running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if let Err(e) = self.poll.poll(&mut events, Some(deadline - now)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    warn!("[RELAY] poll failed: {}", e);
                    break;
                }
            }
        }
    }

    fn open(&self) -> Result<Session, RelayError> {
        let request = build_request(&self.config)?;
        let uri = request.uri();
        let host = uri
            .host()
            .ok_or_else(|| RelayError::InvalidUrl(self.config.url.clone()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let default_port = if uri.scheme_str() == Some("wss") { 443 } else { 80 };
        let port = uri.port_u16().unwrap_or(default_port);

        let addr = (host.as_str(), port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{} did not resolve", host)))?;

        let tcp = TcpStream::connect_timeout(&addr, self.config.io_timeout)?;
        tcp.set_read_timeout(Some(self.config.io_timeout))?;
        tcp.set_write_timeout(Some(self.config.io_timeout))?;
        tcp.set_nodelay(true)?;
        let control = tcp.try_clone()?;

        let (socket, response) =
            tungstenite::client_tls_with_config(request, tcp, None, None).map_err(handshake_error)?;
        trace!("[RELAY] handshake answered {}", response.status());

        control.set_read_timeout(None)?;
        control.set_write_timeout(None)?;
        control.set_nonblocking(true)?;
        Ok(Session { socket, control })
    }

    fn serve(&mut self, session: Session) {
        let Session {
            mut socket,
            control,
        } = session;
        let fd = control.as_raw_fd();
        if let Err(e) = self.poll.registry().register(
            &mut SourceFd(&fd),
            SOCKET_TOKEN,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            warn!("[RELAY] cannot poll relay socket: {}", e);
            return;
        }
        self.shared.outbox.lock().connected = true;

        // Frames that arrived with the handshake response are already in the
        // websocket's buffer and will not raise a readable event.
        if self.read_all(&mut socket) {
            self.pump_session(&mut socket);
        }

        self.shared.outbox.lock().connected = false;
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            trace!("[RELAY] deregister: {}", e);
        }
    }

    /// Service one established session until it ends or shutdown is requested.
    fn pump_session(&mut self, socket: &mut WebSocket<MaybeTlsStream<TcpStream>>) {
        let mut events = Events::with_capacity(MAX_EVENTS);
        'session: loop {
            if !self.running() {
                let _ = socket.close(None);
                let _ = socket.flush();
                break;
            }
            if !self.flush_outbox(socket) {
                break;
            }

            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("[RELAY] poll failed: {}", e);
                break;
            }

            for event in events.iter() {
                if event.token() != SOCKET_TOKEN {
                    continue;
                }
                if (event.is_readable() || event.is_read_closed()) && !self.read_all(socket) {
                    break 'session;
                }
                if event.is_error() {
                    debug!("[RELAY] socket error event");
                    break 'session;
                }
                match socket.flush() {
                    Ok(()) => {}
                    Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        debug!("[RELAY] flush failed: {}", e);
                        break 'session;
                    }
                }
            }
        }
    }

    /// Send everything queued. Returns `false` when the session is dead.
    fn flush_outbox(&self, socket: &mut WebSocket<MaybeTlsStream<TcpStream>>) -> bool {
        loop {
            let next = self.shared.outbox.lock().queue.pop_front();
            let Some(command) = next else {
                return true;
            };

            match socket.send(Message::Text(command.to_string())) {
                Ok(()) => {
                    self.shared.metrics.sent.fetch_add(1, Ordering::Relaxed);
                }
                // Accepted into the websocket's buffer; finished on writability.
                Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.shared.metrics.sent.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(e) => {
                    warn!("[RELAY] send failed, keeping command queued: {}", e);
                    self.shared.outbox.lock().queue.push_front(command);
                    return false;
                }
            }
        }
    }

    /// Read until the socket is drained. Returns `false` when the session
    /// is over.
    fn read_all(&self, socket: &mut WebSocket<MaybeTlsStream<TcpStream>>) -> bool {
        loop {
            match socket.read() {
                Ok(Message::Text(text)) => self.dispatch(text.as_bytes()),
                Ok(Message::Binary(data)) => self.dispatch(&data),
                Ok(Message::Close(frame)) => debug!("[RELAY] close requested: {:?}", frame),
                Ok(_) => {}
                Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    return true;
                }
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return false;
                }
                Err(e) => {
                    warn!("[RELAY] read failed: {}", e);
                    return false;
                }
            }
        }
    }

    fn dispatch(&self, payload: &[u8]) {
        let command = match serde_json::from_slice::<Value>(payload) {
            Ok(command) => command,
            Err(e) => {
                self.shared.metrics.invalid.fetch_add(1, Ordering::Relaxed);
                warn!("[RELAY] dropping invalid command ({} bytes): {}", payload.len(), e);
                return;
            }
        };
        self.shared.metrics.received.fetch_add(1, Ordering::Relaxed);

        let callback = self.shared.callback.lock().clone();
        match callback {
            Some(callback) => callback(command),
            None => debug!("[RELAY] no command callback, dropping command"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use tungstenite::handshake::server::{Request as ServerRequest, Response};

    const WAIT: Duration = Duration::from_secs(5);

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    fn local_config(listener: &TcpListener) -> RelayConfig {
        RelayConfig {
            url: format!("ws://{}/stream/hub/", listener.local_addr().unwrap()),
            token: Some("t0k".into()),
            reconnect: ReconnectPolicy {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(50),
            },
            io_timeout: WAIT,
        }
    }

    #[test]
    fn test_rejects_bad_urls() {
        for url in ["not a url", "http://example.com/", "ws:///nohost"] {
            let config = RelayConfig {
                url: url.to_string(),
                ..Default::default()
            };
            assert!(
                matches!(RelayChannel::spawn(config), Err(RelayError::InvalidUrl(_))),
                "{} accepted",
                url
            );
        }
    }

    #[cfg(not(feature = "relay-tls"))]
    #[test]
    fn test_wss_requires_tls_feature() {
        let config = RelayConfig {
            url: "wss://example.com/".into(),
            ..Default::default()
        };
        assert!(matches!(
            RelayChannel::spawn(config),
            Err(RelayError::TlsUnavailable)
        ));
    }

    #[test]
    fn test_queued_command_flushed_after_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = local_config(&listener);

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let (auth_tx, auth_rx) = mpsc::channel();
            let mut ws = tungstenite::accept_hdr(stream, |req: &ServerRequest, resp: Response| {
                let auth = req
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                auth_tx.send(auth).unwrap();
                Ok(resp)
            })
            .unwrap();
            let message = ws.read().unwrap();
            (auth_rx.recv().unwrap(), message)
        });

        let relay = RelayChannel::spawn(config).unwrap();
        relay.send_command(json!({"__room_id": "room1", "temp": 20}));

        let (auth, message) = server.join().unwrap();
        assert_eq!(auth.as_deref(), Some("token t0k"));
        let Message::Text(text) = message else {
            panic!("expected a text frame, got {:?}", message);
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"__room_id": "room1", "temp": 20}));

        assert!(wait_until(|| relay.metrics().sent == 1));
        assert_eq!(relay.queued(), 0);
        relay.shutdown();
    }

    #[test]
    fn test_inbound_commands_reach_callback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = local_config(&listener);
        let (ready_tx, ready_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut ws = tungstenite::accept(stream).unwrap();
            ready_rx.recv_timeout(WAIT).unwrap();
            ws.send(Message::Text("not json".into())).unwrap();
            ws.send(Message::Text(r#"{"__room_id":"r1","code":0}"#.into()))
                .unwrap();
            let _ = done_rx.recv_timeout(WAIT);
        });

        let relay = RelayChannel::spawn(config).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        relay.set_command_callback(Arc::new(move |command: Value| sink.lock().push(command)));
        ready_tx.send(()).unwrap();

        assert!(wait_until(|| !seen.lock().is_empty()));
        assert_eq!(seen.lock()[0], json!({"__room_id": "r1", "code": 0}));
        assert_eq!(relay.metrics().invalid, 1);
        assert_eq!(relay.metrics().received, 1);

        done_tx.send(()).unwrap();
        server.join().unwrap();
        relay.shutdown();
    }

    /// Upgrade by hand so the 101 response and the first frame leave in a
    /// single write and reach the client in the handshake read.
    fn accept_with_trailing_frame(stream: &mut std::net::TcpStream, payload: &str) {
        use std::io::{Read, Write};

        let mut request = Vec::new();
        let mut byte = [0u8; 1];
        while !request.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).unwrap();
            request.push(byte[0]);
        }
        let request = String::from_utf8(request).unwrap();
        let key = request
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("sec-websocket-key")
                    .then(|| value.trim().to_string())
            })
            .unwrap();

        let mut reply = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            tungstenite::handshake::derive_accept_key(key.as_bytes())
        )
        .into_bytes();
        assert!(payload.len() < 126);
        reply.push(0x81);
        reply.push(payload.len() as u8);
        reply.extend_from_slice(payload.as_bytes());
        stream.write_all(&reply).unwrap();
    }

    #[test]
    fn test_frame_sent_with_handshake_response_is_dispatched() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = local_config(&listener);
        let (ready_tx, ready_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let server = thread::spawn(move || {
            ready_rx.recv_timeout(WAIT).unwrap();
            let (mut stream, _) = listener.accept().unwrap();
            accept_with_trailing_frame(&mut stream, r#"{"__room_id":"r1","code":0}"#);
            let _ = done_rx.recv_timeout(WAIT);
        });

        let relay = RelayChannel::spawn(config).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        relay.set_command_callback(Arc::new(move |command: Value| sink.lock().push(command)));
        ready_tx.send(()).unwrap();

        assert!(wait_until(|| !seen.lock().is_empty()));
        assert_eq!(seen.lock()[0], json!({"__room_id": "r1", "code": 0}));
        assert_eq!(relay.metrics().received, 1);
        assert!(relay.is_connected());

        done_tx.send(()).unwrap();
        server.join().unwrap();
        relay.shutdown();
    }

    #[test]
    fn test_reconnects_after_server_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = local_config(&listener);

        let server = thread::spawn(move || {
            let (first, _) = listener.accept().unwrap();
            let ws = tungstenite::accept(first).unwrap();
            drop(ws);

            let (second, _) = listener.accept().unwrap();
            let mut ws = tungstenite::accept(second).unwrap();
            ws.read().unwrap()
        });

        let relay = RelayChannel::spawn(config).unwrap();
        assert!(wait_until(|| relay.metrics().connects >= 2));
        relay.send_command(json!({"after": "reconnect"}));

        let message = server.join().unwrap();
        assert_eq!(message, Message::Text(r#"{"after":"reconnect"}"#.into()));
        relay.shutdown();
    }

    #[test]
    fn test_commands_kept_while_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = local_config(&listener);
        drop(listener);

        let relay = RelayChannel::spawn(config).unwrap();
        relay.send_command(json!({"a": 1}));
        relay.send_command(json!({"b": 2}));

        assert!(wait_until(|| relay.metrics().failed_connects >= 2));
        assert!(!relay.is_connected());
        assert_eq!(relay.queued(), 2);
        relay.shutdown();
    }
}
