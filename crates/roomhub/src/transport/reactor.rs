// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection multiplexer.
//!
//! One thread owns the `mio::Poll` and dispatches readiness to the
//! registered connections. The registry itself is shared: any thread may
//! register, look up or deregister a connection, and writers wake the
//! poll through a `mio::Waker`.
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                     roomhub-reactor                          |
//! |  +-------------------------------------------------------+  |
//! |  |                      mio::Poll                         |  |
//! |  |  - optional TcpListener (acceptor closure)            |  |
//! |  |  - one TcpStream per registered connection            |  |
//! |  |  - Waker (writes, register/deregister, shutdown)      |  |
//! |  +-------------------------------------------------------+  |
//! |         |                      |                     |       |
//! |         v                      v                     v       |
//! |  +-------------+      +-----------------+    +-------------+ |
//! |  | on_readable |      |   on_writable   |    |  interest   | |
//! |  |  -> handler |      | flush queue     |    |  resync     | |
//! |  +-------------+      +-----------------+    +-------------+ |
//! +-------------------------------------------------------------+
//!            ^ RwLock<Registry> (by token, by identifier)
//!            | register / deregister / get / list from any thread
//! ```
//!
//! Read interest is always set; write interest only while a connection's
//! write queue is non-empty after an opportunistic flush.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::{Mutex, RwLock};

use super::connection::{identifier_for, Connection, ConnectionHandler};
use super::frame_codec::MAX_FRAME_SIZE;
use super::metrics::{ReactorMetrics, ReactorMetricsSnapshot};
use crate::error::RegisterError;

// ============================================================================
// Constants
// ============================================================================

/// Token for the optional listener
const LISTENER_TOKEN: Token = Token(0);

/// Token for the waker
const WAKER_TOKEN: Token = Token(1);

/// Starting token for connections
const CONNECTION_TOKEN_START: usize = 2;

/// Upper bound on a single poll; wake-ups normally arrive sooner.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Maximum events to process per poll
const MAX_EVENTS: usize = 128;

// ============================================================================
// Configuration
// ============================================================================

/// Multiplexer settings.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Largest accepted frame payload, inbound and outbound.
    pub max_frame_size: usize,
    /// Set `TCP_NODELAY` on registered sockets.
    pub nodelay: bool,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            nodelay: true,
        }
    }
}

/// Builds a handler for an accepted peer; `None` refuses the connection.
pub type Acceptor<H> = Box<dyn Fn(SocketAddr) -> Option<H> + Send + 'static>;

// ============================================================================
// Registry
// ============================================================================

struct Registry<H: ConnectionHandler> {
    by_token: HashMap<Token, Arc<Connection<H>>>,
    by_identifier: HashMap<String, Token>,
}

impl<H: ConnectionHandler> Registry<H> {
    fn new() -> Self {
        Self {
            by_token: HashMap::new(),
            by_identifier: HashMap::new(),
        }
    }
}

struct Shared<H: ConnectionHandler> {
    registry: RwLock<Registry<H>>,
    poll_registry: mio::Registry,
    waker: Arc<Waker>,
    running: AtomicBool,
    next_token: AtomicUsize,
    metrics: Arc<ReactorMetrics>,
    config: MultiplexerConfig,
    local_addr: Option<SocketAddr>,
    thread: Mutex<Option<JoinHandle<()>>>,
    /// Live `Multiplexer` handles, not counting the reactor thread's own.
    handles: AtomicUsize,
}

impl<H: ConnectionHandler> Shared<H> {
    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!("[REACTOR] wake failed: {}", e);
        }
    }

    fn lookup(&self, token: Token) -> Option<Arc<Connection<H>>> {
        self.registry.read().by_token.get(&token).cloned()
    }

    fn snapshot(&self) -> Vec<Arc<Connection<H>>> {
        self.registry.read().by_token.values().cloned().collect()
    }

    /// Remove `connection` if it is still the registered instance.
    fn remove(&self, connection: &Arc<Connection<H>>) -> bool {
        {
            let mut registry = self.registry.write();
            match registry.by_token.get(&connection.token()) {
                Some(current) if Arc::ptr_eq(current, connection) => {}
                _ => return false,
            }
            registry.by_token.remove(&connection.token());
            if registry.by_identifier.get(connection.identifier()) == Some(&connection.token()) {
                registry.by_identifier.remove(connection.identifier());
            }
        }

        {
            let mut stream = connection.stream().lock();
            if let Err(e) = self.poll_registry.deregister(&mut *stream) {
                trace!("[REACTOR] deregister {}: {}", connection.identifier(), e);
            }
        }
        connection.close();
        connection.handler().on_close(connection);
        self.metrics.record_connection_closed();
        info!("[REACTOR] deregistered {}", connection.identifier());
        self.wake();
        true
    }
}

// ============================================================================
// Multiplexer
// ============================================================================

/// Handle to the reactor thread and its connection registry.
///
/// Cheap to clone; every clone drives the same reactor. Dropping the last
/// handle shuts the reactor down.
pub struct Multiplexer<H: ConnectionHandler> {
    shared: Arc<Shared<H>>,
    counted: bool,
}

impl<H: ConnectionHandler> Clone for Multiplexer<H> {
    fn clone(&self) -> Self {
        self.shared.handles.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: Arc::clone(&self.shared),
            counted: true,
        }
    }
}

impl<H: ConnectionHandler> Drop for Multiplexer<H> {
    fn drop(&mut self) {
        if self.counted && self.shared.handles.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shutdown();
        }
    }
}

impl<H: ConnectionHandler> Multiplexer<H> {
    /// Start a reactor with no listening socket.
    pub fn spawn(config: MultiplexerConfig) -> io::Result<Self> {
        Self::start(config, None)
    }

    /// Start a reactor that also accepts connections on `addr`.
    ///
    /// `acceptor` runs on the reactor thread for each accepted peer.
    pub fn spawn_with_listener<A>(
        config: MultiplexerConfig,
        addr: SocketAddr,
        acceptor: A,
    ) -> io::Result<Self>
    where
        A: Fn(SocketAddr) -> Option<H> + Send + 'static,
    {
        let listener = TcpListener::bind(addr)?;
        Self::start(config, Some((listener, Box::new(acceptor))))
    }

    fn start(
        config: MultiplexerConfig,
        mut listener: Option<(TcpListener, Acceptor<H>)>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let mut local_addr = None;
        if let Some((listener, _)) = listener.as_mut() {
            poll.registry()
                .register(listener, LISTENER_TOKEN, Interest::READABLE)?;
            local_addr = Some(listener.local_addr()?);
        }

        let shared = Arc::new(Shared {
            registry: RwLock::new(Registry::new()),
            poll_registry: poll.registry().try_clone()?,
            waker,
            running: AtomicBool::new(true),
            next_token: AtomicUsize::new(CONNECTION_TOKEN_START),
            metrics: Arc::new(ReactorMetrics::new()),
            config,
            local_addr,
            thread: Mutex::new(None),
            handles: AtomicUsize::new(1),
        });

        let multiplexer = Self {
            shared,
            counted: true,
        };
        let runner = Self {
            shared: Arc::clone(&multiplexer.shared),
            counted: false,
        };
        let handle = thread::Builder::new()
            .name("roomhub-reactor".to_string())
            .spawn(move || runner.run(poll, listener))?;
        *multiplexer.shared.thread.lock() = Some(handle);

        if let Some(addr) = local_addr {
            info!("[REACTOR] listening on {}", addr);
        }
        Ok(multiplexer)
    }

    /// Address of the listening socket, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Add an already connected, non-blocking socket to the registry.
    ///
    /// Fails with [`RegisterError::Duplicate`] when a live connection has
    /// the same `ip:port` identifier.
    pub fn register(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        handler: H,
    ) -> Result<Arc<Connection<H>>, RegisterError> {
        if !self.is_running() {
            return Err(RegisterError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "multiplexer stopped",
            )));
        }

        let identifier = identifier_for(&peer);
        let connection = {
            let mut registry = self.shared.registry.write();
            if registry.by_identifier.contains_key(&identifier) {
                self.shared.metrics.record_duplicate_rejected();
                warn!("[REACTOR] rejecting duplicate connection {}", identifier);
                return Err(RegisterError::Duplicate(identifier));
            }

            if let Err(e) = stream.set_nodelay(self.shared.config.nodelay) {
                debug!("[REACTOR] set_nodelay on {}: {}", identifier, e);
            }

            let token = Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
            self.shared
                .poll_registry
                .register(&mut stream, token, Interest::READABLE)?;

            let connection = Arc::new(Connection::new(
                token,
                stream,
                peer,
                handler,
                self.shared.config.max_frame_size,
                Arc::clone(&self.shared.waker),
                Arc::clone(&self.shared.metrics),
            ));
            registry.by_token.insert(token, Arc::clone(&connection));
            registry.by_identifier.insert(identifier, token);
            connection
        };

        self.shared.metrics.record_connection_opened();
        info!(
            "[REACTOR] registered {} ({:?})",
            connection.identifier(),
            connection.token()
        );
        self.shared.wake();
        Ok(connection)
    }

    /// Connect to `addr` with a bounded wait and register the socket.
    pub fn connect(
        &self,
        addr: SocketAddr,
        timeout: Duration,
        handler: H,
    ) -> Result<Arc<Connection<H>>, RegisterError> {
        let identifier = identifier_for(&addr);
        if self.is_registered(&identifier) {
            self.shared.metrics.record_duplicate_rejected();
            return Err(RegisterError::Duplicate(identifier));
        }

        let stream = std::net::TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nonblocking(true)?;
        self.register(TcpStream::from_std(stream), addr, handler)
    }

    /// Remove the connection registered under `identifier`.
    pub fn deregister(&self, identifier: &str) -> bool {
        match self.get(identifier) {
            Some(connection) => self.shared.remove(&connection),
            None => false,
        }
    }

    /// Remove this exact connection instance.
    pub fn deregister_connection(&self, connection: &Arc<Connection<H>>) -> bool {
        self.shared.remove(connection)
    }

    pub fn is_registered(&self, identifier: &str) -> bool {
        self.shared
            .registry
            .read()
            .by_identifier
            .contains_key(identifier)
    }

    pub fn get(&self, identifier: &str) -> Option<Arc<Connection<H>>> {
        let registry = self.shared.registry.read();
        let token = registry.by_identifier.get(identifier)?;
        registry.by_token.get(token).cloned()
    }

    /// Snapshot of every registered connection.
    pub fn list(&self) -> Vec<Arc<Connection<H>>> {
        self.shared.snapshot()
    }

    pub fn len(&self) -> usize {
        self.shared.registry.read().by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> ReactorMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Stop the reactor and join its thread.
    ///
    /// The loop finishes its current pass, then deregisters every
    /// connection. Safe to call more than once.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.wake();

        let handle = self.shared.thread.lock().take();
        if let Some(handle) = handle {
            // A handler releasing the last handle runs on the reactor thread
            // itself; the loop exits on its own after this pass.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("[REACTOR] reactor thread panicked");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Reactor thread
    // ------------------------------------------------------------------------

    fn run(self, mut poll: Poll, listener: Option<(TcpListener, Acceptor<H>)>) {
        debug!("[REACTOR] thread started");
        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.is_running() {
            self.sync_interest();

            if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("[REACTOR] poll failed: {}", e);
                break;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {}
                    LISTENER_TOKEN => {
                        if let Some((listener, acceptor)) = listener.as_ref() {
                            self.accept_all(listener, acceptor);
                        }
                    }
                    token => self.dispatch(token, event),
                }
            }
        }

        for connection in self.shared.snapshot() {
            self.shared.remove(&connection);
        }
        debug!("[REACTOR] thread stopped");
    }

    /// Flush pending writes and align write interest with what remains.
    fn sync_interest(&self) {
        for connection in self.shared.snapshot() {
            let mut alive = true;
            if connection.has_pending_writes() {
                alive = connection.on_writable();
            }
            if !alive {
                self.shared.remove(&connection);
                continue;
            }

            let wanted = connection.has_pending_writes();
            if connection.swap_write_interest(wanted) == wanted {
                continue;
            }
            let interest = if wanted {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            let result = {
                let mut stream = connection.stream().lock();
                self.shared
                    .poll_registry
                    .reregister(&mut *stream, connection.token(), interest)
            };
            if let Err(e) = result {
                warn!(
                    "[REACTOR] cannot update interest for {}: {}",
                    connection.identifier(),
                    e
                );
                self.shared.remove(&connection);
            }
        }
    }

    fn dispatch(&self, token: Token, event: &Event) {
        let Some(connection) = self.shared.lookup(token) else {
            trace!("[REACTOR] event for unknown {:?}", token);
            return;
        };

        let mut alive = true;
        if event.is_readable() || event.is_read_closed() {
            alive = connection.on_readable();
        }
        if alive && event.is_writable() {
            alive = connection.on_writable();
        }
        if event.is_error() {
            debug!("[REACTOR] socket error on {}", connection.identifier());
            alive = false;
        }

        if !alive {
            self.shared.remove(&connection);
        }
    }

    fn accept_all(&self, listener: &TcpListener, acceptor: &Acceptor<H>) {
        loop {
            match listener.accept() {
                Ok((stream, peer)) => match acceptor(peer) {
                    Some(handler) => {
                        if let Err(e) = self.register(stream, peer, handler) {
                            warn!("[REACTOR] cannot register accepted {}: {}", peer, e);
                        }
                    }
                    None => debug!("[REACTOR] acceptor refused {}", peer),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("[REACTOR] accept failed: {}", e);
                    break;
                }
            }
        }
    }
}

impl<H: ConnectionHandler> std::fmt::Debug for Multiplexer<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("running", &self.is_running())
            .field("connections", &self.len())
            .field("local_addr", &self.shared.local_addr)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
