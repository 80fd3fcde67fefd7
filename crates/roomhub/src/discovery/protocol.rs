// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery thread.
//!
//! One UDP socket per accepted interface, all polled by a single
//! `roomhub-discovery` thread together with a control waker:
//!
//! - `Broadcast`: re-enumerate interfaces, open sockets for new ones,
//!   recreate changed ones, drop vanished ones, then beacon on all.
//! - `Kill`: leave the loop.
//!
//! The interface map and the active callback share one mutex. Responses are
//! parsed under it, then the callback runs on the discovery thread with the
//! mutex released, so a slow callback never blocks
//! [`initiate_discovery`](DiscoveryProtocol::initiate_discovery). Rebuilds
//! happen on the same thread and therefore never interleave with a callback.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use log::{debug, error, info, warn};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use super::interfaces::{enumerate_ipv4, InterfaceFilter, NetworkInterface};
use super::wire::{beacon, parse_payload, ResponseBuffer, RECV_BUFFER_SIZE};
use super::{
    DeviceDescriptor, DeviceDiscovery, DiscoveryCallback, BROADCAST_PORT, DEFAULT_DEVICE_PORT,
};
use crate::transport::byte_stream::{robust_recv_from, robust_send_to};

const CONTROL_TOKEN: Token = Token(0);
const FIRST_SOCKET_TOKEN: usize = 1;
const MAX_EVENTS: usize = 64;

/// Discovery settings.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub interfaces: InterfaceFilter,
    pub broadcast_port: u16,
    pub default_device_port: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interfaces: InterfaceFilter::all(),
            broadcast_port: BROADCAST_PORT,
            default_device_port: DEFAULT_DEVICE_PORT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlEvent {
    Broadcast,
    Kill,
}

struct Binding {
    interface: NetworkInterface,
    socket: UdpSocket,
    token: Token,
    buffer: ResponseBuffer,
}

#[derive(Default)]
struct Shared {
    callback: Option<DiscoveryCallback>,
    bindings: HashMap<String, Binding>,
}

#[derive(Debug, Default)]
struct DiscoveryMetrics {
    rounds: AtomicU64,
    beacons_sent: AtomicU64,
    beacon_failures: AtomicU64,
    responses_parsed: AtomicU64,
    bytes_skipped: AtomicU64,
}

/// Plain copy of the discovery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryMetricsSnapshot {
    pub rounds: u64,
    pub beacons_sent: u64,
    pub beacon_failures: u64,
    pub responses_parsed: u64,
    pub bytes_skipped: u64,
}

/// Handle to the discovery thread.
pub struct DiscoveryProtocol {
    shared: Arc<Mutex<Shared>>,
    control: Sender<ControlEvent>,
    waker: Arc<Waker>,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<DiscoveryMetrics>,
}

impl DiscoveryProtocol {
    /// Start the discovery thread. No beacon is sent until
    /// [`initiate_discovery`](Self::initiate_discovery) is called.
    pub fn spawn(config: DiscoveryConfig) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), CONTROL_TOKEN)?);
        let (control, control_rx) = channel::unbounded();
        let shared = Arc::new(Mutex::new(Shared::default()));
        let metrics = Arc::new(DiscoveryMetrics::default());

        let worker = Worker {
            poll,
            shared: Arc::clone(&shared),
            control: control_rx,
            config,
            metrics: Arc::clone(&metrics),
            next_token: FIRST_SOCKET_TOKEN,
        };
        let handle = thread::Builder::new()
            .name("roomhub-discovery".to_string())
            .spawn(move || worker.run())?;

        info!("[DISCOVERY] ready");
        Ok(Self {
            shared,
            control,
            waker,
            running: AtomicBool::new(true),
            thread: Mutex::new(Some(handle)),
            metrics,
        })
    }

    /// Set the callback for responses and start a discovery round.
    pub fn initiate_discovery(&self, callback: DiscoveryCallback) {
        debug!("[DISCOVERY] discovery round requested");
        self.shared.lock().callback = Some(callback);
        self.signal(ControlEvent::Broadcast);
    }

    /// Interfaces currently bound.
    pub fn interfaces(&self) -> Vec<NetworkInterface> {
        let shared = self.shared.lock();
        let mut interfaces: Vec<_> = shared
            .bindings
            .values()
            .map(|binding| binding.interface.clone())
            .collect();
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        interfaces
    }

    /// Local addresses of the bound broadcast sockets.
    #[cfg(test)]
    fn bound_addresses(&self) -> Vec<SocketAddr> {
        self.shared
            .lock()
            .bindings
            .values()
            .filter_map(|binding| binding.socket.local_addr().ok())
            .collect()
    }

    pub fn metrics(&self) -> DiscoveryMetricsSnapshot {
        DiscoveryMetricsSnapshot {
            rounds: self.metrics.rounds.load(Ordering::Relaxed),
            beacons_sent: self.metrics.beacons_sent.load(Ordering::Relaxed),
            beacon_failures: self.metrics.beacon_failures.load(Ordering::Relaxed),
            responses_parsed: self.metrics.responses_parsed.load(Ordering::Relaxed),
            bytes_skipped: self.metrics.bytes_skipped.load(Ordering::Relaxed),
        }
    }

    /// Stop the thread and close every socket.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.signal(ControlEvent::Kill);

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("[DISCOVERY] thread panicked");
            }
        }
        info!("[DISCOVERY] shut down");
    }

    fn signal(&self, event: ControlEvent) {
        if self.control.send(event).is_err() {
            debug!("[DISCOVERY] {:?} dropped, thread gone", event);
            return;
        }
        if let Err(e) = self.waker.wake() {
            warn!("[DISCOVERY] wake failed: {}", e);
        }
    }
}

impl DeviceDiscovery for DiscoveryProtocol {
    fn initiate(&self, callback: DiscoveryCallback) {
        self.initiate_discovery(callback);
    }
}

impl Drop for DiscoveryProtocol {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Worker
// ============================================================================

struct Worker {
    poll: Poll,
    shared: Arc<Mutex<Shared>>,
    control: Receiver<ControlEvent>,
    config: DiscoveryConfig,
    metrics: Arc<DiscoveryMetrics>,
    next_token: usize,
}

impl Worker {
    fn run(mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);

        'outer: loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("[DISCOVERY] poll failed: {}", e);
                break;
            }

            for event in events.iter() {
                if event.token() == CONTROL_TOKEN {
                    if !self.handle_control() {
                        break 'outer;
                    }
                } else {
                    self.handle_readable(event.token());
                }
            }
        }

        let mut shared = self.shared.lock();
        for (_, mut binding) in shared.bindings.drain() {
            let _ = self.poll.registry().deregister(&mut binding.socket);
        }
        info!("[DISCOVERY] thread shutting down");
    }

    /// Drain pending control events. Returns `false` on kill.
    fn handle_control(&mut self) -> bool {
        let mut broadcast = false;
        loop {
            match self.control.try_recv() {
                Ok(ControlEvent::Kill) | Err(TryRecvError::Disconnected) => return false,
                Ok(ControlEvent::Broadcast) => broadcast = true,
                Err(TryRecvError::Empty) => break,
            }
        }
        if broadcast {
            self.broadcast();
        }
        true
    }

    fn broadcast(&mut self) {
        let found = match enumerate_ipv4(&self.config.interfaces) {
            Ok(found) => found,
            Err(e) => {
                warn!("[DISCOVERY] interface enumeration failed: {}", e);
                Vec::new()
            }
        };

        let mut shared = self.shared.lock();
        let registry = self.poll.registry();

        shared.bindings.retain(|name, binding| {
            let present = found.iter().any(|iface| &iface.name == name);
            if !present {
                info!("[DISCOVERY] interface {} went away", name);
                let _ = registry.deregister(&mut binding.socket);
            }
            present
        });

        for iface in found {
            if let Some(existing) = shared.bindings.get(&iface.name) {
                if existing.interface.same_addressing(&iface) {
                    continue;
                }
                info!("[DISCOVERY] interface {} changed", iface.name);
                if let Some(mut old) = shared.bindings.remove(&iface.name) {
                    let _ = registry.deregister(&mut old.socket);
                }
            }

            let token = Token(self.next_token);
            self.next_token += 1;
            match open_broadcast_socket(&iface) {
                Ok(mut socket) => {
                    if let Err(e) = registry.register(&mut socket, token, Interest::READABLE) {
                        warn!("[DISCOVERY] cannot poll socket for {}: {}", iface.name, e);
                        continue;
                    }
                    debug!(
                        "[DISCOVERY] bound {} ({} / {} -> {})",
                        iface.name, iface.address, iface.netmask, iface.broadcast
                    );
                    shared.bindings.insert(
                        iface.name.clone(),
                        Binding {
                            interface: iface,
                            socket,
                            token,
                            buffer: ResponseBuffer::new(),
                        },
                    );
                }
                Err(e) => warn!("[DISCOVERY] failed to open socket for {}: {}", iface.name, e),
            }
        }

        self.metrics.rounds.fetch_add(1, Ordering::Relaxed);
        let port = self.config.broadcast_port;
        for binding in shared.bindings.values_mut() {
            binding.buffer.clear();
            let target = SocketAddr::new(IpAddr::V4(binding.interface.broadcast), port);
            match robust_send_to(&binding.socket, &beacon(), target) {
                Ok(_) => {
                    self.metrics.beacons_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.metrics.beacon_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "[DISCOVERY] failed to send beacon on {}: {}",
                        binding.interface.name, e
                    );
                }
            }
        }
    }

    fn handle_readable(&mut self, token: Token) {
        let (callback, found) = {
            let mut guard = self.shared.lock();
            let Shared { callback, bindings } = &mut *guard;
            let Some(binding) = bindings.values_mut().find(|b| b.token == token) else {
                return;
            };
            (callback.clone(), self.receive(binding))
        };

        let Some(callback) = callback else {
            return;
        };
        for descriptor in &found {
            callback(descriptor);
        }
    }

    /// Drain one socket and parse every complete response in its buffer.
    fn receive(&self, binding: &mut Binding) -> Vec<DeviceDescriptor> {
        let mut found = Vec::new();
        let mut datagram = [0u8; RECV_BUFFER_SIZE];
        loop {
            let (n, sender) = match robust_recv_from(&binding.socket, &mut datagram) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("[DISCOVERY] receive on {} failed: {}", binding.interface.name, e);
                    break;
                }
            };

            let skipped_before = binding.buffer.skipped();
            binding.buffer.feed(&datagram[..n]);
            while let Some(response) = binding.buffer.next_response() {
                let payload = parse_payload(&response.payload, self.config.default_device_port);
                let descriptor = DeviceDescriptor {
                    interface: binding.interface.name.clone(),
                    name: payload.name,
                    ip: sender.ip(),
                    port: payload.port,
                    device_type: response.device_type,
                    data: payload.data,
                };
                self.metrics.responses_parsed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "[DISCOVERY] {} answered on {} (type {})",
                    descriptor.identifier(),
                    descriptor.interface,
                    descriptor.device_type
                );
                found.push(descriptor);
            }
            self.metrics.bytes_skipped.fetch_add(
                binding.buffer.skipped() - skipped_before,
                Ordering::Relaxed,
            );
        }
        found
    }
}

fn open_broadcast_socket(iface: &NetworkInterface) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_broadcast(true) {
        warn!("[DISCOVERY] failed to set broadcast permission for {}: {}", iface.name, e);
    }
    if let Err(e) = socket.set_reuse_address(true) {
        warn!("[DISCOVERY] failed to set address reuse for {}: {}", iface.name, e);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::new(IpAddr::V4(iface.address), 0).into())?;
    Ok(UdpSocket::from_std(socket.into()))
}

// ============================================================================
// Tests
// ============================================================================
