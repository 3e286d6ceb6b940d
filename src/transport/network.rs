//! Consumer-facing API.
//!
//! ```rust,no_run
//! use peerwire::config::NetworkConfig;
//! use peerwire::core::packet::Packet;
//! use peerwire::transport::{Network, Role};
//!
//! # fn main() -> peerwire::error::Result<()> {
//! let config = NetworkConfig::default();
//! let server = Network::start(Role::Server, "", 15500, &config)?;
//! let replies = server.handle();
//! server.register_worker(move |mut transfer| {
//!     let text: String = transfer.packet.extract().unwrap_or_default();
//!     let mut echo = Packet::new();
//!     if echo.append(text).is_ok() {
//!         let _ = replies.send(echo, transfer.connection_id);
//!     }
//! })?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream as StdTcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use mio::net::{TcpListener, TcpStream};
use mio::Poll;
use tracing::{debug, info, warn};

use super::connection::{ConnectionId, ConnectionInfo};
use super::engine::{Engine, WAKER};
use super::event_pipe::EventPipe;
use super::queues::{Delivery, Inbox, Outbox, Target, Transfer};
use super::Role;
use crate::config::{split_host_port, NetworkConfig};
use crate::core::packet::Packet;
use crate::core::HEADER_SIZE;
use crate::error::{constants, ProtocolError, Result};
use crate::utils::crypto::SEAL_OVERHEAD;
use crate::utils::metrics::{Metrics, MetricsSnapshot};

type DisconnectCallback = Box<dyn FnMut(ConnectionId) + Send>;

/// State shared by the engine thread and every API handle.
pub(crate) struct Shared {
    pub role: Role,
    pub inbox: Inbox,
    pub outbox: Outbox,
    pub pipe: EventPipe,
    pub metrics: Metrics,
    disconnects: Mutex<Vec<ConnectionId>>,
    registry: RwLock<HashMap<ConnectionId, ConnectionInfo>>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
    max_frame_size: usize,
}

impl Shared {
    pub fn is_stopped(&self) -> bool {
        self.inbox.is_stopped()
    }

    fn submit(&self, target: Target, mut packet: Packet) -> Result<()> {
        if self.is_stopped() {
            return Err(ProtocolError::EngineStopped);
        }
        packet.finalize()?;
        let sealed_len = packet.len() + HEADER_SIZE + SEAL_OVERHEAD;
        if sealed_len > self.max_frame_size {
            return Err(ProtocolError::OversizedPacket(sealed_len));
        }
        self.outbox.push(target, packet);
        self.pipe.activate()?;
        Ok(())
    }

    fn request_disconnect(&self, id: ConnectionId) -> Result<()> {
        if self.is_stopped() {
            return Err(ProtocolError::EngineStopped);
        }
        self.disconnects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
        self.pipe.activate()?;
        Ok(())
    }

    pub fn take_disconnects(&self) -> Vec<ConnectionId> {
        std::mem::take(&mut *self.disconnects.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn next_message(&self) -> Delivery {
        let (delivery, resumed) = self.inbox.next();
        if resumed {
            if let Err(e) = self.pipe.activate() {
                warn!(error = %e, "Failed to wake engine after backlog drained");
            }
        }
        delivery
    }

    fn begin_stop(&self) {
        self.inbox.stop();
        if let Err(e) = self.pipe.activate() {
            debug!(error = %e, "Engine already gone");
        }
    }

    pub fn register(&self, info: ConnectionInfo) {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(info.id, info);
    }

    pub fn unregister(&self, id: ConnectionId) {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    pub fn notify_disconnect(&self, id: ConnectionId) {
        let mut callback = self
            .on_disconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(callback) = callback.as_mut() {
            callback(id);
        }
    }

    fn connections(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        list.sort_by_key(|info| info.id);
        list
    }
}

/// Point-in-time view of an engine's queues and connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub connections: usize,
    pub established: usize,
    /// Received messages not yet taken by a consumer.
    pub queued_incoming: usize,
    /// Packets submitted but not yet routed by the engine.
    pub queued_outgoing: usize,
    /// Undelivered messages per connection.
    pub backlog: HashMap<ConnectionId, usize>,
}

/// Cloneable sending side of a [`Network`].
///
/// Handles do not keep the engine running; once the owning `Network` stops,
/// every call returns [`ProtocolError::EngineStopped`].
#[derive(Clone)]
pub struct NetworkHandle {
    shared: Arc<Shared>,
}

impl NetworkHandle {
    /// Queue `packet` for one connection. A client ignores `target`.
    pub fn send(&self, packet: Packet, target: ConnectionId) -> Result<()> {
        self.shared.submit(Target::One(target), packet)
    }

    /// Queue one copy of `packet` for every established connection.
    pub fn send_all(&self, packet: Packet) -> Result<()> {
        self.shared.submit(Target::All, packet)
    }

    /// Like [`NetworkHandle::send_all`], skipping the listed connections.
    pub fn send_all_except(&self, packet: Packet, excluded: &[ConnectionId]) -> Result<()> {
        self.shared
            .submit(Target::AllExcept(excluded.to_vec()), packet)
    }

    pub fn disconnect(&self, id: ConnectionId) -> Result<()> {
        self.shared.request_disconnect(id)
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }
}

impl std::fmt::Debug for NetworkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkHandle")
            .field("role", &self.shared.role)
            .field("stopped", &self.shared.is_stopped())
            .finish()
    }
}

/// A running engine: one event-loop thread plus any registered workers.
///
/// Dropping the network stops it and joins its threads.
pub struct Network {
    shared: Arc<Shared>,
    engine: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    local_addr: SocketAddr,
}

impl Network {
    /// Start an engine.
    ///
    /// As a server, listens on `host:port` (an empty host means every
    /// interface; port 0 picks a free port, see [`Network::local_addr`]).
    /// As a client, connects to `host:port` and opens the key exchange.
    pub fn start(role: Role, host: &str, port: u16, config: &NetworkConfig) -> Result<Self> {
        config.validate_strict()?;
        let poll = Poll::new()?;
        let pipe = EventPipe::new(poll.registry(), WAKER)?;
        let shared = Arc::new(Shared {
            role,
            inbox: Inbox::new(config.server.backlog_limit),
            outbox: Outbox::default(),
            pipe,
            metrics: Metrics::new(),
            disconnects: Mutex::new(Vec::new()),
            registry: RwLock::new(HashMap::new()),
            on_disconnect: Mutex::new(None),
            max_frame_size: config.transport.max_frame_size,
        });

        let mut engine = Engine::new(poll, Arc::clone(&shared), config);
        let local_addr = match role {
            Role::Server => {
                let host = if host.is_empty() { "0.0.0.0" } else { host };
                let addr = resolve(host, port)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| ProtocolError::Resolve(constants::ERR_NO_ADDRESS.into()))?;
                engine.listen(TcpListener::bind(addr)?)?
            }
            Role::Client => {
                let stream = connect(host, port, config)?;
                let local = stream.local_addr()?;
                let peer = stream.peer_addr()?;
                engine.attach(stream, peer)?;
                local
            }
        };

        let handle = thread::Builder::new()
            .name(String::from("peerwire-engine"))
            .spawn(move || engine.run())?;

        info!(role = ?role, address = %local_addr, "Network started");
        Ok(Self {
            shared,
            engine: Mutex::new(Some(handle)),
            workers: Mutex::new(Vec::new()),
            local_addr,
        })
    }

    /// Listen on `config.server.address`.
    pub fn server(config: &NetworkConfig) -> Result<Self> {
        let (host, port) = split_host_port(&config.server.address).ok_or_else(|| {
            ProtocolError::ConfigError(format!("Invalid server address: {}", config.server.address))
        })?;
        Self::start(Role::Server, host, port, config)
    }

    /// Connect to `config.client.address`.
    pub fn client(config: &NetworkConfig) -> Result<Self> {
        let (host, port) = split_host_port(&config.client.address).ok_or_else(|| {
            ProtocolError::ConfigError(format!("Invalid client address: {}", config.client.address))
        })?;
        Self::start(Role::Client, host, port, config)
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Listening address for a server, local socket address for a client.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> NetworkHandle {
        NetworkHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Finalize `packet` and queue it for `target`. A client ignores
    /// `target` and sends to its server.
    pub fn send(&self, packet: Packet, target: ConnectionId) -> Result<()> {
        self.shared.submit(Target::One(target), packet)
    }

    /// Queue one copy of `packet` for every established connection.
    pub fn send_all(&self, packet: Packet) -> Result<()> {
        self.shared.submit(Target::All, packet)
    }

    /// Like [`Network::send_all`], skipping the listed connections.
    pub fn send_all_except(&self, packet: Packet, excluded: &[ConnectionId]) -> Result<()> {
        self.shared
            .submit(Target::AllExcept(excluded.to_vec()), packet)
    }

    /// Ask the engine to close a connection.
    pub fn disconnect(&self, id: ConnectionId) -> Result<()> {
        self.shared.request_disconnect(id)
    }

    /// Block until a message arrives or the engine stops.
    pub fn get_next_message(&self) -> Delivery {
        self.shared.next_message()
    }

    /// Spawn a thread that hands every message to `handler` until the
    /// engine stops. The thread is joined by [`Network::stop`].
    pub fn register_worker<F>(&self, mut handler: F) -> Result<()>
    where
        F: FnMut(Transfer) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = thread::Builder::new()
            .name(format!("peerwire-worker-{}", workers.len()))
            .spawn(move || {
                while let Delivery::Transfer(transfer) = shared.next_message() {
                    handler(transfer);
                }
                debug!("Worker exiting");
            })?;
        workers.push(handle);
        Ok(())
    }

    /// Hand every message to `handler` on the calling thread until the
    /// engine stops.
    pub fn run_worker<F>(&self, mut handler: F)
    where
        F: FnMut(Transfer),
    {
        while let Delivery::Transfer(transfer) = self.shared.next_message() {
            handler(transfer);
        }
    }

    /// Install the callback run on the engine thread for every connection
    /// that closes. Not called for connections dropped by [`Network::stop`].
    ///
    /// The callback must not register another callback.
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: FnMut(ConnectionId) + Send + 'static,
    {
        *self
            .shared
            .on_disconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(callback));
    }

    /// Stop the engine and release every consumer with [`Delivery::Exit`].
    ///
    /// With `wait`, also joins the engine and worker threads, except the
    /// calling thread when a worker stops its own network.
    pub fn stop(&self, wait: bool) {
        self.shared.begin_stop();
        if !wait {
            return;
        }

        let current = thread::current().id();
        let engine = self
            .engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let workers =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));

        for handle in engine.into_iter().chain(workers) {
            if handle.thread().id() == current {
                continue;
            }
            let name = handle.thread().name().map(str::to_owned);
            if handle.join().is_err() {
                warn!(thread = ?name, "Thread panicked before stop");
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    pub fn peer_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.shared
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|info| info.peer_addr)
    }

    /// Live connections, ordered by id.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.shared.connections()
    }

    /// Messages from `id` waiting for a consumer.
    pub fn backlog(&self, id: ConnectionId) -> usize {
        self.shared.inbox.backlog(id)
    }

    pub fn stats(&self) -> NetworkStats {
        let connections = self.shared.connections();
        NetworkStats {
            connections: connections.len(),
            established: connections.iter().filter(|c| c.established).count(),
            queued_incoming: self.shared.inbox.len(),
            queued_outgoing: self.shared.outbox.len(),
            backlog: self.shared.inbox.backlogs(),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.stop(true);
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("role", &self.shared.role)
            .field("local_addr", &self.local_addr)
            .field("stopped", &self.shared.is_stopped())
            .finish()
    }
}

fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| ProtocolError::Resolve(format!("{host}:{port}: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(ProtocolError::Resolve(constants::ERR_NO_ADDRESS.into()));
    }
    Ok(addrs)
}

/// Connect to the first reachable address, then switch to non-blocking.
fn connect(host: &str, port: u16, config: &NetworkConfig) -> Result<TcpStream> {
    let mut last_error = None;
    for addr in resolve(host, port)? {
        match StdTcpStream::connect_timeout(&addr, config.client.connect_timeout) {
            Ok(stream) => {
                stream.set_nodelay(config.transport.nodelay)?;
                stream.set_nonblocking(true)?;
                debug!(address = %addr, "Connected");
                return Ok(TcpStream::from_std(stream));
            }
            Err(e) => {
                debug!(address = %addr, error = %e, "Connect attempt failed");
                last_error = Some(e);
            }
        }
    }
    Err(last_error
        .map(ProtocolError::from)
        .unwrap_or_else(|| ProtocolError::Resolve(constants::ERR_NO_ADDRESS.into())))
}
