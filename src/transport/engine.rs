//! The event loop.
//!
//! One thread per [`Network`](super::Network) runs [`Engine::run`]. Each turn:
//!
//! 1. route packets from the outbox to their connections
//! 2. pick a poll timeout: zero if any connection can make progress now
//! 3. poll the listener, the event pipe and every socket
//! 4. leave if a stop was requested
//! 5. accept new peers
//! 6. reset the event pipe
//! 7. apply disconnect requests
//! 8. read, run the key exchange, decrypt and deliver; then write
//! 9. prune closed connections and notify the disconnect callback
//! 10. as a client, stop once the server connection is gone
//!
//! mio reports readiness as edges, so each connection caches whether it is
//! readable or writable until an operation returns `WouldBlock`.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, info, trace, warn};

use super::connection::{Connection, ConnectionId, IdGenerator};
use super::network::Shared;
use super::queues::Target;
use super::Role;
use crate::config::NetworkConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake;

pub(crate) const LISTENER: Token = Token(0);
pub(crate) const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;

/// Reads per connection per turn, so one busy peer cannot starve the rest.
const MAX_READS_PER_TURN: usize = 16;

const EVENT_CAPACITY: usize = 1024;

fn token_for(id: ConnectionId) -> Token {
    Token(id.as_u64() as usize + FIRST_CONNECTION)
}

fn id_for(token: Token) -> Option<ConnectionId> {
    token
        .0
        .checked_sub(FIRST_CONNECTION)
        .map(|raw| ConnectionId::new(raw as u64))
}

#[derive(Debug, Clone, Copy)]
struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
    error: bool,
}

#[derive(Debug, Clone)]
struct Limits {
    backlog_limit: usize,
    max_connections: usize,
    max_frame_size: usize,
    nodelay: bool,
    stats_interval: Option<Duration>,
}

pub(crate) struct Engine {
    poll: Poll,
    events: Events,
    ready: Vec<Readiness>,
    shared: Arc<Shared>,
    listener: Option<TcpListener>,
    connections: BTreeMap<ConnectionId, Connection>,
    ids: IdGenerator,
    read_buf: Vec<u8>,
    limits: Limits,
    next_stats: Option<Instant>,
}

impl Engine {
    pub fn new(poll: Poll, shared: Arc<Shared>, config: &NetworkConfig) -> Self {
        let limits = Limits {
            backlog_limit: config.server.backlog_limit,
            max_connections: config.server.max_connections,
            max_frame_size: config.transport.max_frame_size,
            nodelay: config.transport.nodelay,
            stats_interval: config.transport.stats_interval,
        };
        Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            ready: Vec::with_capacity(EVENT_CAPACITY),
            shared,
            listener: None,
            connections: BTreeMap::new(),
            ids: IdGenerator::new(),
            read_buf: vec![0; config.transport.read_buffer_size],
            next_stats: limits.stats_interval.map(|every| Instant::now() + every),
            limits,
        }
    }

    /// Take ownership of a bound listener.
    pub fn listen(&mut self, mut listener: TcpListener) -> Result<SocketAddr> {
        self.poll
            .registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let addr = listener.local_addr()?;
        self.listener = Some(listener);
        info!(address = %addr, "Listening");
        Ok(addr)
    }

    /// Take ownership of a connected socket and register it.
    pub fn attach(&mut self, mut stream: TcpStream, peer_addr: SocketAddr) -> Result<ConnectionId> {
        let id = self.ids.next_id();
        self.poll.registry().register(
            &mut stream,
            token_for(id),
            Interest::READABLE | Interest::WRITABLE,
        )?;

        let mut conn = Connection::new(id, stream, peer_addr, self.limits.max_frame_size);
        if self.shared.role == Role::Client {
            let opening = handshake::opening_packet(&conn.security)?;
            conn.queue_raw(opening);
        }

        self.shared.register(conn.info());
        self.shared.metrics.connection_opened();
        info!(connection_id = %id, peer = %peer_addr, "Connection opened");
        self.connections.insert(id, conn);
        Ok(id)
    }

    /// Run until stopped or until an engine-fatal error.
    pub fn run(mut self) {
        debug!(role = ?self.shared.role, "Engine started");
        if let Err(e) = self.event_loop() {
            error!(error = %e, "Engine failed, shutting down");
        }
        self.shutdown();
    }

    fn event_loop(&mut self) -> Result<()> {
        loop {
            // Also checked here: a stop that raced the last reset sent no wake-up.
            if self.shared.is_stopped() {
                info!("Stop requested");
                return Ok(());
            }
            self.route_outbox();

            let timeout = self.poll_timeout();
            if let Err(e) = self.poll.poll(&mut self.events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            if self.shared.is_stopped() {
                info!("Stop requested");
                return Ok(());
            }

            let accept_pending = self.collect_readiness()?;
            if accept_pending {
                self.accept()?;
            }

            self.shared.pipe.reset();
            self.apply_disconnects();
            self.service_connections();
            self.prune();

            if self.shared.role == Role::Client && self.connections.is_empty() {
                warn!("Lost connection to server");
                return Ok(());
            }

            self.maybe_log_stats();
        }
    }

    /// Copy this turn's events onto the connections. Returns whether the
    /// listener has peers waiting.
    fn collect_readiness(&mut self) -> Result<bool> {
        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        ready.extend(self.events.iter().map(|event| Readiness {
            token: event.token(),
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable(),
            error: event.is_error(),
        }));

        let mut accept_pending = false;
        for event in &ready {
            match event.token {
                LISTENER if event.error => {
                    let cause = self
                        .listener
                        .as_ref()
                        .and_then(|l| l.take_error().ok().flatten())
                        .unwrap_or_else(|| io::Error::other("listener error"));
                    return Err(cause.into());
                }
                LISTENER => accept_pending = true,
                WAKER => trace!("Woken by event pipe"),
                token => {
                    let Some(conn) = id_for(token).and_then(|id| self.connections.get_mut(&id))
                    else {
                        continue;
                    };
                    conn.readable |= event.readable;
                    conn.writable |= event.writable;
                    conn.errored |= event.error;
                }
            }
        }
        self.ready = ready;
        Ok(accept_pending)
    }

    fn accept(&mut self) -> Result<()> {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return Ok(());
            };
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    if self.connections.len() >= self.limits.max_connections {
                        warn!(peer = %peer_addr, limit = self.limits.max_connections, "Connection limit reached, refusing peer");
                        self.shared.metrics.connection_refused();
                        continue;
                    }
                    if let Err(e) = stream.set_nodelay(self.limits.nodelay) {
                        warn!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                    }
                    self.attach(stream, peer_addr)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted
                            | io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    debug!(error = %e, "Transient accept failure");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn route_outbox(&mut self) {
        for outbound in self.shared.outbox.drain() {
            let targets: Vec<ConnectionId> = match (self.shared.role, &outbound.target) {
                (Role::Client, _) => self.connections.keys().take(1).copied().collect(),
                (Role::Server, Target::One(id)) => vec![*id],
                (Role::Server, Target::All) => self.established_ids(&[]),
                (Role::Server, Target::AllExcept(excluded)) => self.established_ids(excluded),
            };

            if let Target::One(id) = outbound.target {
                if !self.connections.contains_key(&id) && self.shared.role == Role::Server {
                    warn!(connection_id = %id, "Dropping message for unknown connection");
                    self.shared.metrics.message_dropped();
                    continue;
                }
            }
            if targets.is_empty() {
                debug!("No connection to route message to");
                self.shared.metrics.message_dropped();
                continue;
            }

            let last = targets.len() - 1;
            let mut packet = Some(outbound.packet);
            for (index, id) in targets.into_iter().enumerate() {
                let Some(conn) = self.connections.get_mut(&id) else {
                    continue;
                };
                if conn.closed {
                    continue;
                }
                let copy = if index == last {
                    packet.take()
                } else {
                    packet.clone()
                };
                let Some(copy) = copy else { continue };
                if let Err(e) = conn.queue(copy) {
                    fail(conn, &e, &self.shared);
                }
            }
        }
    }

    fn established_ids(&self, excluded: &[ConnectionId]) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|c| c.state.is_established() && !excluded.contains(&c.id))
            .map(|c| c.id)
            .collect()
    }

    fn poll_timeout(&self) -> Option<Duration> {
        let throttled = self.shared.inbox.throttled();
        let busy = self.connections.values().any(|c| {
            !c.closed
                && (c.errored
                    || (c.readable && !throttled.contains(&c.id))
                    || (c.writable && c.has_outgoing()))
        });
        if busy {
            return Some(Duration::ZERO);
        }
        self.next_stats
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    fn apply_disconnects(&mut self) {
        for id in self.shared.take_disconnects() {
            match self.connections.get_mut(&id) {
                Some(conn) => {
                    info!(connection_id = %id, "Disconnect requested");
                    conn.closed = true;
                }
                None => debug!(connection_id = %id, "Disconnect requested for unknown connection"),
            }
        }
    }

    fn service_connections(&mut self) {
        let throttled: HashSet<ConnectionId> = self.shared.inbox.throttled();
        for conn in self.connections.values_mut() {
            if conn.closed {
                continue;
            }
            if conn.errored {
                let cause = conn
                    .stream
                    .take_error()
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| io::Error::other("socket error"));
                fail(conn, &cause.into(), &self.shared);
                continue;
            }

            if conn.readable && !throttled.contains(&conn.id) {
                if let Err(e) = read_path(conn, &mut self.read_buf, &self.shared, &self.limits) {
                    fail(conn, &e, &self.shared);
                    continue;
                }
            }

            if conn.writable && conn.has_outgoing() {
                match conn.flush() {
                    Ok((bytes, frames)) => {
                        self.shared.metrics.bytes_written(bytes);
                        for _ in 0..frames {
                            self.shared.metrics.message_sent();
                        }
                    }
                    Err(e) => fail(conn, &e, &self.shared),
                }
            }
        }
    }

    fn prune(&mut self) {
        let closed: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.closed)
            .map(|c| c.id)
            .collect();

        for id in closed {
            let Some(mut conn) = self.connections.remove(&id) else {
                continue;
            };
            if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
                debug!(connection_id = %id, error = %e, "Deregister failed");
            }
            drop(conn);
            self.shared.unregister(id);
            self.shared.metrics.connection_closed();
            info!(connection_id = %id, "Connection closed");
            self.shared.notify_disconnect(id);
        }
    }

    fn maybe_log_stats(&mut self) {
        let (Some(at), Some(every)) = (self.next_stats, self.limits.stats_interval) else {
            return;
        };
        let now = Instant::now();
        if now < at {
            return;
        }
        let established = self
            .connections
            .values()
            .filter(|c| c.state.is_established())
            .count();
        let queued_frames: usize = self.connections.values().map(|c| c.queued_frames()).sum();
        info!(
            connections = self.connections.len(),
            established,
            queued_frames,
            queued_incoming = self.shared.inbox.len(),
            "Network stats"
        );
        self.shared.metrics.log_metrics();
        self.next_stats = Some(now + every);
    }

    fn shutdown(&mut self) {
        self.shared.inbox.stop();
        for (id, mut conn) in std::mem::take(&mut self.connections) {
            if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
                debug!(connection_id = %id, error = %e, "Deregister failed");
            }
            self.shared.unregister(id);
            self.shared.metrics.connection_closed();
        }
        if let Some(mut listener) = self.listener.take() {
            if let Err(e) = self.poll.registry().deregister(&mut listener) {
                debug!(error = %e, "Listener deregister failed");
            }
        }
        info!("Engine stopped");
    }
}

/// Drain a readable socket: reassemble, run the key exchange, decrypt and
/// deliver. Stops early at the backlog limit.
fn read_path(
    conn: &mut Connection,
    buf: &mut [u8],
    shared: &Shared,
    limits: &Limits,
) -> Result<()> {
    let mut backlog = shared.inbox.backlog(conn.id);
    let mut reads = 0;

    while conn.readable && reads < MAX_READS_PER_TURN {
        if backlog >= limits.backlog_limit {
            if !conn.throttled {
                conn.throttled = true;
                shared.metrics.backpressure();
                debug!(connection_id = %conn.id, backlog, "Backlog limit reached, pausing reads");
            }
            return Ok(());
        }
        conn.throttled = false;

        let Some(n) = conn.read_chunk(buf)? else {
            return Ok(());
        };
        reads += 1;
        shared.metrics.bytes_read(n);
        trace!(connection_id = %conn.id, bytes = n, "Read");

        conn.ingest(&buf[..n])?;
        if let Some(updated) = surface_frames(conn, shared)? {
            backlog = updated;
        }
    }
    Ok(())
}

/// Handle frames completed by the last read. Returns the connection's new
/// backlog if anything was delivered.
fn surface_frames(conn: &mut Connection, shared: &Shared) -> Result<Option<usize>> {
    let mut frames = conn.take_completed().into_iter();
    if frames.len() == 0 {
        return Ok(None);
    }

    if !conn.state.is_established() {
        match shared.role {
            Role::Server => {
                if frames.len() > 1 {
                    return Err(ProtocolError::HandshakeError(
                        constants::ERR_EXTRA_FRAMES.into(),
                    ));
                }
                let Some(mut opening) = frames.next() else {
                    return Ok(None);
                };
                let reply = handshake::respond(&mut conn.security, &mut opening)?;
                conn.queue_raw(reply);
            }
            Role::Client => {
                let Some(mut reply) = frames.next() else {
                    return Ok(None);
                };
                handshake::complete(&mut conn.security, &mut reply)?;
            }
        }
        conn.establish()?;
        shared.metrics.handshake_success();
        shared.register(conn.info());
        info!(connection_id = %conn.id, "Key exchange complete");
    }

    let mut delivered = Vec::with_capacity(frames.len());
    for frame in frames {
        delivered.push(frame.from_encrypted(&conn.security)?);
        shared.metrics.message_received();
    }
    if delivered.is_empty() {
        return Ok(None);
    }
    Ok(Some(shared.inbox.deliver(conn.id, delivered)))
}

/// Mark a connection for pruning and log why, by error category.
fn fail(conn: &mut Connection, err: &ProtocolError, shared: &Shared) {
    conn.closed = true;
    let id = conn.id;
    let peer = conn.peer_addr;

    if !conn.state.is_established() && !matches!(err, ProtocolError::ConnectionClosed) {
        shared.metrics.handshake_failed();
    }

    if err.is_cryptographic() {
        shared.metrics.crypto_error();
        warn!(connection_id = %id, peer = %peer, error = %err, "Cryptographic failure, possible tampering");
    } else if err.is_framing() {
        shared.metrics.framing_error();
        warn!(connection_id = %id, peer = %peer, error = %err, "Malformed frame");
    } else {
        match err {
            ProtocolError::ConnectionClosed => {
                debug!(connection_id = %id, peer = %peer, "Peer closed connection");
            }
            ProtocolError::Io(_) => {
                shared.metrics.transport_error();
                warn!(connection_id = %id, peer = %peer, error = %err, "Transport error");
            }
            _ => {
                warn!(connection_id = %id, peer = %peer, error = %err, "Protocol violation");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_mapping_round_trips() {
        let id = ConnectionId::new(41);
        assert_eq!(id_for(token_for(id)), Some(id));
        assert_eq!(id_for(LISTENER), None);
        assert_eq!(id_for(WAKER), None);
        assert_ne!(token_for(ConnectionId::new(0)), WAKER);
    }
}
