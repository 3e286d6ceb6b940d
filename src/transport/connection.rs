//! One TCP connection as the engine sees it.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use mio::net::TcpStream;

use crate::core::packet::Packet;
use crate::core::partial::PartialPacket;
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::KeyExchange;
use crate::protocol::security::Security;

/// Identifies a connection for its whole lifetime. Never reused by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic id source owned by one engine.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Public view of a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    /// Key exchange finished; application messages flow.
    pub established: bool,
}

/// A frame being written, and how much of it the socket has taken.
#[derive(Debug)]
struct Outgoing {
    bytes: Bytes,
    sent: usize,
}

/// Per-socket state, owned and mutated only by the engine thread.
pub(crate) struct Connection {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub stream: TcpStream,
    pub state: KeyExchange,
    pub security: Security,
    partial: Option<PartialPacket>,
    completed: VecDeque<Packet>,
    outgoing: VecDeque<Outgoing>,
    deferred: VecDeque<Packet>,
    max_frame_size: usize,
    /// Cached readiness; poll only reports edges.
    pub readable: bool,
    pub writable: bool,
    pub errored: bool,
    /// At the backlog limit when last checked.
    pub throttled: bool,
    pub closed: bool,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        stream: TcpStream,
        peer_addr: SocketAddr,
        max_frame_size: usize,
    ) -> Self {
        Self {
            id,
            peer_addr,
            stream,
            state: KeyExchange::Awaiting,
            security: Security::new(),
            partial: None,
            completed: VecDeque::new(),
            outgoing: VecDeque::new(),
            deferred: VecDeque::new(),
            max_frame_size,
            readable: false,
            writable: false,
            errored: false,
            throttled: false,
            closed: false,
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            peer_addr: self.peer_addr,
            established: self.state.is_established(),
        }
    }

    /// Feed one read's worth of bytes through the reassembler.
    pub fn ingest(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let partial = self
                .partial
                .get_or_insert_with(|| PartialPacket::new(self.max_frame_size));
            let used = partial.feed(data)?;
            data = &data[used..];

            if partial.is_complete() {
                if let Some(packet) = self.partial.take().and_then(PartialPacket::into_packet) {
                    self.completed.push_back(packet);
                }
            }
        }
        Ok(())
    }

    /// Frames completed since the last call, in arrival order.
    pub fn take_completed(&mut self) -> VecDeque<Packet> {
        std::mem::take(&mut self.completed)
    }

    /// Queue an application packet. Held in plaintext until the key exchange
    /// finishes, sealed immediately afterwards.
    pub fn queue(&mut self, packet: Packet) -> Result<()> {
        if self.state.is_established() {
            let sealed = packet.to_encrypted(&self.security)?;
            self.push_frame(sealed.into_frame());
        } else {
            self.deferred.push_back(packet);
        }
        Ok(())
    }

    /// Queue a key-exchange packet as is.
    pub fn queue_raw(&mut self, packet: Packet) {
        self.push_frame(packet.into_frame());
    }

    fn push_frame(&mut self, bytes: Bytes) {
        self.outgoing.push_back(Outgoing { bytes, sent: 0 });
    }

    /// Enter the established state and seal everything held back so far.
    pub fn establish(&mut self) -> Result<()> {
        self.state = KeyExchange::Established;
        while let Some(packet) = self.deferred.pop_front() {
            self.queue(packet)?;
        }
        Ok(())
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    pub fn queued_frames(&self) -> usize {
        self.outgoing.len() + self.deferred.len()
    }

    /// Read once from the socket. `Ok(None)` means the socket is drained.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        loop {
            match self.stream.read(buf) {
                Ok(0) => return Err(ProtocolError::ConnectionClosed),
                Ok(n) => return Ok(Some(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.readable = false;
                    return Ok(None);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Write queued frames until the socket pushes back or the queue is empty.
    ///
    /// Returns the bytes written and the number of frames fully sent.
    pub fn flush(&mut self) -> Result<(usize, usize)> {
        let mut written = 0;
        let mut frames = 0;
        while self.writable {
            let Some(front) = self.outgoing.front_mut() else {
                break;
            };
            match self.stream.write(&front.bytes[front.sent..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    written += n;
                    front.sent += n;
                    if front.sent == front.bytes.len() {
                        self.outgoing.pop_front();
                        frames += 1;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.writable = false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok((written, frames))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state)
            .field("outgoing", &self.outgoing.len())
            .field("deferred", &self.deferred.len())
            .field("closed", &self.closed)
            .finish()
    }
}
