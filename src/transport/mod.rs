//! # Transport Engine
//!
//! Non-blocking TCP transport driven by one event-loop thread per
//! [`Network`].
//!
//! ## Components
//! - **Network / NetworkHandle**: the consumer-facing API
//! - **Engine**: the event loop that owns every socket
//! - **Connection**: per-socket framing state, key exchange and queues
//! - **Inbox / Outbox**: lock-protected queues between the engine and other threads
//! - **EventPipe**: interrupts the engine's wait when another thread has work for it
//!
//! ## Threads
//! - The engine thread alone touches sockets and connection state
//! - Application threads enqueue outgoing packets and disconnect requests
//! - Consumer threads block in [`Network::get_next_message`] or run registered workers
//!
//! ## Backpressure
//! Each connection may have at most `server.backlog_limit` received messages
//! waiting for a consumer. At the limit the engine stops reading that socket;
//! the consumer that brings it back under the limit wakes the engine.

pub mod connection;
mod engine;
pub mod event_pipe;
pub mod network;
pub mod queues;

pub use connection::{ConnectionId, ConnectionInfo};
pub use network::{Network, NetworkHandle, NetworkStats};
pub use queues::{Delivery, Transfer};

/// Which side of the connection this engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Listens and accepts any number of peers; answers key exchanges.
    Server,
    /// Holds exactly one connection to a server; opens the key exchange.
    Client,
}
