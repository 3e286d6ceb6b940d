//! # peerwire
//!
//! Encrypted message transport between peers over non-blocking TCP.
//!
//! A [`Network`] runs one event-loop thread that owns every socket. Messages
//! are [`Packet`]s: length-prefixed frames of textual fields. Each connection
//! performs an X25519 key exchange on open, after which every frame is sealed
//! with XChaCha20-Poly1305.
//!
//! ## Modules
//! - [`core`]: packet building, field codec and frame reassembly
//! - [`protocol`]: key exchange and per-connection security
//! - [`transport`]: the event loop, queues and the consumer-facing API
//! - [`config`]: TOML and environment configuration
//! - [`utils`]: crypto primitives, logging setup and metrics
//!
//! ## Example
//! ```rust,no_run
//! use peerwire::{Delivery, Network, NetworkConfig, Packet};
//!
//! # fn main() -> peerwire::Result<()> {
//! let config = NetworkConfig::default();
//! let client = Network::client(&config)?;
//!
//! let mut hello = Packet::new();
//! hello.append("hej")?.append(123)?;
//! client.send_all(hello)?;
//!
//! if let Delivery::Transfer(mut transfer) = client.get_next_message() {
//!     let reply: String = transfer.packet.extract()?;
//!     println!("{reply}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use config::NetworkConfig;
pub use core::packet::Packet;
pub use error::{ProtocolError, Result};
pub use transport::{ConnectionId, Delivery, Network, NetworkHandle, Role, Transfer};
