//! # Error Types
//!
//! Error handling for the transport engine.
//!
//! Every failure the engine can observe maps onto one of the variants below.
//! The engine decides what to do with an error by its category, never by
//! unwinding: connection-scoped errors end that one connection, engine-scoped
//! errors end the event loop.
//!
//! ## Error Categories
//! - **Framing**: zero-length or oversized headers, hostile allocations
//! - **Transport**: read/write failures other than would-block
//! - **Sequencing**: key exchange out of order or duplicated
//! - **Cryptographic**: agreement, key-unwrap and tag verification failures
//! - **Codec contract**: appending after finalize, extracting past the end
//!
//! ## Example Usage
//! ```rust
//! use peerwire::core::packet::Packet;
//! use peerwire::error::{ProtocolError, Result};
//!
//! fn read_greeting(packet: &mut Packet) -> Result<String> {
//!     let greeting: String = packet.extract()?;
//!     if greeting.is_empty() {
//!         return Err(ProtocolError::Decode("empty greeting".into()));
//!     }
//!     Ok(greeting)
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Codec contract errors
    pub const ERR_NOT_UTF8: &str = "Field text is not valid UTF-8";
    pub const ERR_BAD_LENGTH_DIGITS: &str = "Field length prefix is not a decimal number";

    /// Key exchange errors
    pub const ERR_BAD_PUBLIC_KEY: &str = "Peer public key has the wrong length";
    pub const ERR_BAD_WRAPPED_KEY: &str = "Wrapped content key has the wrong length";
    pub const ERR_EXTRA_FRAMES: &str = "Peer sent more than one frame during key exchange";
    pub const ERR_NOT_AGREED: &str = "No shared secret has been agreed";
    pub const ERR_NO_CONTENT_KEY: &str = "Content encryption key is not established";
    pub const ERR_NON_CONTRIBUTORY: &str = "Key agreement produced a non-contributory secret";

    /// Engine errors
    pub const ERR_NO_ADDRESS: &str = "Address did not resolve to any socket address";
}

/// ProtocolError is the primary error type for all transport operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid frame header")]
    InvalidHeader,

    #[error("Frame declared a length of zero")]
    ZeroLengthFrame,

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Could not allocate {0} bytes for an incoming frame")]
    AllocationFailure(usize),

    #[error("Packet is finalized, no further fields may be appended")]
    PacketFinalized,

    #[error("Packet must be finalized first")]
    PacketNotFinalized,

    #[error("Extract past end of packet: needed {needed} bytes, {available} available")]
    ExtractPastEnd { needed: usize, available: usize },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Unexpected message during key exchange")]
    UnexpectedMessage,

    #[error("Key agreement failed: {0}")]
    KeyAgreement(String),

    #[error("Wrapped key verification failed")]
    KeyUnwrap,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Network engine is stopped")]
    EngineStopped,

    #[error("Could not resolve address: {0}")]
    Resolve(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProtocolError {
    /// Whether the error came out of a cryptographic check.
    ///
    /// These are logged apart from ordinary transport failures because they
    /// can mean the peer or the path is tampering with frames.
    pub fn is_cryptographic(&self) -> bool {
        matches!(
            self,
            ProtocolError::KeyAgreement(_)
                | ProtocolError::KeyUnwrap
                | ProtocolError::EncryptionFailure
                | ProtocolError::DecryptionFailure
        )
    }

    /// Whether the error is a malformed-frame condition on the wire.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidHeader
                | ProtocolError::ZeroLengthFrame
                | ProtocolError::OversizedPacket(_)
                | ProtocolError::AllocationFailure(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ProtocolError::DecryptionFailure.is_cryptographic());
        assert!(ProtocolError::KeyUnwrap.is_cryptographic());
        assert!(!ProtocolError::ConnectionClosed.is_cryptographic());

        assert!(ProtocolError::ZeroLengthFrame.is_framing());
        assert!(ProtocolError::OversizedPacket(1 << 30).is_framing());
        assert!(!ProtocolError::KeyUnwrap.is_framing());
    }

    #[test]
    fn test_io_conversion() {
        let err: ProtocolError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert!(matches!(err, ProtocolError::Io(_)));
        assert!(err.to_string().starts_with("I/O error"));
    }
}
