//! # Session Protocol
//!
//! Key exchange and per-connection encryption.
//!
//! ## Components
//! - **Security**: X25519 agreement, content-key wrapping and frame sealing
//! - **Handshake**: the one-round-trip exchange that installs the content key
//!
//! ## Flow
//! 1. The connecting side sends its two public keys in plaintext
//! 2. The listening side agrees, wraps a fresh content key and answers in plaintext
//! 3. The connecting side agrees, verifies and unwraps the content key
//! 4. Every later frame is sealed with XChaCha20-Poly1305
//!
//! ## Security
//! - Fresh key pairs and a fresh content key for every connection
//! - Wrapped key authenticated with HMAC-SHA256 and checked in constant time
//! - Frame header bound to the ciphertext as associated data

pub mod handshake;
pub mod security;

#[cfg(test)]
mod tests;
