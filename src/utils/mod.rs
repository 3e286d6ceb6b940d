//! # Utility Modules
//!
//! Supporting utilities for cryptography, logging, and metrics.
//!
//! ## Components
//! - **Crypto**: XChaCha20-Poly1305 AEAD, key wrapping and sub-key derivation
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe observability counters
//!
//! ## Security
//! - Cryptographically secure RNG (OS source via rand_core)
//! - Memory zeroing for key material (zeroize crate)

pub mod crypto;
pub mod logging;
pub mod metrics;

pub use metrics::{Metrics, MetricsSnapshot};
