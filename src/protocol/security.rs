//! Per-connection session security.
//!
//! Each [`Security`] owns two X25519 key pairs generated at construction, a
//! "static" pair and an "ephemeral" pair. Agreement combines both pairs with
//! the peer's:
//!
//! ```text
//! Z    = DH(static, peer_static) ‖ DH(ephemeral, peer_ephemeral)
//! KEK  = SHA-256("peerwire kek" ‖ Z)
//! MACK = SHA-256("peerwire mac" ‖ Z)
//! ```
//!
//! The responding side then picks a random content-encryption key (CEK),
//! wraps it under KEK/MACK and sends the result. The initiating side unwraps
//! and verifies it. From then on both sides seal frames with the CEK.
//!
//! Key material is zeroized on drop and never outlives the connection.

use std::fmt;

use rand_core::OsRng;
use tracing::{debug, instrument, warn};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{constants, ProtocolError, Result};
use crate::utils::crypto::{self, Crypto, KEY_SIZE, WRAPPED_KEY_SIZE};

const KEK_LABEL: &[u8] = b"peerwire kek";
const MAC_LABEL: &[u8] = b"peerwire mac";

/// Size of an X25519 public key on the wire.
pub const PUBLIC_KEY_SIZE: usize = 32;

struct WrapKeys {
    kek: Zeroizing<[u8; KEY_SIZE]>,
    mac: Zeroizing<[u8; KEY_SIZE]>,
}

/// Key pairs, agreed sub-keys and the content cipher for one connection.
pub struct Security {
    static_secret: StaticSecret,
    static_public: PublicKey,
    ephemeral_secret: StaticSecret,
    ephemeral_public: PublicKey,
    wrap_keys: Option<WrapKeys>,
    content: Option<Crypto>,
}

impl Security {
    /// Generate fresh key pairs from the OS random source.
    pub fn new() -> Self {
        let static_secret = StaticSecret::random_from_rng(OsRng);
        let ephemeral_secret = StaticSecret::random_from_rng(OsRng);
        Self {
            static_public: PublicKey::from(&static_secret),
            ephemeral_public: PublicKey::from(&ephemeral_secret),
            static_secret,
            ephemeral_secret,
            wrap_keys: None,
            content: None,
        }
    }

    pub fn public_dh_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.static_public.to_bytes()
    }

    pub fn public_sign_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.ephemeral_public.to_bytes()
    }

    /// True once a content-encryption key is installed.
    pub fn is_ready(&self) -> bool {
        self.content.is_some()
    }

    /// Run the combined agreement against the peer's two public keys and
    /// derive the wrapping sub-keys.
    #[instrument(skip_all)]
    pub fn agree(&mut self, peer_dh: &[u8], peer_sign: &[u8]) -> Result<()> {
        let peer_dh = parse_public(peer_dh)?;
        let peer_sign = parse_public(peer_sign)?;

        let first = self.static_secret.diffie_hellman(&peer_dh);
        let second = self.ephemeral_secret.diffie_hellman(&peer_sign);
        if !first.was_contributory() || !second.was_contributory() {
            warn!("Rejected low-order peer public key");
            return Err(ProtocolError::KeyAgreement(
                constants::ERR_NON_CONTRIBUTORY.into(),
            ));
        }

        let mut shared = Zeroizing::new([0u8; 2 * KEY_SIZE]);
        shared[..KEY_SIZE].copy_from_slice(first.as_bytes());
        shared[KEY_SIZE..].copy_from_slice(second.as_bytes());

        self.wrap_keys = Some(WrapKeys {
            kek: crypto::derive_key(KEK_LABEL, shared.as_slice()),
            mac: crypto::derive_key(MAC_LABEL, shared.as_slice()),
        });
        debug!("Derived key-wrapping sub-keys");
        Ok(())
    }

    /// Responder side: agree, pick a fresh content key, install it and
    /// return it wrapped for transport.
    #[instrument(skip_all)]
    pub fn compute_shared_key(
        &mut self,
        peer_dh: &[u8],
        peer_sign: &[u8],
    ) -> Result<[u8; WRAPPED_KEY_SIZE]> {
        self.agree(peer_dh, peer_sign)?;
        let keys = self
            .wrap_keys
            .take()
            .ok_or_else(|| ProtocolError::KeyAgreement(constants::ERR_NOT_AGREED.into()))?;

        let content_key = crypto::random_key();
        let wrapped = crypto::wrap_key(&keys.kek, &keys.mac, &content_key)?;
        self.content = Some(Crypto::new(&content_key));
        debug!("Generated and wrapped content key");
        Ok(wrapped)
    }

    /// Initiator side: verify and unwrap the responder's content key.
    ///
    /// The wrapping sub-keys are single use and are discarded whether or not
    /// verification succeeds.
    #[instrument(skip_all)]
    pub fn unwrap_content_key(&mut self, wrapped: &[u8]) -> Result<()> {
        let keys = self
            .wrap_keys
            .take()
            .ok_or_else(|| ProtocolError::HandshakeError(constants::ERR_NOT_AGREED.into()))?;

        let content_key = crypto::unwrap_key(&keys.kek, &keys.mac, wrapped)?;
        self.content = Some(Crypto::new(&content_key));
        debug!("Content key verified");
        Ok(())
    }

    /// Seal `plaintext` under the content key. Output is
    /// `ciphertext ‖ tag ‖ nonce`.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        self.cipher()?.encrypt(plaintext, aad)
    }

    /// Open data sealed by the peer's [`Security::encrypt`].
    pub fn decrypt(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        self.cipher()?.decrypt(sealed, aad)
    }

    fn cipher(&self) -> Result<&Crypto> {
        self.content
            .as_ref()
            .ok_or_else(|| ProtocolError::HandshakeError(constants::ERR_NO_CONTENT_KEY.into()))
    }
}

impl Default for Security {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Security")
            .field("agreed", &self.wrap_keys.is_some())
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

fn parse_public(bytes: &[u8]) -> Result<PublicKey> {
    let bytes: [u8; PUBLIC_KEY_SIZE] = bytes
        .try_into()
        .map_err(|_| ProtocolError::HandshakeError(constants::ERR_BAD_PUBLIC_KEY.into()))?;
    Ok(PublicKey::from(bytes))
}
