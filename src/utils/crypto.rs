//! Symmetric primitives used by the session layer.
//!
//! - Content encryption: XChaCha20-Poly1305 with a random 192-bit nonce per
//!   message, laid out as `ciphertext ‖ tag ‖ nonce`.
//! - Key wrapping: ChaCha20 keystream under a one-time key-encryption key,
//!   authenticated with HMAC-SHA256 under a separate MAC key.
//! - Sub-key derivation: SHA-256 over a label and the shared secret.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{constants, ProtocolError, Result};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
pub const TAG_SIZE: usize = 16;

/// Bytes an encrypted message carries beyond its plaintext.
pub const SEAL_OVERHEAD: usize = TAG_SIZE + NONCE_SIZE;

/// Size of a wrapped content key: ciphertext followed by its HMAC tag.
pub const WRAPPED_KEY_SIZE: usize = KEY_SIZE + 32;

type HmacSha256 = Hmac<Sha256>;

/// AEAD cipher bound to one content-encryption key.
pub struct Crypto {
    cipher: XChaCha20Poly1305,
}

impl Crypto {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Fresh random nonce from the OS generator.
    pub fn generate_nonce() -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }

    /// Encrypt `plaintext`, binding `aad`. Returns `ciphertext ‖ tag ‖ nonce`.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let nonce = Self::generate_nonce();
        let mut sealed = self
            .cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| ProtocolError::EncryptionFailure)?;
        sealed.extend_from_slice(&nonce);
        Ok(sealed)
    }

    /// Inverse of [`Crypto::encrypt`]. Any tag mismatch is an error.
    pub fn decrypt(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(ProtocolError::DecryptionFailure);
        }
        let (body, nonce) = sealed.split_at(sealed.len() - NONCE_SIZE);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), Payload { msg: body, aad })
            .map_err(|_| ProtocolError::DecryptionFailure)
    }
}

/// Derive a 256-bit sub-key as `SHA-256(label ‖ secret)`.
pub fn derive_key(label: &[u8], secret: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(secret);
    Zeroizing::new(hasher.finalize().into())
}

/// A fresh random 256-bit key.
pub fn random_key() -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng.fill_bytes(key.as_mut());
    key
}

/// Wrap `key` for transport: `ChaCha20(kek) ⊕ key ‖ HMAC(mac_key, ciphertext)`.
///
/// `kek` must never wrap a second key; the stream nonce is fixed at zero.
pub fn wrap_key(
    kek: &[u8; KEY_SIZE],
    mac_key: &[u8; KEY_SIZE],
    key: &[u8; KEY_SIZE],
) -> Result<[u8; WRAPPED_KEY_SIZE]> {
    let mut wrapped = [0u8; WRAPPED_KEY_SIZE];
    wrapped[..KEY_SIZE].copy_from_slice(key);
    keystream(kek, &mut wrapped[..KEY_SIZE]);

    let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key)
        .map_err(|e| ProtocolError::KeyAgreement(e.to_string()))?;
    mac.update(&wrapped[..KEY_SIZE]);
    wrapped[KEY_SIZE..].copy_from_slice(&mac.finalize().into_bytes());
    Ok(wrapped)
}

/// Verify and unwrap a key produced by [`wrap_key`].
///
/// The tag is checked in constant time before anything is decrypted.
pub fn unwrap_key(
    kek: &[u8; KEY_SIZE],
    mac_key: &[u8; KEY_SIZE],
    wrapped: &[u8],
) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    if wrapped.len() != WRAPPED_KEY_SIZE {
        return Err(ProtocolError::HandshakeError(
            constants::ERR_BAD_WRAPPED_KEY.into(),
        ));
    }
    let (ciphertext, tag) = wrapped.split_at(KEY_SIZE);

    let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key)
        .map_err(|e| ProtocolError::KeyAgreement(e.to_string()))?;
    mac.update(ciphertext);
    mac.verify_slice(tag).map_err(|_| ProtocolError::KeyUnwrap)?;

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(ciphertext);
    keystream(kek, key.as_mut());
    Ok(key)
}

fn keystream(key: &[u8; KEY_SIZE], buf: &mut [u8]) {
    let mut cipher = ChaCha20::new(
        chacha20::Key::from_slice(key),
        chacha20::Nonce::from_slice(&[0u8; 12]),
    );
    cipher.apply_keystream(buf);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_layout_and_open() {
        let key = random_key();
        let crypto = Crypto::new(&key);
        let sealed = crypto.encrypt(b"frame bytes", b"aad").unwrap();
        assert_eq!(sealed.len(), 11 + SEAL_OVERHEAD);
        assert_eq!(crypto.decrypt(&sealed, b"aad").unwrap(), b"frame bytes");
    }

    #[test]
    fn test_nonce_is_fresh_per_message() {
        let crypto = Crypto::new(&random_key());
        let a = crypto.encrypt(b"same", &[]).unwrap();
        let b = crypto.encrypt(b"same", &[]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_aad_or_key_rejected() {
        let crypto = Crypto::new(&random_key());
        let sealed = crypto.encrypt(b"payload", b"one").unwrap();
        assert!(matches!(
            crypto.decrypt(&sealed, b"two"),
            Err(ProtocolError::DecryptionFailure)
        ));

        let other = Crypto::new(&random_key());
        assert!(other.decrypt(&sealed, b"one").is_err());
        assert!(crypto.decrypt(&sealed[..SEAL_OVERHEAD - 1], b"one").is_err());
    }

    #[test]
    fn test_wrap_unwrap() {
        let kek = derive_key(b"kek", b"shared");
        let mac_key = derive_key(b"mac", b"shared");
        let cek = random_key();

        let wrapped = wrap_key(&kek, &mac_key, &cek).unwrap();
        assert_ne!(&wrapped[..KEY_SIZE], cek.as_slice());
        let unwrapped = unwrap_key(&kek, &mac_key, &wrapped).unwrap();
        assert_eq!(unwrapped.as_slice(), cek.as_slice());
    }

    #[test]
    fn test_wrapped_bit_flip_rejected() {
        let kek = derive_key(b"kek", b"shared");
        let mac_key = derive_key(b"mac", b"shared");
        let wrapped = wrap_key(&kek, &mac_key, &random_key()).unwrap();

        for bit in 0..WRAPPED_KEY_SIZE * 8 {
            let mut tampered = wrapped;
            tampered[bit / 8] ^= 1 << (bit % 8);
            assert!(matches!(
                unwrap_key(&kek, &mac_key, &tampered),
                Err(ProtocolError::KeyUnwrap)
            ));
        }
    }

    #[test]
    fn test_derived_keys_differ_by_label() {
        assert_ne!(
            derive_key(b"kek", b"z").as_slice(),
            derive_key(b"mac", b"z").as_slice()
        );
    }
}
