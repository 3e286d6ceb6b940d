//! # Packet
//!
//! One message on the wire. A packet starts with a reserved 4-byte header,
//! grows one field at a time through [`Packet::append`], and is sealed by
//! [`Packet::finalize`], which stamps the big-endian total length into the
//! header. Received packets are already finalized and are read back with
//! [`Packet::extract`] in the order their fields were written.
//!
//! ```rust
//! use peerwire::core::packet::Packet;
//!
//! let mut packet = Packet::new();
//! packet.append("hej").unwrap().append(123i32).unwrap();
//! packet.finalize().unwrap();
//!
//! let mut received = Packet::from_frame(packet.as_bytes()).unwrap();
//! assert_eq!(received.extract::<String>().unwrap(), "hej");
//! assert_eq!(received.extract::<i32>().unwrap(), 123);
//! ```

use bytes::{BufMut, Bytes};
use std::fmt;

use super::field::{decode_field, encode_field, encoded_len, WireDecode, WireEncode};
use super::{read_header, HEADER_SIZE};
use crate::error::{ProtocolError, Result};
use crate::protocol::security::Security;
use crate::utils::crypto::SEAL_OVERHEAD;

/// A length-prefixed message built from textual fields.
///
/// Cloning a packet copies its bytes, so a clone handed to another thread
/// never aliases the original buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    buffer: Vec<u8>,
    read_pos: usize,
    finalized: bool,
}

impl Packet {
    /// Create an empty, unfinalized packet.
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    /// Create an empty packet with room for `capacity` bytes of fields.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut buffer = Vec::with_capacity(HEADER_SIZE + capacity);
        buffer.put_bytes(0, HEADER_SIZE);
        Self {
            buffer,
            read_pos: HEADER_SIZE,
            finalized: false,
        }
    }

    /// Wrap a complete frame received from the wire.
    ///
    /// The embedded header must match the frame's length.
    pub fn from_frame(frame: impl AsRef<[u8]>) -> Result<Self> {
        let frame = frame.as_ref();
        let declared = read_header(frame).ok_or(ProtocolError::InvalidHeader)?;
        if declared != frame.len() {
            return Err(ProtocolError::InvalidHeader);
        }
        Ok(Self {
            buffer: frame.to_vec(),
            read_pos: HEADER_SIZE,
            finalized: true,
        })
    }

    pub(crate) fn from_complete(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            read_pos: HEADER_SIZE,
            finalized: true,
        }
    }

    /// Append one field. Chainable.
    pub fn append<V: WireEncode>(&mut self, value: V) -> Result<&mut Self> {
        if self.finalized {
            return Err(ProtocolError::PacketFinalized);
        }
        let text = value.wire_text();
        self.buffer.reserve(encoded_len(text.len()));
        encode_field(&text, &mut self.buffer);
        Ok(self)
    }

    /// Read the next field as `T`.
    ///
    /// A failed extract leaves the read position where it was.
    pub fn extract<T: WireDecode>(&mut self) -> Result<T> {
        let remaining = self.buffer.get(self.read_pos..).unwrap_or_default();
        let (text, used) = decode_field(remaining)?;
        let value = T::from_wire_text(text)?;
        self.read_pos += used;
        Ok(value)
    }

    /// Stamp the total length into the header. Later calls are no-ops.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        let total = u32::try_from(self.buffer.len())
            .map_err(|_| ProtocolError::OversizedPacket(self.buffer.len()))?;
        self.buffer[..HEADER_SIZE].copy_from_slice(&total.to_be_bytes());
        self.finalized = true;
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Whole frame, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when no field has been appended.
    pub fn is_empty(&self) -> bool {
        self.buffer.len() == HEADER_SIZE
    }

    /// Bytes of field data not yet extracted.
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.read_pos)
    }

    /// Move the read position back to the first field.
    pub fn rewind(&mut self) {
        self.read_pos = HEADER_SIZE;
    }

    /// Hand the frame bytes over for sending.
    pub fn into_frame(self) -> Bytes {
        Bytes::from(self.buffer)
    }

    /// Replace a finalized frame with its encrypted substitution.
    ///
    /// The whole frame, header included, is sealed. The new header covers
    /// the ciphertext, tag and nonce and is bound to them as associated data.
    pub fn to_encrypted(&self, security: &Security) -> Result<Packet> {
        if !self.finalized {
            return Err(ProtocolError::PacketNotFinalized);
        }
        let total = HEADER_SIZE + self.buffer.len() + SEAL_OVERHEAD;
        let header = u32::try_from(total)
            .map_err(|_| ProtocolError::OversizedPacket(total))?
            .to_be_bytes();

        let sealed = security.encrypt(&self.buffer, &header)?;
        debug_assert_eq!(HEADER_SIZE + sealed.len(), total);

        let mut buffer = Vec::with_capacity(total);
        buffer.put_slice(&header);
        buffer.put_slice(&sealed);
        Ok(Self::from_complete(buffer))
    }

    /// Recover the plaintext frame from an encrypted substitution.
    ///
    /// Fails on any tag mismatch and when the recovered frame's own header
    /// does not describe it.
    pub fn from_encrypted(&self, security: &Security) -> Result<Packet> {
        let header = self
            .buffer
            .get(..HEADER_SIZE)
            .ok_or(ProtocolError::InvalidHeader)?;
        if self.buffer.len() < HEADER_SIZE + SEAL_OVERHEAD {
            return Err(ProtocolError::DecryptionFailure);
        }
        let plaintext = security.decrypt(&self.buffer[HEADER_SIZE..], header)?;
        Packet::from_frame(plaintext)
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.buffer.len())
            .field("read_pos", &self.read_pos)
            .field("finalized", &self.finalized)
            .finish()
    }
}
