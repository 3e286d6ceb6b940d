//! # Frame Reassembly
//!
//! A TCP read returns whatever bytes happen to be available: the tail of one
//! frame, several whole frames, or the head of the next. [`PartialPacket`]
//! accumulates exactly one frame. The caller loops [`PartialPacket::feed`]
//! over a read until every byte is consumed, starting a new accumulator each
//! time one completes.
//!
//! ```rust
//! use peerwire::core::packet::Packet;
//! use peerwire::core::partial::PartialPacket;
//!
//! let mut packet = Packet::new();
//! packet.append("chunked").unwrap();
//! packet.finalize().unwrap();
//!
//! let mut partial = PartialPacket::new(1 << 20);
//! for byte in packet.as_bytes() {
//!     partial.feed(std::slice::from_ref(byte)).unwrap();
//! }
//! assert!(partial.is_complete());
//! assert_eq!(partial.into_packet().unwrap().as_bytes(), packet.as_bytes());
//! ```

use super::packet::Packet;
use super::HEADER_SIZE;
use crate::error::{ProtocolError, Result};

#[derive(Debug)]
enum Stage {
    /// Fewer than four header bytes seen.
    Header { bytes: [u8; HEADER_SIZE], filled: usize },
    /// Header decoded; `buffer` holds the header and the body so far.
    Body { buffer: Vec<u8>, declared: usize },
}

/// Receive-side accumulator for one frame.
#[derive(Debug)]
pub struct PartialPacket {
    stage: Stage,
    max_frame_size: usize,
}

impl PartialPacket {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            stage: Stage::Header {
                bytes: [0; HEADER_SIZE],
                filled: 0,
            },
            max_frame_size,
        }
    }

    /// Consume bytes from the front of `input` toward this frame.
    ///
    /// Returns how many bytes were taken. Never takes more than the frame
    /// still needs, so the rest of `input` belongs to the next frame.
    pub fn feed(&mut self, input: &[u8]) -> Result<usize> {
        let mut consumed = 0;

        if let Stage::Header { bytes, filled } = &mut self.stage {
            let take = (HEADER_SIZE - *filled).min(input.len());
            bytes[*filled..*filled + take].copy_from_slice(&input[..take]);
            *filled += take;
            consumed += take;

            if *filled < HEADER_SIZE {
                return Ok(consumed);
            }

            let header = *bytes;
            let declared = u32::from_be_bytes(header) as usize;
            match declared {
                0 => return Err(ProtocolError::ZeroLengthFrame),
                n if n < HEADER_SIZE => return Err(ProtocolError::InvalidHeader),
                n if n > self.max_frame_size => return Err(ProtocolError::OversizedPacket(n)),
                _ => {}
            }

            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(declared)
                .map_err(|_| ProtocolError::AllocationFailure(declared))?;
            buffer.extend_from_slice(&header);
            self.stage = Stage::Body { buffer, declared };
        }

        if let Stage::Body { buffer, declared } = &mut self.stage {
            let take = (*declared - buffer.len()).min(input.len() - consumed);
            buffer.extend_from_slice(&input[consumed..consumed + take]);
            consumed += take;
        }

        Ok(consumed)
    }

    /// True once the declared number of bytes has arrived.
    pub fn is_complete(&self) -> bool {
        matches!(&self.stage, Stage::Body { buffer, declared } if buffer.len() == *declared)
    }

    /// Bytes accumulated so far, header included.
    pub fn received(&self) -> usize {
        match &self.stage {
            Stage::Header { filled, .. } => *filled,
            Stage::Body { buffer, .. } => buffer.len(),
        }
    }

    /// The completed frame, or `None` if more bytes are needed.
    pub fn into_packet(self) -> Option<Packet> {
        match self.stage {
            Stage::Body { buffer, declared } if buffer.len() == declared => {
                Some(Packet::from_complete(buffer))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    const MAX: usize = 1 << 20;

    fn frame(fields: &[&str]) -> Vec<u8> {
        let mut packet = Packet::new();
        for field in fields {
            packet.append(*field).unwrap();
        }
        packet.finalize().unwrap();
        packet.as_bytes().to_vec()
    }

    #[test]
    fn test_single_feed() {
        let bytes = frame(&["one", "two"]);
        let mut partial = PartialPacket::new(MAX);
        assert_eq!(partial.feed(&bytes).unwrap(), bytes.len());
        assert!(partial.is_complete());
        assert_eq!(partial.into_packet().unwrap().as_bytes(), bytes.as_slice());
    }

    #[test]
    fn test_stops_at_frame_boundary() {
        let first = frame(&["first"]);
        let second = frame(&["second"]);
        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        let mut partial = PartialPacket::new(MAX);
        let used = partial.feed(&stream).unwrap();
        assert_eq!(used, first.len());
        assert!(partial.is_complete());

        let mut next = PartialPacket::new(MAX);
        assert_eq!(next.feed(&stream[used..]).unwrap(), second.len());
        assert_eq!(next.into_packet().unwrap().as_bytes(), second.as_slice());
    }

    #[test]
    fn test_split_inside_header() {
        let bytes = frame(&["split"]);
        let mut partial = PartialPacket::new(MAX);
        assert_eq!(partial.feed(&bytes[..2]).unwrap(), 2);
        assert!(!partial.is_complete());
        assert_eq!(partial.received(), 2);
        assert_eq!(partial.feed(&bytes[2..]).unwrap(), bytes.len() - 2);
        assert!(partial.is_complete());
    }

    #[test]
    fn test_incomplete_yields_nothing() {
        let bytes = frame(&["incomplete"]);
        let mut partial = PartialPacket::new(MAX);
        partial.feed(&bytes[..bytes.len() - 1]).unwrap();
        assert!(!partial.is_complete());
        assert!(partial.into_packet().is_none());
    }

    #[test]
    fn test_zero_length_rejected() {
        let mut partial = PartialPacket::new(MAX);
        assert!(matches!(
            partial.feed(&[0, 0, 0, 0, 1, 2, 3]),
            Err(ProtocolError::ZeroLengthFrame)
        ));
    }

    #[test]
    fn test_short_length_rejected() {
        for declared in 1u32..4 {
            let mut partial = PartialPacket::new(MAX);
            assert!(matches!(
                partial.feed(&declared.to_be_bytes()),
                Err(ProtocolError::InvalidHeader)
            ));
        }
    }

    #[test]
    fn test_oversized_rejected_before_allocation() {
        let mut partial = PartialPacket::new(1024);
        assert!(matches!(
            partial.feed(&u32::MAX.to_be_bytes()),
            Err(ProtocolError::OversizedPacket(n)) if n == u32::MAX as usize
        ));
    }

    #[test]
    fn test_header_only_frame_completes() {
        let mut partial = PartialPacket::new(MAX);
        assert_eq!(partial.feed(&4u32.to_be_bytes()).unwrap(), 4);
        assert!(partial.is_complete());
        assert!(partial.into_packet().unwrap().is_empty());
    }
}
