//! # Core Wire Components
//!
//! Frame layout, the typed field codec and stream reassembly.
//!
//! ## Components
//! - **Field**: length-prefixed textual encoding of scalars, strings and byte runs
//! - **Packet**: one message, built field by field and stamped with its length
//! - **PartialPacket**: receive-side accumulator that turns a byte stream back into frames
//!
//! ## Wire Format
//! ```text
//! [Length(4, big-endian, counts the whole frame)] [Field]*
//! Field = [DigitCount(1)] [ASCII decimal byte length] [Text or raw bytes]
//! ```
//!
//! ## Security
//! - Declared lengths below the header size are rejected
//! - Declared lengths above the configured maximum are rejected before allocation
//! - Allocation failures end the connection, not the process

pub mod field;
pub mod packet;
pub mod partial;

/// Size of the big-endian length header that starts every frame.
pub const HEADER_SIZE: usize = 4;

/// Decode the length header at the start of `bytes`.
#[inline]
pub fn read_header(bytes: &[u8]) -> Option<usize> {
    let header: [u8; HEADER_SIZE] = bytes.get(..HEADER_SIZE)?.try_into().ok()?;
    Some(u32::from_be_bytes(header) as usize)
}
