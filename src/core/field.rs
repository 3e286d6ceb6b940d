//! # Field Encoding
//!
//! Every value carried in a packet is written as its canonical text form,
//! preceded by the text's byte length spelled out in ASCII decimal, which is in
//! turn preceded by a single byte holding the number of those digits.
//!
//! ```text
//! 123i32   -> [0x01] "3" "123"
//! "hej"    -> [0x01] "3" "hej"
//! true     -> [0x01] "1" "1"
//! [0u8;12] -> [0x02] "12" <12 raw bytes>
//! ```
//!
//! Fields carry no type tag. Reading them back with a different type, or in a
//! different order than they were written, yields a decode error or a wrong
//! value; keeping the order straight is the caller's job.

use crate::error::{constants, ProtocolError, Result};
use bytes::BufMut;
use std::borrow::Cow;

/// Types that can be appended to a packet.
pub trait WireEncode {
    /// The canonical text (or raw bytes) written after the length prefix.
    fn wire_text(&self) -> Cow<'_, [u8]>;
}

/// Types that can be extracted from a packet.
pub trait WireDecode: Sized {
    /// Rebuild a value from the text written by [`WireEncode::wire_text`].
    fn from_wire_text(text: &[u8]) -> Result<Self>;
}

impl<T: WireEncode + ?Sized> WireEncode for &T {
    fn wire_text(&self) -> Cow<'_, [u8]> {
        (**self).wire_text()
    }
}

impl WireEncode for bool {
    fn wire_text(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(if *self { b"1" } else { b"0" })
    }
}

impl WireDecode for bool {
    fn from_wire_text(text: &[u8]) -> Result<Self> {
        match text {
            b"1" => Ok(true),
            b"0" => Ok(false),
            other => Err(ProtocolError::Decode(format!(
                "invalid boolean text {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

macro_rules! numeric_field {
    ($($ty:ty),* $(,)?) => {
        $(
            impl WireEncode for $ty {
                fn wire_text(&self) -> Cow<'_, [u8]> {
                    Cow::Owned(self.to_string().into_bytes())
                }
            }

            impl WireDecode for $ty {
                fn from_wire_text(text: &[u8]) -> Result<Self> {
                    let text = std::str::from_utf8(text)
                        .map_err(|_| ProtocolError::Decode(constants::ERR_NOT_UTF8.into()))?;
                    text.parse::<$ty>().map_err(|e| {
                        ProtocolError::Decode(format!(
                            "invalid {} text {text:?}: {e}",
                            stringify!($ty)
                        ))
                    })
                }
            }
        )*
    };
}

numeric_field!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64);

impl WireEncode for str {
    fn wire_text(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.as_bytes())
    }
}

impl WireEncode for String {
    fn wire_text(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.as_bytes())
    }
}

impl WireDecode for String {
    fn from_wire_text(text: &[u8]) -> Result<Self> {
        String::from_utf8(text.to_vec())
            .map_err(|_| ProtocolError::Decode(constants::ERR_NOT_UTF8.into()))
    }
}

impl WireEncode for [u8] {
    fn wire_text(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self)
    }
}

impl WireEncode for Vec<u8> {
    fn wire_text(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.as_slice())
    }
}

impl<const N: usize> WireEncode for [u8; N] {
    fn wire_text(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.as_slice())
    }
}

impl WireDecode for Vec<u8> {
    fn from_wire_text(text: &[u8]) -> Result<Self> {
        Ok(text.to_vec())
    }
}

/// Append one encoded field to `out`.
pub fn encode_field<B: BufMut>(text: &[u8], out: &mut B) {
    let digits = text.len().to_string();
    // usize::MAX has 20 decimal digits, so the count always fits in a byte.
    out.put_u8(digits.len() as u8);
    out.put_slice(digits.as_bytes());
    out.put_slice(text);
}

/// Number of bytes [`encode_field`] writes for a text of `text_len` bytes.
pub fn encoded_len(text_len: usize) -> usize {
    1 + text_len.to_string().len() + text_len
}

/// Split one encoded field off the front of `input`.
///
/// Returns the field's text and the total number of bytes it occupied.
pub fn decode_field(input: &[u8]) -> Result<(&[u8], usize)> {
    let digit_count = *input.first().ok_or(ProtocolError::ExtractPastEnd {
        needed: 1,
        available: 0,
    })? as usize;

    if digit_count == 0 {
        return Err(ProtocolError::Decode(constants::ERR_BAD_LENGTH_DIGITS.into()));
    }

    let digits = input
        .get(1..1 + digit_count)
        .ok_or(ProtocolError::ExtractPastEnd {
            needed: 1 + digit_count,
            available: input.len(),
        })?;

    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(ProtocolError::Decode(constants::ERR_BAD_LENGTH_DIGITS.into()));
    }

    let text_len = std::str::from_utf8(digits)
        .ok()
        .and_then(|d| d.parse::<usize>().ok())
        .ok_or_else(|| ProtocolError::Decode(constants::ERR_BAD_LENGTH_DIGITS.into()))?;

    let start = 1 + digit_count;
    let end = start
        .checked_add(text_len)
        .ok_or_else(|| ProtocolError::Decode(constants::ERR_BAD_LENGTH_DIGITS.into()))?;

    let text = input.get(start..end).ok_or(ProtocolError::ExtractPastEnd {
        needed: end,
        available: input.len(),
    })?;

    Ok((text, end))
}
