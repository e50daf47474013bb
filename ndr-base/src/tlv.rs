//! Type-length-value primitives used by the name encoding.
//!
//! Numbers follow the NDN packet format: a VAR-NUMBER occupies 1, 3, 5 or 9 bytes
//! depending on its magnitude, and a NonNegativeInteger is a minimal 1, 2, 4 or 8
//! byte big endian value.

use bytes::BufMut;

/// Error returned when decoding malformed TLV input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TlvError {
    /// The input ended in the middle of an element.
    #[error("unexpected end of input")]
    UnexpectedEof,
    /// The outer element had a different type than expected.
    #[error("expected tlv type {expected}, found {found}")]
    UnexpectedType {
        /// Type that was expected.
        expected: u64,
        /// Type that was found.
        found: u64,
    },
    /// The element length exceeds what is addressable on this platform.
    #[error("tlv length {0} is too large")]
    LengthOverflow(u64),
    /// Bytes remained after the outermost element.
    #[error("{0} trailing bytes after element")]
    TrailingBytes(usize),
}

/// Number of bytes [`write_var_number`] uses for `n`.
pub fn var_number_len(n: u64) -> usize {
    match n {
        0..=252 => 1,
        253..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Appends `n` as a VAR-NUMBER.
pub fn write_var_number(buf: &mut impl BufMut, n: u64) {
    match n {
        0..=252 => buf.put_u8(n as u8),
        253..=0xffff => {
            buf.put_u8(253);
            buf.put_u16(n as u16);
        }
        0x1_0000..=0xffff_ffff => {
            buf.put_u8(254);
            buf.put_u32(n as u32);
        }
        _ => {
            buf.put_u8(255);
            buf.put_u64(n);
        }
    }
}

/// Reads a VAR-NUMBER from the front of `buf`, advancing it.
pub fn read_var_number(buf: &mut &[u8]) -> Result<u64, TlvError> {
    let (&first, rest) = buf.split_first().ok_or(TlvError::UnexpectedEof)?;
    let width = match first {
        0..=252 => {
            *buf = rest;
            return Ok(first as u64);
        }
        253 => 2,
        254 => 4,
        255 => 8,
    };
    if rest.len() < width {
        return Err(TlvError::UnexpectedEof);
    }
    let n = rest[..width]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | *b as u64);
    *buf = &rest[width..];
    Ok(n)
}

/// Reads one `(type, value)` element from the front of `buf`, advancing it.
pub fn read_element<'a>(buf: &mut &'a [u8]) -> Result<(u64, &'a [u8]), TlvError> {
    let typ = read_var_number(buf)?;
    let len = read_var_number(buf)?;
    let len = usize::try_from(len).map_err(|_| TlvError::LengthOverflow(len))?;
    if buf.len() < len {
        return Err(TlvError::UnexpectedEof);
    }
    let (value, rest) = buf.split_at(len);
    *buf = rest;
    Ok((typ, value))
}

/// Appends one `(type, value)` element.
pub fn write_element(buf: &mut impl BufMut, typ: u64, value: &[u8]) {
    write_var_number(buf, typ);
    write_var_number(buf, value.len() as u64);
    buf.put_slice(value);
}

/// Encodes `n` as a minimal NonNegativeInteger.
pub fn encode_nonneg(n: u64) -> Vec<u8> {
    match n {
        0..=0xff => vec![n as u8],
        0x100..=0xffff => (n as u16).to_be_bytes().to_vec(),
        0x1_0000..=0xffff_ffff => (n as u32).to_be_bytes().to_vec(),
        _ => n.to_be_bytes().to_vec(),
    }
}

/// Decodes a NonNegativeInteger, `None` unless the value is 1, 2, 4 or 8 bytes long.
pub fn decode_nonneg(value: &[u8]) -> Option<u64> {
    match value.len() {
        1 | 2 | 4 | 8 => Some(value.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)),
        _ => None,
    }
}
