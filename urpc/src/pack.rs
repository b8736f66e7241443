//! Payload encoding.
//!
//! A payload is a sequence of fields described by a format string:
//!
//! | tag | field | wire bytes |
//! |-----|-------|------------|
//! | `I` | u32 | 4 |
//! | `L` | u64 | 8 |
//! | `x` | padding | 4, zero |
//! | `P` | buffer | u64 length, then the bytes |
//! | `Q` | reserved buffer | u64 length, then `length` bytes left unwritten |
//!
//! Fields are packed back to back in little-endian order and the total is
//! rounded up to a multiple of eight. Buffers returned by [`unpack`] borrow
//! from the input.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::layout::align8;

/// Encoding or decoding failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PackError {
    #[error("illegal pack type {0:?}")]
    IllegalKind(char),
    #[error("payload truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("field {index} does not match format tag {expected:?}")]
    Mismatch { index: usize, expected: char },
    #[error("format has {expected} fields, got {got}")]
    Arity { expected: usize, got: usize },
}

/// Tag of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    U32,
    U64,
    Pad,
    Bytes,
    Reserve,
}

impl Kind {
    pub fn from_char(c: char) -> Result<Self, PackError> {
        match c {
            'I' => Ok(Kind::U32),
            'L' => Ok(Kind::U64),
            'x' => Ok(Kind::Pad),
            'P' => Ok(Kind::Bytes),
            'Q' => Ok(Kind::Reserve),
            other => Err(PackError::IllegalKind(other)),
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Kind::U32 => 'I',
            Kind::U64 => 'L',
            Kind::Pad => 'x',
            Kind::Bytes => 'P',
            Kind::Reserve => 'Q',
        }
    }
}

/// A parsed format string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format(Vec<Kind>);

impl Format {
    pub fn kinds(&self) -> &[Kind] {
        &self.0
    }
}

impl FromStr for Format {
    type Err = PackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.chars().map(Kind::from_char).collect::<Result<_, _>>().map(Format)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|k| write!(f, "{}", k.as_char()))
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// A value to encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field<'a> {
    U32(u32),
    U64(u64),
    Pad,
    Bytes(&'a [u8]),
    /// Space for `n` bytes the receiver will fill.
    Reserve(usize),
}

impl Field<'_> {
    pub fn kind(&self) -> Kind {
        match self {
            Field::U32(_) => Kind::U32,
            Field::U64(_) => Kind::U64,
            Field::Pad => Kind::Pad,
            Field::Bytes(_) => Kind::Bytes,
            Field::Reserve(_) => Kind::Reserve,
        }
    }

    fn wire_len(&self) -> usize {
        match self {
            Field::U32(_) | Field::Pad => 4,
            Field::U64(_) => 8,
            Field::Bytes(b) => 8 + b.len(),
            Field::Reserve(n) => 8 + n,
        }
    }
}

/// Builds a field list.
#[derive(Debug, Clone, Default)]
pub struct Packer<'a> {
    fields: Vec<Field<'a>>,
}

impl<'a> Packer<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.fields.push(Field::U32(v));
        self
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.fields.push(Field::U64(v));
        self
    }

    pub fn pad(mut self) -> Self {
        self.fields.push(Field::Pad);
        self
    }

    pub fn bytes(mut self, b: &'a [u8]) -> Self {
        self.fields.push(Field::Bytes(b));
        self
    }

    pub fn reserve(mut self, n: usize) -> Self {
        self.fields.push(Field::Reserve(n));
        self
    }

    pub fn fields(&self) -> &[Field<'a>] {
        &self.fields
    }

    /// Format string describing the fields.
    pub fn format(&self) -> Format {
        Format(self.fields.iter().map(Field::kind).collect())
    }
}

/// Encoded size of `fields`, including the trailing alignment.
pub fn packed_size(fields: &[Field<'_>]) -> usize {
    align8(fields.iter().map(Field::wire_len).sum())
}

/// Bytes of `fields` that carry content once packed: everything except
/// the space behind reserve headers, aligned like [`packed_size`].
pub fn written_size(fields: &[Field<'_>]) -> usize {
    let mut pos = 0;
    let mut end = 0;
    for field in fields {
        end = match field {
            Field::Reserve(_) => pos + 8,
            _ => pos + field.wire_len(),
        };
        pos += field.wire_len();
    }
    align8(end)
}

/// Encodes `fields` into the front of `buf` and returns the encoded size.
///
/// Reserved space is skipped, not cleared.
pub fn pack_into(buf: &mut [u8], fields: &[Field<'_>]) -> Result<usize, PackError> {
    let size = packed_size(fields);
    if buf.len() < size {
        return Err(PackError::Truncated {
            need: size,
            have: buf.len(),
        });
    }
    let mut pos = 0;
    for field in fields {
        match *field {
            Field::U32(v) => buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes()),
            Field::U64(v) => buf[pos..pos + 8].copy_from_slice(&v.to_le_bytes()),
            Field::Pad => buf[pos..pos + 4].fill(0),
            Field::Bytes(b) => {
                buf[pos..pos + 8].copy_from_slice(&(b.len() as u64).to_le_bytes());
                buf[pos + 8..pos + 8 + b.len()].copy_from_slice(b);
            }
            Field::Reserve(n) => {
                buf[pos..pos + 8].copy_from_slice(&(n as u64).to_le_bytes());
            }
        }
        pos += field.wire_len();
    }
    buf[pos..size].fill(0);
    Ok(size)
}

/// Encodes `fields` into a new buffer.
pub fn pack(fields: &[Field<'_>]) -> Vec<u8> {
    let mut buf = vec![0u8; packed_size(fields)];
    let size = pack_into(&mut buf, fields).unwrap_or(0);
    debug_assert_eq!(size, buf.len());
    buf
}

/// Checks `fields` against `format` before encoding them.
pub fn pack_checked(format: &str, fields: &[Field<'_>]) -> Result<Vec<u8>, PackError> {
    let format: Format = format.parse()?;
    if format.0.len() != fields.len() {
        return Err(PackError::Arity {
            expected: format.0.len(),
            got: fields.len(),
        });
    }
    for (index, (kind, field)) in format.0.iter().zip(fields).enumerate() {
        if field.kind() != *kind {
            return Err(PackError::Mismatch {
                index,
                expected: kind.as_char(),
            });
        }
    }
    Ok(pack(fields))
}

// =============================================================================
// Decoding
// =============================================================================

/// A decoded value. Buffers alias the encoded payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value<'a> {
    U32(u32),
    U64(u64),
    Bytes(&'a [u8]),
    Reserved(&'a [u8]),
}

impl<'a> Value<'a> {
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    /// Bytes of a `P` or `Q` field.
    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self {
            Value::Bytes(b) | Value::Reserved(b) => Some(b),
            _ => None,
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], PackError> {
        let need = self.pos.checked_add(n).ok_or(PackError::Truncated {
            need: usize::MAX,
            have: self.buf.len(),
        })?;
        if need > self.buf.len() {
            return Err(PackError::Truncated {
                need,
                have: self.buf.len(),
            });
        }
        let s = &self.buf[self.pos..need];
        self.pos = need;
        Ok(s)
    }

    fn u32(&mut self) -> Result<u32, PackError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, PackError> {
        let mut w = [0u8; 8];
        w.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(w))
    }

    fn buffer(&mut self) -> Result<&'a [u8], PackError> {
        let len = self.u64()?;
        let len = usize::try_from(len).map_err(|_| PackError::Truncated {
            need: usize::MAX,
            have: self.buf.len(),
        })?;
        self.take(len)
    }
}

/// Decodes `buf` according to `format`.
///
/// Fails instead of reading past the end of `buf`.
pub fn unpack<'a>(buf: &'a [u8], format: &str) -> Result<Vec<Value<'a>>, PackError> {
    unpack_format(buf, &format.parse()?)
}

/// Decodes `buf` according to a parsed format.
pub fn unpack_format<'a>(buf: &'a [u8], format: &Format) -> Result<Vec<Value<'a>>, PackError> {
    let mut r = Reader { buf, pos: 0 };
    let mut out = Vec::with_capacity(format.0.len());
    for kind in &format.0 {
        match kind {
            Kind::U32 => out.push(Value::U32(r.u32()?)),
            Kind::U64 => out.push(Value::U64(r.u64()?)),
            Kind::Pad => {
                r.take(4)?;
            }
            Kind::Bytes => out.push(Value::Bytes(r.buffer()?)),
            Kind::Reserve => out.push(Value::Reserved(r.buffer()?)),
        }
    }
    Ok(out)
}
