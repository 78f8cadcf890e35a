//! Recursive binary codec for [`Datum`].
//!
//! # Wire format
//!
//! Every datum is a one-byte type tag followed by a tag-specific payload:
//!
//! ```text
//! ┌─────┬──────────────┬───────────────────────────────────────────────┐
//! │ tag │ meaning      │ payload                                       │
//! ├─────┼──────────────┼───────────────────────────────────────────────┤
//! │  1  │ Array        │ varint count, elements                        │
//! │  2  │ Bool         │ 1 byte                                        │
//! │  3  │ Null         │ -                                             │
//! │  4  │ Double       │ 8 bytes IEEE-754, little-endian               │
//! │  5  │ Object       │ varint count, (varint len, key, datum) pairs  │
//! │  6  │ String       │ varint len, UTF-8 bytes                       │
//! │  7  │ IntNegative  │ varint magnitude of -value (value <= 0)       │
//! │  8  │ IntPositive  │ varint magnitude of value (value >= 0)        │
//! │  9  │ Binary       │ varint len, raw bytes                         │
//! └─────┴──────────────┴───────────────────────────────────────────────┘
//! ```
//!
//! These values are part of the on-disk format and never change meaning.
//!
//! Whole numbers up to 2^53 in magnitude use the integer tags, picked by the
//! sign bit so that `-0.0` survives a round trip.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::io::{Read, Write};
use std::sync::Arc;

use byteorder::{ReadBytesExt, WriteBytesExt};

use crate::error::{CodecError, CodecResult};
use crate::varint::{
    capacity_hint, decode_size, decode_varint_u64, encode_size, encode_varint_u64, read_bool,
    read_bytes, read_f64, size_of_size, varint_size, write_bool, write_bytes, write_f64,
};
use crate::{CodecVersion, Datum};

/// Datum type tags.
pub mod tag {
    pub const ARRAY: u8 = 1;
    pub const BOOL: u8 = 2;
    pub const NULL: u8 = 3;
    pub const DOUBLE: u8 = 4;
    pub const OBJECT: u8 = 5;
    pub const STRING: u8 = 6;
    pub const INT_NEGATIVE: u8 = 7;
    pub const INT_POSITIVE: u8 = 8;
    pub const BINARY: u8 = 9;
}

/// Largest integer magnitude a double represents exactly.
pub const MAX_DOUBLE_INT: u64 = 1 << 53;

/// Deepest nesting accepted by [`deserialize`].
///
/// Decoding recurses once per level; this keeps hostile input well inside a
/// default 2 MiB thread stack.
pub const MAX_NESTING_DEPTH: usize = 128;

/// Default element limit for arrays that are going to be persisted.
pub const DEFAULT_ARRAY_LIMIT: usize = 100_000;

/// Outcome of the advisory array-size check done by [`serialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayCheck {
    Fits,
    /// Some array, at any depth, had more elements than the limit.
    TooLarge { len: usize },
}

impl ArrayCheck {
    fn and(self, other: Self) -> Self {
        match self {
            Self::Fits => other,
            Self::TooLarge { .. } => self,
        }
    }

    #[must_use]
    pub fn is_too_large(self) -> bool {
        matches!(self, Self::TooLarge { .. })
    }
}

enum NumberRepr {
    Negative(u64),
    Positive(u64),
    Double,
}

fn number_repr(n: f64, version: CodecVersion) -> NumberRepr {
    if !version.has_integer_tags() || !n.is_finite() || n.trunc() != n {
        return NumberRepr::Double;
    }
    let magnitude = n.abs();
    if magnitude > MAX_DOUBLE_INT as f64 {
        return NumberRepr::Double;
    }
    let magnitude = magnitude as u64;
    if n.is_sign_negative() {
        NumberRepr::Negative(magnitude)
    } else {
        NumberRepr::Positive(magnitude)
    }
}

/// Exact number of bytes [`serialize`] writes for `datum`.
#[must_use]
pub fn serialized_size(datum: &Datum, version: CodecVersion) -> usize {
    let payload = match datum {
        Datum::Null => 0,
        Datum::Bool(_) => 1,
        Datum::Number(n) => match number_repr(*n, version) {
            NumberRepr::Negative(m) | NumberRepr::Positive(m) => varint_size(m),
            NumberRepr::Double => 8,
        },
        Datum::String(s) => size_of_size(s.len()) + s.len(),
        Datum::Binary(b) => size_of_size(b.len()) + b.len(),
        Datum::Array(items) => {
            size_of_size(items.len())
                + items
                    .iter()
                    .map(|item| serialized_size(item, version))
                    .sum::<usize>()
        }
        Datum::Object(pairs) => {
            size_of_size(pairs.len())
                + pairs
                    .iter()
                    .map(|(k, v)| size_of_size(k.len()) + k.len() + serialized_size(v, version))
                    .sum::<usize>()
        }
    };
    1 + payload
}

/// Write `datum` in the format of `version`.
///
/// Arrays longer than `array_limit` are written in full; the returned
/// [`ArrayCheck`] only reports that the value should not be persisted.
pub fn serialize<W: Write>(
    writer: &mut W,
    datum: &Datum,
    version: CodecVersion,
    array_limit: usize,
) -> CodecResult<ArrayCheck> {
    match datum {
        Datum::Null => writer.write_u8(tag::NULL)?,
        Datum::Bool(b) => {
            writer.write_u8(tag::BOOL)?;
            write_bool(writer, *b)?;
        }
        Datum::Number(n) => match number_repr(*n, version) {
            NumberRepr::Negative(m) => {
                writer.write_u8(tag::INT_NEGATIVE)?;
                encode_varint_u64(writer, m)?;
            }
            NumberRepr::Positive(m) => {
                writer.write_u8(tag::INT_POSITIVE)?;
                encode_varint_u64(writer, m)?;
            }
            NumberRepr::Double => {
                writer.write_u8(tag::DOUBLE)?;
                write_f64(writer, *n)?;
            }
        },
        Datum::String(s) => {
            writer.write_u8(tag::STRING)?;
            write_bytes(writer, s.as_bytes())?;
        }
        Datum::Binary(b) => {
            if !version.has_binary() {
                return Err(CodecError::Unsupported {
                    what: "binary datum",
                    version,
                });
            }
            writer.write_u8(tag::BINARY)?;
            write_bytes(writer, b)?;
        }
        Datum::Array(items) => {
            writer.write_u8(tag::ARRAY)?;
            encode_size(writer, items.len())?;
            let mut check = if items.len() > array_limit {
                ArrayCheck::TooLarge { len: items.len() }
            } else {
                ArrayCheck::Fits
            };
            for item in items.iter() {
                check = check.and(serialize(writer, item, version, array_limit)?);
            }
            return Ok(check);
        }
        Datum::Object(pairs) => {
            writer.write_u8(tag::OBJECT)?;
            encode_size(writer, pairs.len())?;
            let mut check = ArrayCheck::Fits;
            for (key, value) in pairs.iter() {
                write_bytes(writer, key.as_bytes())?;
                check = check.and(serialize(writer, value, version, array_limit)?);
            }
            return Ok(check);
        }
    }
    Ok(ArrayCheck::Fits)
}

/// Serialize into a fresh buffer, refusing arrays over `array_limit`.
///
/// This is the variant used when the result is going to be written to disk.
pub fn serialize_checked(
    datum: &Datum,
    version: CodecVersion,
    array_limit: usize,
) -> CodecResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(serialized_size(datum, version));
    match serialize(&mut buf, datum, version, array_limit)? {
        ArrayCheck::Fits => Ok(buf),
        ArrayCheck::TooLarge { len } => Err(CodecError::ArrayTooLarge {
            len,
            limit: array_limit,
        }),
    }
}

/// Read one datum in the format of `version`.
pub fn deserialize<R: Read>(reader: &mut R, version: CodecVersion) -> CodecResult<Datum> {
    deserialize_nested(reader, version, 0)
}

fn deserialize_nested<R: Read>(
    reader: &mut R,
    version: CodecVersion,
    depth: usize,
) -> CodecResult<Datum> {
    if depth > MAX_NESTING_DEPTH {
        return Err(CodecError::NestingTooDeep(MAX_NESTING_DEPTH));
    }
    let type_tag = reader.read_u8()?;
    match type_tag {
        tag::ARRAY => {
            let count = decode_size(reader)?;
            let mut items = Vec::with_capacity(capacity_hint(count));
            for _ in 0..count {
                items.push(deserialize_nested(reader, version, depth + 1)?);
            }
            Ok(Datum::Array(Arc::new(items)))
        }
        tag::BOOL => Ok(Datum::Bool(read_bool(reader)?)),
        tag::NULL => Ok(Datum::Null),
        tag::DOUBLE => Ok(Datum::Number(read_f64(reader)?)),
        tag::OBJECT => {
            let count = decode_size(reader)?;
            let mut pairs = BTreeMap::new();
            for _ in 0..count {
                let key = read_string(reader)?;
                let value = deserialize_nested(reader, version, depth + 1)?;
                match pairs.entry(key) {
                    Entry::Vacant(slot) => {
                        slot.insert(value);
                    }
                    Entry::Occupied(slot) => {
                        return Err(CodecError::DuplicateKey(slot.key().clone()));
                    }
                }
            }
            Ok(Datum::Object(Arc::new(pairs)))
        }
        tag::STRING => Ok(Datum::String(read_string(reader)?.into())),
        tag::INT_NEGATIVE if version.has_integer_tags() => {
            let magnitude = read_integer_magnitude(reader)?;
            Ok(Datum::Number(-(magnitude as f64)))
        }
        tag::INT_POSITIVE if version.has_integer_tags() => {
            let magnitude = read_integer_magnitude(reader)?;
            Ok(Datum::Number(magnitude as f64))
        }
        tag::BINARY if version.has_binary() => Ok(Datum::Binary(read_bytes(reader)?.into())),
        other => Err(CodecError::UnknownTag {
            tag: other,
            version,
        }),
    }
}

fn read_integer_magnitude<R: Read>(reader: &mut R) -> CodecResult<u64> {
    let magnitude = decode_varint_u64(reader)?;
    if magnitude > MAX_DOUBLE_INT {
        return Err(CodecError::IntegerOutOfRange(magnitude));
    }
    Ok(magnitude)
}

pub(crate) fn read_string<R: Read>(reader: &mut R) -> CodecResult<String> {
    Ok(String::from_utf8(read_bytes(reader)?)?)
}
