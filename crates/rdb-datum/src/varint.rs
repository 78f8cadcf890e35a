//! Variable-length integers and fixed-width primitives.
//!
//! Varints are little-endian base-128: each byte carries seven payload bits,
//! the high bit marks continuation. Fixed-width primitives use one
//! architecture-independent layout (little-endian) so serialized bytes are
//! portable across hosts.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{CodecError, CodecResult};

/// Longest encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Upper bound on speculative preallocation driven by untrusted lengths.
const PREALLOC_LIMIT: usize = 64 * 1024;

/// Number of bytes [`encode_varint_u64`] writes for `value`.
#[inline]
#[must_use]
pub fn varint_size(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

pub fn encode_varint_u64<W: Write>(writer: &mut W, mut value: u64) -> CodecResult<()> {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        writer.write_u8(byte)?;
        if value == 0 {
            return Ok(());
        }
    }
}

pub fn decode_varint_u64<R: Read>(reader: &mut R) -> CodecResult<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = reader.read_u8()?;
        let group = u64::from(byte & 0x7F);
        // The tenth group only has room for the top bit.
        if shift == 63 && group > 1 {
            return Err(CodecError::VarintOverflow);
        }
        result |= group << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift > 63 {
            return Err(CodecError::VarintOverflow);
        }
    }
}

/// Decode a varint that is used as a length or count.
pub fn decode_size<R: Read>(reader: &mut R) -> CodecResult<usize> {
    let value = decode_varint_u64(reader)?;
    usize::try_from(value).map_err(|_| CodecError::SizeOverflow(value))
}

pub fn encode_size<W: Write>(writer: &mut W, len: usize) -> CodecResult<()> {
    encode_varint_u64(writer, len as u64)
}

#[inline]
#[must_use]
pub fn size_of_size(len: usize) -> usize {
    varint_size(len as u64)
}

pub fn write_bool<W: Write>(writer: &mut W, value: bool) -> CodecResult<()> {
    writer.write_u8(u8::from(value))?;
    Ok(())
}

pub fn read_bool<R: Read>(reader: &mut R) -> CodecResult<bool> {
    match reader.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CodecError::InvalidBool(other)),
    }
}

pub fn write_f64<W: Write>(writer: &mut W, value: f64) -> CodecResult<()> {
    writer.write_f64::<LittleEndian>(value)?;
    Ok(())
}

pub fn read_f64<R: Read>(reader: &mut R) -> CodecResult<f64> {
    Ok(reader.read_f64::<LittleEndian>()?)
}

/// Write a varint length followed by the raw bytes.
pub fn write_bytes<W: Write>(writer: &mut W, bytes: &[u8]) -> CodecResult<()> {
    encode_size(writer, bytes.len())?;
    writer.write_all(bytes)?;
    Ok(())
}

/// Read exactly `len` raw bytes.
///
/// Allocation grows with the bytes actually present, so a forged length
/// cannot force a huge allocation before the input runs out.
pub fn read_exact_len<R: Read>(reader: &mut R, len: usize) -> CodecResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(len.min(PREALLOC_LIMIT));
    reader.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(CodecError::Truncated);
    }
    Ok(buf)
}

/// Read a varint length followed by that many raw bytes.
pub fn read_bytes<R: Read>(reader: &mut R) -> CodecResult<Vec<u8>> {
    let len = decode_size(reader)?;
    read_exact_len(reader, len)
}

/// Capacity hint for a collection whose element count came off the wire.
#[inline]
#[must_use]
pub(crate) fn capacity_hint(count: usize) -> usize {
    count.min(PREALLOC_LIMIT / 16)
}
