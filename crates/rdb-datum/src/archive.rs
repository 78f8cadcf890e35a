//! Version-aware serialization trait for on-disk payloads.
//!
//! [`Archive`] plays the role `Encode`/`Decode` play for wire packets, with one
//! difference: every call names the [`CodecVersion`] it reads or writes, so a
//! type can change layout between releases and still decode old files.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt::Debug;
use std::io::{Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt};
use uuid::Uuid;

use crate::codec::{self, read_string};
use crate::error::{CodecError, CodecResult};
use crate::varint::{
    capacity_hint, decode_size, decode_varint_u64, encode_size, encode_varint_u64, read_bool,
    read_f64, size_of_size, varint_size, write_bool, write_bytes, write_f64,
};
use crate::{CodecVersion, Datum};

/// A value with a stable, versioned binary layout.
pub trait Archive: Sized {
    /// Exact number of bytes [`Archive::serialize`] writes.
    fn serialized_size(&self, version: CodecVersion) -> usize;

    fn serialize<W: Write>(&self, writer: &mut W, version: CodecVersion) -> CodecResult<()>;

    fn deserialize<R: Read>(reader: &mut R, version: CodecVersion) -> CodecResult<Self>;
}

/// Serialize into a buffer allocated to the exact size.
pub fn to_vec<T: Archive>(value: &T, version: CodecVersion) -> CodecResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(value.serialized_size(version));
    value.serialize(&mut buf, version)?;
    Ok(buf)
}

/// Deserialize a value that must occupy all of `bytes`.
pub fn from_slice<T: Archive>(bytes: &[u8], version: CodecVersion) -> CodecResult<T> {
    let mut reader = bytes;
    let value = T::deserialize(&mut reader, version)?;
    if !reader.is_empty() {
        return Err(CodecError::TrailingBytes(reader.len()));
    }
    Ok(value)
}

impl Archive for bool {
    fn serialized_size(&self, _: CodecVersion) -> usize {
        1
    }

    fn serialize<W: Write>(&self, writer: &mut W, _: CodecVersion) -> CodecResult<()> {
        write_bool(writer, *self)
    }

    fn deserialize<R: Read>(reader: &mut R, _: CodecVersion) -> CodecResult<Self> {
        read_bool(reader)
    }
}

impl Archive for u8 {
    fn serialized_size(&self, _: CodecVersion) -> usize {
        1
    }

    fn serialize<W: Write>(&self, writer: &mut W, _: CodecVersion) -> CodecResult<()> {
        writer.write_u8(*self)?;
        Ok(())
    }

    fn deserialize<R: Read>(reader: &mut R, _: CodecVersion) -> CodecResult<Self> {
        Ok(reader.read_u8()?)
    }
}

// Unsigned integers are varints on disk.
impl Archive for u64 {
    fn serialized_size(&self, _: CodecVersion) -> usize {
        varint_size(*self)
    }

    fn serialize<W: Write>(&self, writer: &mut W, _: CodecVersion) -> CodecResult<()> {
        encode_varint_u64(writer, *self)
    }

    fn deserialize<R: Read>(reader: &mut R, _: CodecVersion) -> CodecResult<Self> {
        decode_varint_u64(reader)
    }
}

impl Archive for f64 {
    fn serialized_size(&self, _: CodecVersion) -> usize {
        8
    }

    fn serialize<W: Write>(&self, writer: &mut W, _: CodecVersion) -> CodecResult<()> {
        write_f64(writer, *self)
    }

    fn deserialize<R: Read>(reader: &mut R, _: CodecVersion) -> CodecResult<Self> {
        read_f64(reader)
    }
}

impl Archive for String {
    fn serialized_size(&self, _: CodecVersion) -> usize {
        size_of_size(self.len()) + self.len()
    }

    fn serialize<W: Write>(&self, writer: &mut W, _: CodecVersion) -> CodecResult<()> {
        write_bytes(writer, self.as_bytes())
    }

    fn deserialize<R: Read>(reader: &mut R, _: CodecVersion) -> CodecResult<Self> {
        read_string(reader)
    }
}

impl Archive for Uuid {
    fn serialized_size(&self, _: CodecVersion) -> usize {
        16
    }

    fn serialize<W: Write>(&self, writer: &mut W, _: CodecVersion) -> CodecResult<()> {
        writer.write_all(self.as_bytes())?;
        Ok(())
    }

    fn deserialize<R: Read>(reader: &mut R, _: CodecVersion) -> CodecResult<Self> {
        let mut bytes = [0u8; 16];
        reader.read_exact(&mut bytes)?;
        Ok(Uuid::from_bytes(bytes))
    }
}

impl Archive for Datum {
    fn serialized_size(&self, version: CodecVersion) -> usize {
        codec::serialized_size(self, version)
    }

    fn serialize<W: Write>(&self, writer: &mut W, version: CodecVersion) -> CodecResult<()> {
        codec::serialize(writer, self, version, usize::MAX)?;
        Ok(())
    }

    fn deserialize<R: Read>(reader: &mut R, version: CodecVersion) -> CodecResult<Self> {
        codec::deserialize(reader, version)
    }
}

impl<T: Archive> Archive for Option<T> {
    fn serialized_size(&self, version: CodecVersion) -> usize {
        1 + self.as_ref().map_or(0, |v| v.serialized_size(version))
    }

    fn serialize<W: Write>(&self, writer: &mut W, version: CodecVersion) -> CodecResult<()> {
        match self {
            Some(v) => {
                write_bool(writer, true)?;
                v.serialize(writer, version)
            }
            None => write_bool(writer, false),
        }
    }

    fn deserialize<R: Read>(reader: &mut R, version: CodecVersion) -> CodecResult<Self> {
        if read_bool(reader)? {
            Ok(Some(T::deserialize(reader, version)?))
        } else {
            Ok(None)
        }
    }
}

impl<T: Archive> Archive for Vec<T> {
    fn serialized_size(&self, version: CodecVersion) -> usize {
        size_of_size(self.len())
            + self
                .iter()
                .map(|item| item.serialized_size(version))
                .sum::<usize>()
    }

    fn serialize<W: Write>(&self, writer: &mut W, version: CodecVersion) -> CodecResult<()> {
        encode_size(writer, self.len())?;
        for item in self {
            item.serialize(writer, version)?;
        }
        Ok(())
    }

    fn deserialize<R: Read>(reader: &mut R, version: CodecVersion) -> CodecResult<Self> {
        let len = decode_size(reader)?;
        let mut items = Vec::with_capacity(capacity_hint(len));
        for _ in 0..len {
            items.push(T::deserialize(reader, version)?);
        }
        Ok(items)
    }
}

impl<A: Archive, B: Archive> Archive for (A, B) {
    fn serialized_size(&self, version: CodecVersion) -> usize {
        self.0.serialized_size(version) + self.1.serialized_size(version)
    }

    fn serialize<W: Write>(&self, writer: &mut W, version: CodecVersion) -> CodecResult<()> {
        self.0.serialize(writer, version)?;
        self.1.serialize(writer, version)
    }

    fn deserialize<R: Read>(reader: &mut R, version: CodecVersion) -> CodecResult<Self> {
        let a = A::deserialize(reader, version)?;
        let b = B::deserialize(reader, version)?;
        Ok((a, b))
    }
}

impl<K: Archive + Ord + Debug, V: Archive> Archive for BTreeMap<K, V> {
    fn serialized_size(&self, version: CodecVersion) -> usize {
        size_of_size(self.len())
            + self
                .iter()
                .map(|(k, v)| k.serialized_size(version) + v.serialized_size(version))
                .sum::<usize>()
    }

    fn serialize<W: Write>(&self, writer: &mut W, version: CodecVersion) -> CodecResult<()> {
        encode_size(writer, self.len())?;
        for (k, v) in self {
            k.serialize(writer, version)?;
            v.serialize(writer, version)?;
        }
        Ok(())
    }

    fn deserialize<R: Read>(reader: &mut R, version: CodecVersion) -> CodecResult<Self> {
        let len = decode_size(reader)?;
        let mut map = BTreeMap::new();
        for _ in 0..len {
            let k = K::deserialize(reader, version)?;
            let v = V::deserialize(reader, version)?;
            match map.entry(k) {
                Entry::Vacant(slot) => {
                    slot.insert(v);
                }
                Entry::Occupied(slot) => {
                    return Err(CodecError::DuplicateKey(format!("{:?}", slot.key())));
                }
            }
        }
        Ok(map)
    }
}
