//! Metadata payloads stored in the superblock blobs.
//!
//! Layout changes between format versions:
//!
//! - v1.13 wrote [`Versioned`] registers without a timestamp
//! - v1.15 added [`ServerMetadata::tags`]
//! - v1.16 added [`ServerMetadata::cache_size_mb`]
//!
//! Fields missing from an older format decode to their defaults.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use rdb_datum::varint::{read_bool, read_bytes, size_of_size, write_bool, write_bytes};
use rdb_datum::{Archive, CodecResult, CodecVersion, Datum};
use uuid::Uuid;

pub type ServerId = Uuid;
pub type BranchId = Uuid;
pub type DatabaseId = Uuid;
pub type TableId = Uuid;

/// A last-writer-wins register.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct Versioned<T> {
    pub value: T,
    pub timestamp: u64,
}

impl<T> Versioned<T> {
    pub fn new(value: T, timestamp: u64) -> Self {
        Self { value, timestamp }
    }
}

impl<T: Archive> Archive for Versioned<T> {
    fn serialized_size(&self, version: CodecVersion) -> usize {
        let timestamp = if version.has_timestamps() {
            self.timestamp.serialized_size(version)
        } else {
            0
        };
        self.value.serialized_size(version) + timestamp
    }

    fn serialize<W: Write>(&self, writer: &mut W, version: CodecVersion) -> CodecResult<()> {
        self.value.serialize(writer, version)?;
        if version.has_timestamps() {
            self.timestamp.serialize(writer, version)?;
        }
        Ok(())
    }

    fn deserialize<R: Read>(reader: &mut R, version: CodecVersion) -> CodecResult<Self> {
        let value = T::deserialize(reader, version)?;
        let timestamp = if version.has_timestamps() {
            u64::deserialize(reader, version)?
        } else {
            0
        };
        Ok(Self { value, timestamp })
    }
}

/// An entry that may have been deleted; deletion is permanent.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum Deletable<T> {
    Live(T),
    Deleted,
}

impl<T> Deletable<T> {
    #[must_use]
    pub fn get(&self) -> Option<&T> {
        match self {
            Self::Live(value) => Some(value),
            Self::Deleted => None,
        }
    }
}

impl<T: Archive> Archive for Deletable<T> {
    fn serialized_size(&self, version: CodecVersion) -> usize {
        1 + self.get().map_or(0, |v| v.serialized_size(version))
    }

    fn serialize<W: Write>(&self, writer: &mut W, version: CodecVersion) -> CodecResult<()> {
        match self {
            Self::Live(value) => {
                write_bool(writer, true)?;
                value.serialize(writer, version)
            }
            Self::Deleted => write_bool(writer, false),
        }
    }

    fn deserialize<R: Read>(reader: &mut R, version: CodecVersion) -> CodecResult<Self> {
        if read_bool(reader)? {
            Ok(Self::Live(T::deserialize(reader, version)?))
        } else {
            Ok(Self::Deleted)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ServerMetadata {
    pub name: Versioned<String>,
    pub tags: Versioned<Vec<String>>,
    pub cache_size_mb: Option<u64>,
}

impl Archive for ServerMetadata {
    fn serialized_size(&self, version: CodecVersion) -> usize {
        let mut size = self.name.serialized_size(version);
        if version >= CodecVersion::V1_15 {
            size += self.tags.serialized_size(version);
        }
        if version >= CodecVersion::V1_16 {
            size += self.cache_size_mb.serialized_size(version);
        }
        size
    }

    fn serialize<W: Write>(&self, writer: &mut W, version: CodecVersion) -> CodecResult<()> {
        self.name.serialize(writer, version)?;
        if version >= CodecVersion::V1_15 {
            self.tags.serialize(writer, version)?;
        }
        if version >= CodecVersion::V1_16 {
            self.cache_size_mb.serialize(writer, version)?;
        }
        Ok(())
    }

    fn deserialize<R: Read>(reader: &mut R, version: CodecVersion) -> CodecResult<Self> {
        let name = Versioned::deserialize(reader, version)?;
        let tags = if version >= CodecVersion::V1_15 {
            Versioned::deserialize(reader, version)?
        } else {
            Versioned::default()
        };
        let cache_size_mb = if version >= CodecVersion::V1_16 {
            Option::deserialize(reader, version)?
        } else {
            None
        };
        Ok(Self {
            name,
            tags,
            cache_size_mb,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DatabaseMetadata {
    pub name: Versioned<String>,
}

impl Archive for DatabaseMetadata {
    fn serialized_size(&self, version: CodecVersion) -> usize {
        self.name.serialized_size(version)
    }

    fn serialize<W: Write>(&self, writer: &mut W, version: CodecVersion) -> CodecResult<()> {
        self.name.serialize(writer, version)
    }

    fn deserialize<R: Read>(reader: &mut R, version: CodecVersion) -> CodecResult<Self> {
        Ok(Self {
            name: Versioned::deserialize(reader, version)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct TableMetadata {
    pub database: DatabaseId,
    pub name: String,
    pub primary_key: String,
    /// Free-form table configuration.
    pub config: Datum,
}

impl Archive for TableMetadata {
    fn serialized_size(&self, version: CodecVersion) -> usize {
        self.database.serialized_size(version)
            + self.name.serialized_size(version)
            + self.primary_key.serialized_size(version)
            + self.config.serialized_size(version)
    }

    fn serialize<W: Write>(&self, writer: &mut W, version: CodecVersion) -> CodecResult<()> {
        self.database.serialize(writer, version)?;
        self.name.serialize(writer, version)?;
        self.primary_key.serialize(writer, version)?;
        self.config.serialize(writer, version)
    }

    fn deserialize<R: Read>(reader: &mut R, version: CodecVersion) -> CodecResult<Self> {
        Ok(Self {
            database: Uuid::deserialize(reader, version)?,
            name: String::deserialize(reader, version)?,
            primary_key: String::deserialize(reader, version)?,
            config: Datum::deserialize(reader, version)?,
        })
    }
}

/// Cluster-wide configuration, as persisted by every server.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct ClusterMetadata {
    pub servers: BTreeMap<ServerId, Deletable<ServerMetadata>>,
    pub databases: BTreeMap<DatabaseId, Deletable<DatabaseMetadata>>,
    pub tables: BTreeMap<TableId, Deletable<TableMetadata>>,
}

impl Archive for ClusterMetadata {
    fn serialized_size(&self, version: CodecVersion) -> usize {
        self.servers.serialized_size(version)
            + self.databases.serialized_size(version)
            + self.tables.serialized_size(version)
    }

    fn serialize<W: Write>(&self, writer: &mut W, version: CodecVersion) -> CodecResult<()> {
        self.servers.serialize(writer, version)?;
        self.databases.serialize(writer, version)?;
        self.tables.serialize(writer, version)
    }

    fn deserialize<R: Read>(reader: &mut R, version: CodecVersion) -> CodecResult<Self> {
        Ok(Self {
            servers: BTreeMap::deserialize(reader, version)?,
            databases: BTreeMap::deserialize(reader, version)?,
            tables: BTreeMap::deserialize(reader, version)?,
        })
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct AuthMetadata {
    pub auth_key: Versioned<String>,
}

impl Archive for AuthMetadata {
    fn serialized_size(&self, version: CodecVersion) -> usize {
        self.auth_key.serialized_size(version)
    }

    fn serialize<W: Write>(&self, writer: &mut W, version: CodecVersion) -> CodecResult<()> {
        self.auth_key.serialize(writer, version)
    }

    fn deserialize<R: Read>(reader: &mut R, version: CodecVersion) -> CodecResult<Self> {
        Ok(Self {
            auth_key: Versioned::deserialize(reader, version)?,
        })
    }
}

/// A half-open range of keys; `right == None` means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct KeyRange {
    pub left: Vec<u8>,
    pub right: Option<Vec<u8>>,
}

impl KeyRange {
    /// Every key.
    #[must_use]
    pub fn universe() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn new(left: impl Into<Vec<u8>>, right: Option<Vec<u8>>) -> Self {
        Self {
            left: left.into(),
            right,
        }
    }
}

impl Archive for KeyRange {
    fn serialized_size(&self, _: CodecVersion) -> usize {
        let right = self.right.as_ref().map_or(0, |r| size_of_size(r.len()) + r.len());
        size_of_size(self.left.len()) + self.left.len() + 1 + right
    }

    fn serialize<W: Write>(&self, writer: &mut W, _: CodecVersion) -> CodecResult<()> {
        write_bytes(writer, &self.left)?;
        match &self.right {
            Some(right) => {
                write_bool(writer, true)?;
                write_bytes(writer, right)
            }
            None => write_bool(writer, false),
        }
    }

    fn deserialize<R: Read>(reader: &mut R, _: CodecVersion) -> CodecResult<Self> {
        let left = read_bytes(reader)?;
        let right = if read_bool(reader)? {
            Some(read_bytes(reader)?)
        } else {
            None
        };
        Ok(Self { left, right })
    }
}

/// A point in a branch's history. The nil branch is the empty initial state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct Version {
    pub branch: BranchId,
    pub timestamp: u64,
}

impl Version {
    #[must_use]
    pub fn new(branch: BranchId, timestamp: u64) -> Self {
        Self { branch, timestamp }
    }

    /// The version every range starts from.
    #[must_use]
    pub fn zero() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.branch.is_nil()
    }
}

impl Archive for Version {
    fn serialized_size(&self, version: CodecVersion) -> usize {
        self.branch.serialized_size(version) + self.timestamp.serialized_size(version)
    }

    fn serialize<W: Write>(&self, writer: &mut W, version: CodecVersion) -> CodecResult<()> {
        self.branch.serialize(writer, version)?;
        self.timestamp.serialize(writer, version)
    }

    fn deserialize<R: Read>(reader: &mut R, version: CodecVersion) -> CodecResult<Self> {
        Ok(Self {
            branch: Uuid::deserialize(reader, version)?,
            timestamp: u64::deserialize(reader, version)?,
        })
    }
}

/// Where a branch forked from and when.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct BranchBirthCertificate {
    pub region: KeyRange,
    pub initial_timestamp: u64,
    /// For each part of `region`, the version it was forked from.
    pub origin: Vec<(KeyRange, Version)>,
}

impl BranchBirthCertificate {
    /// Parent branches this one was forked from.
    pub fn parents(&self) -> impl Iterator<Item = BranchId> + '_ {
        self.origin
            .iter()
            .filter(|(_, v)| !v.is_zero())
            .map(|(_, v)| v.branch)
    }
}

impl Archive for BranchBirthCertificate {
    fn serialized_size(&self, version: CodecVersion) -> usize {
        self.region.serialized_size(version)
            + self.initial_timestamp.serialized_size(version)
            + self.origin.serialized_size(version)
    }

    fn serialize<W: Write>(&self, writer: &mut W, version: CodecVersion) -> CodecResult<()> {
        self.region.serialize(writer, version)?;
        self.initial_timestamp.serialize(writer, version)?;
        self.origin.serialize(writer, version)
    }

    fn deserialize<R: Read>(reader: &mut R, version: CodecVersion) -> CodecResult<Self> {
        Ok(Self {
            region: KeyRange::deserialize(reader, version)?,
            initial_timestamp: u64::deserialize(reader, version)?,
            origin: Vec::deserialize(reader, version)?,
        })
    }
}

/// All known branches.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct BranchHistory {
    pub branches: BTreeMap<BranchId, BranchBirthCertificate>,
}

impl Archive for BranchHistory {
    fn serialized_size(&self, version: CodecVersion) -> usize {
        self.branches.serialized_size(version)
    }

    fn serialize<W: Write>(&self, writer: &mut W, version: CodecVersion) -> CodecResult<()> {
        self.branches.serialize(writer, version)
    }

    fn deserialize<R: Read>(reader: &mut R, version: CodecVersion) -> CodecResult<Self> {
        Ok(Self {
            branches: BTreeMap::deserialize(reader, version)?,
        })
    }
}
