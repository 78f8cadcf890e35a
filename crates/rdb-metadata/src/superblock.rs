//! Superblock records and format detection.
//!
//! # Layout
//!
//! ```text
//! cluster file, block 0:
//! ┌───────┬───────────┬─────────────────────┬──────────────────────────┬─────────┐
//! │ magic │ server_id │ metadata blob ref   │ branch history blob ref  │ zeroes  │
//! │ 0..4  │ 4..20     │ 20..1520            │ 1520..2020               │ ..4096  │
//! └───────┴───────────┴─────────────────────┴──────────────────────────┴─────────┘
//!
//! auth file, block 0:
//! ┌───────┬─────────────────────┬─────────┐
//! │ magic │ metadata blob ref   │ zeroes  │
//! │ 0..4  │ 4..1504             │ ..4096  │
//! └───────┴─────────────────────┴─────────┘
//! ```
//!
//! The magic always names the format the blobs behind it are written in.

use std::path::Path;

use rdb_datum::CodecVersion;
use uuid::Uuid;

use crate::blob::BlobRef;
use crate::block::BLOCK_SIZE;

pub const MAGIC_LEN: usize = 4;
pub const METADATA_BLOB_REF_SIZE: usize = 1500;
pub const BRANCH_HISTORY_BLOB_REF_SIZE: usize = 500;

/// Common prefix of every magic this family of formats has used.
const MAGIC_PREFIX: &[u8; 3] = b"RDm";

/// Magic tag written for `version`.
#[must_use]
pub fn magic_for(version: CodecVersion) -> [u8; MAGIC_LEN] {
    match version {
        CodecVersion::V1_13 => *b"RDmd",
        CodecVersion::V1_14 => *b"RDme",
        CodecVersion::V1_15 => *b"RDmf",
        CodecVersion::V1_16 => *b"RDmg",
    }
}

/// What a superblock's magic says about its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    Supported(CodecVersion),
    /// Written by a release older than the oldest one this build can migrate.
    TooOld([u8; MAGIC_LEN]),
    Unrecognized([u8; MAGIC_LEN]),
}

impl DiskFormat {
    #[must_use]
    pub fn detect(magic: [u8; MAGIC_LEN]) -> Self {
        if let Some(version) = CodecVersion::ALL
            .into_iter()
            .find(|&v| magic_for(v) == magic)
        {
            return Self::Supported(version);
        }
        let oldest = magic_for(CodecVersion::ALL[0]);
        if magic[..3] == MAGIC_PREFIX[..] && magic[3].is_ascii_lowercase() && magic[3] < oldest[3] {
            Self::TooOld(magic)
        } else {
            Self::Unrecognized(magic)
        }
    }

    /// The version to decode with.
    ///
    /// # Panics
    ///
    /// Panics when the file cannot be read by this build at all.
    #[must_use]
    pub fn require(self, path: &Path) -> CodecVersion {
        match self {
            Self::Supported(version) => version,
            Self::TooOld(magic) => panic!(
                "{}: cannot migrate metadata from a version earlier than {} (magic {:?}); \
                 upgrade through an intermediate release first",
                path.display(),
                CodecVersion::ALL[0],
                String::from_utf8_lossy(&magic),
            ),
            Self::Unrecognized(magic) => panic!(
                "{}: corrupted superblock, unrecognized magic {:02x?}",
                path.display(),
                magic
            ),
        }
    }
}

/// A decoded superblock and the blob references it holds.
pub trait Superblock: Sized {
    fn decode(block: &[u8]) -> Self;

    /// Encode into a full, zero-padded block.
    fn encode(&self) -> Box<[u8]>;

    fn magic(&self) -> [u8; MAGIC_LEN];

    fn set_magic(&mut self, magic: [u8; MAGIC_LEN]);

    fn blob_refs(&self) -> Vec<&BlobRef>;

    fn format(&self) -> DiskFormat {
        DiskFormat::detect(self.magic())
    }
}

fn read_magic(block: &[u8]) -> [u8; MAGIC_LEN] {
    let mut magic = [0; MAGIC_LEN];
    magic.copy_from_slice(&block[..MAGIC_LEN]);
    magic
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSuperblock {
    pub magic: [u8; MAGIC_LEN],
    pub metadata: BlobRef,
}

impl AuthSuperblock {
    const METADATA_AT: usize = MAGIC_LEN;

    /// A fresh superblock at the latest format with an empty blob.
    #[must_use]
    pub fn new() -> Self {
        Self {
            magic: magic_for(CodecVersion::LATEST),
            metadata: BlobRef::empty(METADATA_BLOB_REF_SIZE),
        }
    }
}

impl Default for AuthSuperblock {
    fn default() -> Self {
        Self::new()
    }
}

impl Superblock for AuthSuperblock {
    fn decode(block: &[u8]) -> Self {
        let at = Self::METADATA_AT;
        Self {
            magic: read_magic(block),
            metadata: BlobRef::from_bytes(&block[at..at + METADATA_BLOB_REF_SIZE]),
        }
    }

    fn encode(&self) -> Box<[u8]> {
        let mut block = vec![0u8; BLOCK_SIZE];
        let at = Self::METADATA_AT;
        block[..MAGIC_LEN].copy_from_slice(&self.magic);
        block[at..at + METADATA_BLOB_REF_SIZE].copy_from_slice(self.metadata.as_bytes());
        block.into_boxed_slice()
    }

    fn magic(&self) -> [u8; MAGIC_LEN] {
        self.magic
    }

    fn set_magic(&mut self, magic: [u8; MAGIC_LEN]) {
        self.magic = magic;
    }

    fn blob_refs(&self) -> Vec<&BlobRef> {
        vec![&self.metadata]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSuperblock {
    pub magic: [u8; MAGIC_LEN],
    pub server_id: Uuid,
    pub metadata: BlobRef,
    pub branch_history: BlobRef,
}

impl ClusterSuperblock {
    const SERVER_ID_AT: usize = MAGIC_LEN;
    const METADATA_AT: usize = Self::SERVER_ID_AT + 16;
    const BRANCH_HISTORY_AT: usize = Self::METADATA_AT + METADATA_BLOB_REF_SIZE;

    #[must_use]
    pub fn new(server_id: Uuid) -> Self {
        Self {
            magic: magic_for(CodecVersion::LATEST),
            server_id,
            metadata: BlobRef::empty(METADATA_BLOB_REF_SIZE),
            branch_history: BlobRef::empty(BRANCH_HISTORY_BLOB_REF_SIZE),
        }
    }
}

impl Superblock for ClusterSuperblock {
    fn decode(block: &[u8]) -> Self {
        let mut server_id = [0; 16];
        server_id.copy_from_slice(&block[Self::SERVER_ID_AT..Self::METADATA_AT]);
        Self {
            magic: read_magic(block),
            server_id: Uuid::from_bytes(server_id),
            metadata: BlobRef::from_bytes(&block[Self::METADATA_AT..Self::BRANCH_HISTORY_AT]),
            branch_history: BlobRef::from_bytes(
                &block[Self::BRANCH_HISTORY_AT..Self::BRANCH_HISTORY_AT + BRANCH_HISTORY_BLOB_REF_SIZE],
            ),
        }
    }

    fn encode(&self) -> Box<[u8]> {
        let mut block = vec![0u8; BLOCK_SIZE];
        block[..MAGIC_LEN].copy_from_slice(&self.magic);
        block[Self::SERVER_ID_AT..Self::METADATA_AT].copy_from_slice(self.server_id.as_bytes());
        block[Self::METADATA_AT..Self::BRANCH_HISTORY_AT].copy_from_slice(self.metadata.as_bytes());
        block[Self::BRANCH_HISTORY_AT..Self::BRANCH_HISTORY_AT + BRANCH_HISTORY_BLOB_REF_SIZE]
            .copy_from_slice(self.branch_history.as_bytes());
        block.into_boxed_slice()
    }

    fn magic(&self) -> [u8; MAGIC_LEN] {
        self.magic
    }

    fn set_magic(&mut self, magic: [u8; MAGIC_LEN]) {
        self.magic = magic;
    }

    fn blob_refs(&self) -> Vec<&BlobRef> {
        vec![&self.metadata, &self.branch_history]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_known_magics() {
        for version in CodecVersion::ALL {
            assert_eq!(
                DiskFormat::detect(magic_for(version)),
                DiskFormat::Supported(version)
            );
        }
    }

    #[test]
    fn test_detect_too_old_and_garbage() {
        assert_eq!(DiskFormat::detect(*b"RDmc"), DiskFormat::TooOld(*b"RDmc"));
        assert_eq!(DiskFormat::detect(*b"RDma"), DiskFormat::TooOld(*b"RDma"));
        assert_eq!(DiskFormat::detect(*b"RDmz"), DiskFormat::Unrecognized(*b"RDmz"));
        assert_eq!(DiskFormat::detect([0; 4]), DiskFormat::Unrecognized([0; 4]));
    }

    #[test]
    #[should_panic(expected = "upgrade through an intermediate release first")]
    fn test_too_old_panics_with_upgrade_hint() {
        let _ = DiskFormat::detect(*b"RDmc").require(Path::new("metadata"));
    }

    #[test]
    #[should_panic(expected = "corrupted superblock")]
    fn test_unrecognized_panics() {
        let _ = DiskFormat::detect(*b"XXXX").require(Path::new("metadata"));
    }

    #[test]
    fn test_cluster_field_offsets() {
        let id = Uuid::from_u128(0x0011_2233_4455_6677_8899_aabb_ccdd_eeff);
        let superblock = ClusterSuperblock::new(id);
        let block = superblock.encode();

        assert_eq!(block.len(), BLOCK_SIZE);
        assert_eq!(&block[..4], b"RDmg");
        assert_eq!(&block[4..20], id.as_bytes());
        assert!(block[20..].iter().all(|&b| b == 0));
        assert_eq!(ClusterSuperblock::decode(&block), superblock);
    }

    #[test]
    fn test_auth_roundtrip_from_zeroed_block() {
        let mut block = vec![0u8; BLOCK_SIZE];
        block[..4].copy_from_slice(b"RDme");
        let superblock = AuthSuperblock::decode(&block);
        assert_eq!(superblock.format(), DiskFormat::Supported(CodecVersion::V1_14));
        assert_eq!(superblock.metadata, BlobRef::empty(METADATA_BLOB_REF_SIZE));
        assert_eq!(&*superblock.encode(), block.as_slice());
    }
}
