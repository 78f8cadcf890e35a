//! In-place migration of superblocks written by older releases.

use std::path::Path;

use rdb_datum::CodecVersion;
use tracing::info;

use crate::blob_io::{read_archive, write_blob};
use crate::block::WriteTxn;
use crate::error::MetadataResult;
use crate::superblock::{AuthSuperblock, ClusterSuperblock, Superblock, magic_for};
use crate::types::{AuthMetadata, BranchHistory, ClusterMetadata};

/// A superblock that knows how to re-encode its own blobs.
pub trait Migrate: Superblock {
    /// Decode every blob at `from` and write it back at the latest version.
    fn rewrite_blobs(&mut self, txn: &mut WriteTxn<'_>, from: CodecVersion) -> MetadataResult<()>;
}

impl Migrate for AuthSuperblock {
    fn rewrite_blobs(&mut self, txn: &mut WriteTxn<'_>, from: CodecVersion) -> MetadataResult<()> {
        let metadata: AuthMetadata = read_archive(&*txn, &self.metadata, from)?;
        write_blob(txn, &mut self.metadata, &metadata)
    }
}

impl Migrate for ClusterSuperblock {
    fn rewrite_blobs(&mut self, txn: &mut WriteTxn<'_>, from: CodecVersion) -> MetadataResult<()> {
        let metadata: ClusterMetadata = read_archive(&*txn, &self.metadata, from)?;
        let history: BranchHistory = read_archive(&*txn, &self.branch_history, from)?;
        write_blob(txn, &mut self.metadata, &metadata)?;
        write_blob(txn, &mut self.branch_history, &history)
    }
}

/// Bring the superblock staged in `txn` to the latest format.
///
/// The new magic is staged before any blob is rewritten, and everything lands
/// in the same transaction. A superblock already at the latest version is
/// left untouched.
///
/// # Panics
///
/// Panics if the magic is unrecognized or too old to migrate.
pub fn bring_up_to_date<S: Migrate>(txn: &mut WriteTxn<'_>, path: &Path) -> MetadataResult<S> {
    let mut superblock = S::decode(&txn.superblock()?);
    let version = superblock.format().require(path);
    if version == CodecVersion::LATEST {
        return Ok(superblock);
    }

    info!(
        "migrating {} from {} to {}",
        path.display(),
        version,
        CodecVersion::LATEST
    );
    superblock.set_magic(magic_for(CodecVersion::LATEST));
    txn.write_superblock(&superblock.encode());
    superblock.rewrite_blobs(txn, version)?;
    txn.write_superblock(&superblock.encode());
    Ok(superblock)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::PathBuf;

    use rdb_datum::{Archive, from_slice, to_vec};
    use tempfile::TempDir;
    use uuid::Uuid;

    use super::*;
    use crate::blob_io::write_blob_at;
    use crate::block::{BlockFile, BlockSource};
    use crate::config::MetadataConfig;
    use crate::types::tests::{sample_certificate, sample_cluster};

    pub(crate) fn test_config() -> MetadataConfig {
        MetadataConfig {
            fsync: false,
            ..MetadataConfig::default()
        }
    }

    pub(crate) fn sample_history() -> BranchHistory {
        BranchHistory {
            branches: [(Uuid::from_u128(0xb1), sample_certificate(None))].into(),
        }
    }

    /// What a value looks like after a trip through an older format.
    pub(crate) fn as_seen_at<T: Archive>(value: &T, version: CodecVersion) -> T {
        from_slice(&to_vec(value, version).unwrap(), version).unwrap()
    }

    /// Write a cluster file the way a release using `version` would have.
    pub(crate) fn write_legacy_cluster(
        path: &Path,
        version: CodecVersion,
        server_id: Uuid,
        metadata: &ClusterMetadata,
        history: &BranchHistory,
    ) {
        let mut file = BlockFile::create(path, &test_config()).unwrap();
        let mut txn = file.write_txn();
        let mut superblock = ClusterSuperblock::new(server_id);
        superblock.set_magic(magic_for(version));
        write_blob_at(&mut txn, &mut superblock.metadata, metadata, version).unwrap();
        write_blob_at(&mut txn, &mut superblock.branch_history, history, version).unwrap();
        txn.write_superblock(&superblock.encode());
        txn.commit().unwrap();
    }

    /// Write an auth file the way a release using `version` would have.
    pub(crate) fn write_legacy_auth(path: &Path, version: CodecVersion, metadata: &AuthMetadata) {
        let mut file = BlockFile::create(path, &test_config()).unwrap();
        let mut txn = file.write_txn();
        let mut superblock = AuthSuperblock::new();
        superblock.set_magic(magic_for(version));
        write_blob_at(&mut txn, &mut superblock.metadata, metadata, version).unwrap();
        txn.write_superblock(&superblock.encode());
        txn.commit().unwrap();
    }

    fn reopen(path: &Path) -> BlockFile {
        let mut file = BlockFile::open_existing(path, &test_config()).unwrap();
        let superblock = ClusterSuperblock::decode(&file.read_txn().read_block(0).unwrap());
        let mut live = std::collections::BTreeSet::new();
        for blob_ref in superblock.blob_refs() {
            blob_ref
                .collect_live_blocks(&file.read_txn(), &mut live)
                .unwrap();
        }
        file.set_live_blocks(&live);
        file
    }

    fn migrate(path: &Path) -> (ClusterSuperblock, Vec<u8>) {
        let mut file = reopen(path);
        let mut txn = file.write_txn();
        let superblock: ClusterSuperblock = bring_up_to_date(&mut txn, path).unwrap();
        txn.commit().unwrap();
        let block = file.read_txn().read_block(0).unwrap().into_owned();
        (superblock, block)
    }

    fn scratch() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata");
        (dir, path)
    }

    #[test]
    fn test_migrates_each_legacy_version() {
        let cluster = sample_cluster();
        let history = sample_history();

        for version in [CodecVersion::V1_13, CodecVersion::V1_14, CodecVersion::V1_15] {
            let (_dir, path) = scratch();
            write_legacy_cluster(&path, version, Uuid::from_u128(7), &cluster, &history);

            let (superblock, _) = migrate(&path);
            assert_eq!(&superblock.magic, b"RDmg");
            assert_eq!(superblock.server_id, Uuid::from_u128(7));

            let file = reopen(&path);
            let txn = file.read_txn();
            let read: ClusterMetadata =
                read_archive(&txn, &superblock.metadata, CodecVersion::LATEST).unwrap();
            assert_eq!(read, as_seen_at(&cluster, version), "from {version}");
            let read: BranchHistory =
                read_archive(&txn, &superblock.branch_history, CodecVersion::LATEST).unwrap();
            assert_eq!(read, history, "from {version}");
        }
    }

    #[test]
    fn test_second_pass_is_a_no_op() {
        let (_dir, path) = scratch();
        write_legacy_cluster(
            &path,
            CodecVersion::V1_14,
            Uuid::from_u128(7),
            &sample_cluster(),
            &sample_history(),
        );

        let (first, first_block) = migrate(&path);
        let blob_bytes = |superblock: &ClusterSuperblock| {
            let file = reopen(&path);
            let txn = file.read_txn();
            (
                superblock.metadata.expose_all(&txn).unwrap(),
                superblock.branch_history.expose_all(&txn).unwrap(),
            )
        };
        let first_blobs = blob_bytes(&first);

        let (second, second_block) = migrate(&path);
        assert_eq!(first, second);
        assert_eq!(first_block, second_block);
        assert_eq!(first_blobs, blob_bytes(&second));
    }

    #[test]
    fn test_latest_is_untouched() {
        let (_dir, path) = scratch();
        write_legacy_cluster(
            &path,
            CodecVersion::LATEST,
            Uuid::from_u128(7),
            &sample_cluster(),
            &sample_history(),
        );
        let before = std::fs::read(&path).unwrap();
        migrate(&path);
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    #[should_panic(expected = "upgrade through an intermediate release first")]
    fn test_pre_v1_13_refuses() {
        let (_dir, path) = scratch();
        write_legacy_cluster(
            &path,
            CodecVersion::V1_13,
            Uuid::from_u128(7),
            &ClusterMetadata::default(),
            &BranchHistory::default(),
        );
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[..4].copy_from_slice(b"RDmc");
        std::fs::write(&path, bytes).unwrap();

        migrate(&path);
    }
}
