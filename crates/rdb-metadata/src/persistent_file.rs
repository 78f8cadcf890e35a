//! Auth and cluster metadata files.
//!
//! Opening an existing file always rewrites its metadata once, which runs
//! the migration for files written by older releases.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use rdb_datum::CodecVersion;
use tracing::{debug, info};

use crate::blob_io::{read_archive, write_blob};
use crate::block::{BlockFile, BlockSource, SUPERBLOCK_ID, WriteTxn};
use crate::branch_history::BranchHistoryManager;
use crate::config::MetadataConfig;
use crate::error::MetadataResult;
use crate::migration::{Migrate, bring_up_to_date};
use crate::superblock::{AuthSuperblock, ClusterSuperblock, Superblock};
use crate::types::{AuthMetadata, BranchHistory, ClusterMetadata, ServerId};

/// A metadata file a persister can write to.
pub trait PersistentFile: Send + Sync + 'static {
    type Metadata: Clone + Send + Sync + 'static;

    fn read_metadata(&self) -> MetadataResult<Self::Metadata>;

    /// Replace the stored metadata, migrating the file first if needed.
    fn update_metadata(&self, metadata: &Self::Metadata) -> MetadataResult<()>;

    /// Wait for state flushed independently of the metadata.
    fn flush_auxiliary(&self) -> impl Future<Output = ()> + Send;
}

/// Decode the committed superblock and the version its blobs are in.
fn committed_superblock<S: Superblock>(file: &BlockFile) -> MetadataResult<(S, CodecVersion)> {
    let superblock = S::decode(&file.read_txn().read_block(SUPERBLOCK_ID)?);
    let version = superblock.format().require(file.path());
    Ok((superblock, version))
}

/// Open `path`, rejecting unreadable formats and rebuilding the free list.
fn open_block_file<S: Superblock>(path: &Path, config: &MetadataConfig) -> MetadataResult<BlockFile> {
    let mut file = BlockFile::open_existing(path, config)?;
    let (superblock, version) = committed_superblock::<S>(&file)?;

    let mut live = BTreeSet::new();
    for blob_ref in superblock.blob_refs() {
        blob_ref.collect_live_blocks(&file.read_txn(), &mut live)?;
    }
    file.set_live_blocks(&live);
    info!(
        "opened {} at {} ({} blocks, {} free)",
        path.display(),
        version,
        file.block_count(),
        file.free_count()
    );
    Ok(file)
}

/// Migrate if needed, then let `update` change the superblock and its blobs.
fn update_superblock<S: Migrate>(
    file: &RwLock<BlockFile>,
    update: impl FnOnce(&mut WriteTxn<'_>, &mut S) -> MetadataResult<()>,
) -> MetadataResult<()> {
    let mut file = file.write();
    let path = file.path().to_path_buf();
    let mut txn = file.write_txn();
    let mut superblock: S = bring_up_to_date(&mut txn, &path)?;
    update(&mut txn, &mut superblock)?;
    txn.write_superblock(&superblock.encode());
    txn.commit()?;
    Ok(())
}

/// Metadata file holding authentication settings.
pub struct AuthPersistentFile {
    file: RwLock<BlockFile>,
}

impl AuthPersistentFile {
    pub fn create(
        path: impl AsRef<Path>,
        initial: &AuthMetadata,
        config: &MetadataConfig,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let mut file = BlockFile::create(path, config)?;
        let mut txn = file.write_txn();
        let mut superblock = AuthSuperblock::new();
        write_blob(&mut txn, &mut superblock.metadata, initial)?;
        txn.write_superblock(&superblock.encode());
        txn.commit()?;
        info!("created auth metadata file {}", path.display());

        Ok(Self {
            file: RwLock::new(file),
        })
    }

    /// Open and migrate an existing file.
    ///
    /// # Panics
    ///
    /// Panics if the file is corrupted or too old to migrate.
    pub fn open_existing(path: impl AsRef<Path>, config: &MetadataConfig) -> MetadataResult<Self> {
        let file = open_block_file::<AuthSuperblock>(path.as_ref(), config)?;
        let this = Self {
            file: RwLock::new(file),
        };
        this.update_metadata(&this.read_metadata()?)?;
        Ok(this)
    }
}

impl PersistentFile for AuthPersistentFile {
    type Metadata = AuthMetadata;

    fn read_metadata(&self) -> MetadataResult<AuthMetadata> {
        let file = self.file.read();
        let (superblock, version) = committed_superblock::<AuthSuperblock>(&file)?;
        read_archive(&file.read_txn(), &superblock.metadata, version)
    }

    fn update_metadata(&self, metadata: &AuthMetadata) -> MetadataResult<()> {
        update_superblock(&self.file, |txn, superblock: &mut AuthSuperblock| {
            write_blob(txn, &mut superblock.metadata, metadata)
        })
    }

    async fn flush_auxiliary(&self) {}
}

/// Metadata file holding cluster configuration and branch history.
pub struct ClusterPersistentFile {
    file: Arc<RwLock<BlockFile>>,
    server_id: ServerId,
    branch_history: BranchHistoryManager,
}

impl ClusterPersistentFile {
    pub fn create(
        path: impl AsRef<Path>,
        server_id: ServerId,
        initial: &ClusterMetadata,
        config: &MetadataConfig,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let mut file = BlockFile::create(path, config)?;
        let mut txn = file.write_txn();
        let mut superblock = ClusterSuperblock::new(server_id);
        write_blob(&mut txn, &mut superblock.metadata, initial)?;
        write_blob(&mut txn, &mut superblock.branch_history, &BranchHistory::default())?;
        txn.write_superblock(&superblock.encode());
        txn.commit()?;
        info!(
            "created cluster metadata file {} for server {}",
            path.display(),
            server_id
        );

        Ok(Self::with_file(
            Arc::new(RwLock::new(file)),
            server_id,
            BranchHistory::default(),
            config,
        ))
    }

    /// Open and migrate an existing file.
    ///
    /// # Panics
    ///
    /// Panics if the file is corrupted or too old to migrate.
    pub fn open_existing(path: impl AsRef<Path>, config: &MetadataConfig) -> MetadataResult<Self> {
        let file = Arc::new(RwLock::new(open_block_file::<ClusterSuperblock>(
            path.as_ref(),
            config,
        )?));

        let metadata = read_cluster_metadata(&file)?;
        update_cluster_metadata(&file, &metadata)?;

        let (server_id, history) = {
            let file = file.read();
            let (superblock, version) = committed_superblock::<ClusterSuperblock>(&file)?;
            let history: BranchHistory =
                read_archive(&file.read_txn(), &superblock.branch_history, version)?;
            (superblock.server_id, history)
        };
        Ok(Self::with_file(file, server_id, history, config))
    }

    fn with_file(
        file: Arc<RwLock<BlockFile>>,
        server_id: ServerId,
        history: BranchHistory,
        config: &MetadataConfig,
    ) -> Self {
        // Weak so a round finishing after the file is dropped cannot keep it locked.
        let target = Arc::downgrade(&file);
        let branch_history =
            BranchHistoryManager::new(history, config.max_active_commits, move |history| {
                let Some(target) = target.upgrade() else {
                    debug!("cluster file closed, skipping branch history write");
                    return Ok(());
                };
                update_superblock(&target, |txn, superblock: &mut ClusterSuperblock| {
                    write_blob(txn, &mut superblock.branch_history, history)
                })
            });
        Self {
            file,
            server_id,
            branch_history,
        }
    }

    #[must_use]
    pub fn read_server_id(&self) -> ServerId {
        self.server_id
    }

    #[must_use]
    pub fn branch_history_manager(&self) -> &BranchHistoryManager {
        &self.branch_history
    }
}

fn read_cluster_metadata(file: &RwLock<BlockFile>) -> MetadataResult<ClusterMetadata> {
    let file = file.read();
    let (superblock, version) = committed_superblock::<ClusterSuperblock>(&file)?;
    read_archive(&file.read_txn(), &superblock.metadata, version)
}

fn update_cluster_metadata(file: &RwLock<BlockFile>, metadata: &ClusterMetadata) -> MetadataResult<()> {
    update_superblock(file, |txn, superblock: &mut ClusterSuperblock| {
        write_blob(txn, &mut superblock.metadata, metadata)
    })
}

impl PersistentFile for ClusterPersistentFile {
    type Metadata = ClusterMetadata;

    fn read_metadata(&self) -> MetadataResult<ClusterMetadata> {
        read_cluster_metadata(&self.file)
    }

    fn update_metadata(&self, metadata: &ClusterMetadata) -> MetadataResult<()> {
        update_cluster_metadata(&self.file, metadata)
    }

    async fn flush_auxiliary(&self) {
        self.branch_history.flush().await;
    }
}
