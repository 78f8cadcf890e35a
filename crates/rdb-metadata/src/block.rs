//! Fixed-size block file with write transactions.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬─────
//! │ block 0      │ block 1      │ block 2      │ ...
//! │ superblock   │ blob data    │ blob data    │
//! └──────────────┴──────────────┴──────────────┴─────
//!   4096 bytes each
//! ```
//!
//! # Commit ordering
//!
//! Transactions never overwrite a block the current superblock can reach:
//! blob rewrites go to freshly allocated blocks, and blocks released by the
//! transaction only return to the free list after commit. `commit` writes the
//! data blocks first and the superblock last, so the superblock write is the
//! single point at which the new state becomes visible.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, trace};

use crate::config::MetadataConfig;
use crate::error::{MetadataError, MetadataResult};

/// Size of every block, including the superblock.
pub const BLOCK_SIZE: usize = 4096;

/// Index of a block within the file.
pub type BlockId = u64;

/// Well-known location of the superblock.
pub const SUPERBLOCK_ID: BlockId = 0;

/// Anything blocks can be read through: a read or a write transaction.
pub trait BlockSource {
    fn read_block(&self, id: BlockId) -> io::Result<Cow<'_, [u8]>>;
}

/// An open, exclusively locked block file.
pub struct BlockFile {
    file: Flock<File>,
    path: PathBuf,
    /// Number of block slots, including slots handed out but not yet written.
    block_count: u64,
    /// Slots that no committed state references.
    free: BTreeSet<BlockId>,
    fsync: bool,
}

/// Take a non-blocking exclusive lock on the file.
///
/// Fails with [`MetadataError::FileInUse`] when another open file description
/// (another process, or another open of the same path) already holds it.
fn coop_lock_and_check(file: File, path: &Path) -> MetadataResult<Flock<File>> {
    Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
        if errno == Errno::EWOULDBLOCK {
            MetadataError::FileInUse {
                path: path.to_path_buf(),
            }
        } else {
            MetadataError::Io(errno.into())
        }
    })
}

impl BlockFile {
    /// Create (or truncate) a file holding a single zeroed superblock.
    pub fn create(path: impl AsRef<Path>, config: &MetadataConfig) -> MetadataResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        // Lock before truncating so a file in use is never clobbered.
        let file = coop_lock_and_check(file, path)?;
        file.set_len(0)?;
        file.set_len(BLOCK_SIZE as u64)?;
        if config.fsync {
            file.sync_all()?;
        }
        debug!("created block file {}", path.display());

        Ok(Self {
            file,
            path: path.to_path_buf(),
            block_count: 1,
            free: BTreeSet::new(),
            fsync: config.fsync,
        })
    }

    /// Open an existing file.
    ///
    /// Every block except the superblock starts out as in use; call
    /// [`BlockFile::set_live_blocks`] once the superblock has been examined.
    pub fn open_existing(path: impl AsRef<Path>, config: &MetadataConfig) -> MetadataResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file = coop_lock_and_check(file, path)?;

        let len = file.metadata()?.len();
        if len == 0 || len % BLOCK_SIZE as u64 != 0 {
            return Err(MetadataError::InvalidLength {
                path: path.to_path_buf(),
                len,
            });
        }
        debug!(
            "opened block file {} ({} blocks)",
            path.display(),
            len / BLOCK_SIZE as u64
        );

        Ok(Self {
            file,
            path: path.to_path_buf(),
            block_count: len / BLOCK_SIZE as u64,
            free: BTreeSet::new(),
            fsync: config.fsync,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Rebuild the free list: every non-superblock slot not in `live` is free.
    pub fn set_live_blocks(&mut self, live: &BTreeSet<BlockId>) {
        self.free = (SUPERBLOCK_ID + 1..self.block_count)
            .filter(|id| !live.contains(id))
            .collect();
        trace!("{} of {} blocks free", self.free.len(), self.block_count);
    }

    fn read_raw(&self, id: BlockId) -> io::Result<Vec<u8>> {
        if id >= self.block_count {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("block {id} is past the end of the file"),
            ));
        }
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.file.read_exact_at(&mut buf, id * BLOCK_SIZE as u64)?;
        Ok(buf)
    }

    #[must_use]
    pub fn read_txn(&self) -> ReadTxn<'_> {
        ReadTxn { file: self }
    }

    pub fn write_txn(&mut self) -> WriteTxn<'_> {
        WriteTxn {
            file: self,
            dirty: BTreeMap::new(),
            allocated: BTreeSet::new(),
            released: Vec::new(),
            superblock: None,
            committed: false,
        }
    }
}

/// Read-only view of committed blocks.
pub struct ReadTxn<'a> {
    file: &'a BlockFile,
}

impl BlockSource for ReadTxn<'_> {
    fn read_block(&self, id: BlockId) -> io::Result<Cow<'_, [u8]>> {
        self.file.read_raw(id).map(Cow::Owned)
    }
}

/// A set of block writes that becomes visible atomically at commit.
///
/// Dropping the transaction without committing discards it.
pub struct WriteTxn<'a> {
    file: &'a mut BlockFile,
    dirty: BTreeMap<BlockId, Box<[u8]>>,
    /// Slots handed out by this transaction.
    allocated: BTreeSet<BlockId>,
    /// Slots referenced by the committed state that this transaction dropped.
    released: Vec<BlockId>,
    superblock: Option<Box<[u8]>>,
    committed: bool,
}

impl WriteTxn<'_> {
    /// Current superblock contents, including uncommitted changes.
    pub fn superblock(&self) -> io::Result<Cow<'_, [u8]>> {
        self.read_block(SUPERBLOCK_ID)
    }

    /// Replace the superblock contents.
    ///
    /// # Panics
    ///
    /// Panics if `block` is not exactly [`BLOCK_SIZE`] bytes.
    pub fn write_superblock(&mut self, block: &[u8]) {
        assert_eq!(block.len(), BLOCK_SIZE, "superblock must be one block");
        self.superblock = Some(block.into());
    }

    /// Hand out a slot that no committed state references.
    pub fn allocate(&mut self) -> BlockId {
        let id = self.file.free.pop_first().unwrap_or_else(|| {
            let id = self.file.block_count;
            self.file.block_count += 1;
            id
        });
        self.allocated.insert(id);
        id
    }

    /// Stage the contents of a data block.
    ///
    /// # Panics
    ///
    /// Panics when writing the superblock slot or a block of the wrong size.
    pub fn write_block(&mut self, id: BlockId, data: Box<[u8]>) {
        assert_ne!(id, SUPERBLOCK_ID, "use write_superblock for block 0");
        assert_eq!(data.len(), BLOCK_SIZE, "data block must be one block");
        self.dirty.insert(id, data);
    }

    /// Release a block.
    ///
    /// Blocks allocated by this transaction are reusable immediately; blocks
    /// the committed state references only become reusable after commit.
    pub fn free_block(&mut self, id: BlockId) {
        self.dirty.remove(&id);
        if self.allocated.remove(&id) {
            self.file.free.insert(id);
        } else {
            self.released.push(id);
        }
    }

    /// Write data blocks, then the superblock.
    pub fn commit(mut self) -> io::Result<()> {
        for (id, data) in &self.dirty {
            self.file
                .file
                .write_all_at(data, id * BLOCK_SIZE as u64)?;
        }
        if self.file.fsync && !self.dirty.is_empty() {
            self.file.file.sync_data()?;
        }
        if let Some(superblock) = &self.superblock {
            self.file.file.write_all_at(superblock, 0)?;
            if self.file.fsync {
                self.file.file.sync_data()?;
            }
        }
        trace!(
            "committed {} data blocks, released {}",
            self.dirty.len(),
            self.released.len()
        );
        let released = std::mem::take(&mut self.released);
        self.file.free.extend(released);
        self.committed = true;
        Ok(())
    }
}

impl BlockSource for WriteTxn<'_> {
    fn read_block(&self, id: BlockId) -> io::Result<Cow<'_, [u8]>> {
        if id == SUPERBLOCK_ID {
            if let Some(superblock) = &self.superblock {
                return Ok(Cow::Borrowed(superblock));
            }
        }
        match self.dirty.get(&id) {
            Some(data) => Ok(Cow::Borrowed(data)),
            None => self.file.read_raw(id).map(Cow::Owned),
        }
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let allocated = std::mem::take(&mut self.allocated);
            self.file.free.extend(allocated);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MetadataConfig {
        MetadataConfig {
            fsync: false,
            ..MetadataConfig::default()
        }
    }

    fn filled(byte: u8) -> Box<[u8]> {
        vec![byte; BLOCK_SIZE].into_boxed_slice()
    }

    #[test]
    fn test_create_has_zeroed_superblock() {
        let dir = tempfile::tempdir().unwrap();
        let file = BlockFile::create(dir.path().join("meta"), &config()).unwrap();
        assert_eq!(file.block_count(), 1);
        let superblock = file.read_txn().read_block(SUPERBLOCK_ID).unwrap().into_owned();
        assert!(superblock.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_commit_makes_writes_visible() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = BlockFile::create(dir.path().join("meta"), &config()).unwrap();

        let mut txn = file.write_txn();
        let id = txn.allocate();
        txn.write_block(id, filled(7));
        assert_eq!(txn.read_block(id).unwrap()[0], 7);
        let mut superblock = vec![0u8; BLOCK_SIZE];
        superblock[0] = 1;
        txn.write_superblock(&superblock);
        txn.commit().unwrap();

        let read = file.read_txn();
        assert_eq!(read.read_block(id).unwrap()[BLOCK_SIZE - 1], 7);
        assert_eq!(read.read_block(SUPERBLOCK_ID).unwrap()[0], 1);
    }

    #[test]
    fn test_dropped_txn_discards_and_recycles() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = BlockFile::create(dir.path().join("meta"), &config()).unwrap();

        let id = {
            let mut txn = file.write_txn();
            let id = txn.allocate();
            txn.write_block(id, filled(9));
            txn.write_superblock(&[5u8; BLOCK_SIZE]);
            id
        };
        assert_eq!(file.free_count(), 1);
        assert_eq!(file.read_txn().read_block(SUPERBLOCK_ID).unwrap()[0], 0);

        let mut txn = file.write_txn();
        assert_eq!(txn.allocate(), id);
    }

    #[test]
    fn test_released_blocks_reusable_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = BlockFile::create(dir.path().join("meta"), &config()).unwrap();

        let mut txn = file.write_txn();
        let old = txn.allocate();
        txn.write_block(old, filled(1));
        txn.commit().unwrap();

        let mut txn = file.write_txn();
        txn.free_block(old);
        // Still referenced by the committed state, so not handed out again.
        let fresh = txn.allocate();
        assert_ne!(fresh, old);
        txn.write_block(fresh, filled(2));
        txn.commit().unwrap();

        let mut txn = file.write_txn();
        assert_eq!(txn.allocate(), old);
    }

    #[test]
    fn test_free_within_txn_is_immediate() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = BlockFile::create(dir.path().join("meta"), &config()).unwrap();

        let mut txn = file.write_txn();
        let a = txn.allocate();
        txn.free_block(a);
        assert_eq!(txn.allocate(), a);
    }

    #[test]
    fn test_live_blocks_rebuild_free_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta");
        {
            let mut file = BlockFile::create(&path, &config()).unwrap();
            let mut txn = file.write_txn();
            for byte in 1..=4 {
                let id = txn.allocate();
                txn.write_block(id, filled(byte));
            }
            txn.commit().unwrap();
        }

        let mut file = BlockFile::open_existing(&path, &config()).unwrap();
        assert_eq!(file.block_count(), 5);
        file.set_live_blocks(&BTreeSet::from([2, 4]));
        assert_eq!(file.free_count(), 2);
        let mut txn = file.write_txn();
        assert_eq!(txn.allocate(), 1);
        assert_eq!(txn.allocate(), 3);
        assert_eq!(txn.allocate(), 5);
    }

    #[test]
    fn test_second_open_reports_file_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta");
        let _held = BlockFile::create(&path, &config()).unwrap();

        assert!(matches!(
            BlockFile::open_existing(&path, &config()),
            Err(MetadataError::FileInUse { .. })
        ));
        assert!(matches!(
            BlockFile::create(&path, &config()),
            Err(MetadataError::FileInUse { .. })
        ));
    }

    #[test]
    fn test_invalid_length_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta");
        std::fs::write(&path, [0u8; 100]).unwrap();
        assert!(matches!(
            BlockFile::open_existing(&path, &config()),
            Err(MetadataError::InvalidLength { len: 100, .. })
        ));
    }

    #[test]
    fn test_read_past_end_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = BlockFile::create(dir.path().join("meta"), &config()).unwrap();
        assert!(file.read_txn().read_block(3).is_err());
    }
}
