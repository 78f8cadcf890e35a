//! Variable-length values stored through fixed-size references.
//!
//! A blob reference is a small byte array embedded in the superblock. Short
//! values live inside the reference itself; longer ones are spread over data
//! blocks, addressed through one level of index blocks.
//!
//! # Reference format
//!
//! ```text
//! inline:    [0x00][len: u16 LE][data ............ ]
//! indirect:  [0x01][len: u64 LE][count: u16 LE][index block id: u64 LE] x count
//!
//! index block: [data block id: u64 LE] x 512
//! data block:  4096 payload bytes (last one zero-padded)
//! ```
//!
//! An all-zero reference is an empty inline blob, so a freshly zeroed
//! superblock holds valid empty blobs. Every rewrite goes to newly allocated
//! blocks; see [`crate::block`] for why that makes commits atomic.

use std::collections::BTreeSet;
use std::io;

use byteorder::{ByteOrder, LittleEndian};
use tracing::trace;

use crate::block::{BLOCK_SIZE, BlockId, BlockSource, WriteTxn};
use crate::error::{MetadataError, MetadataResult};

const KIND_INLINE: u8 = 0;
const KIND_INDIRECT: u8 = 1;
const INLINE_HEADER: usize = 3;
const INDIRECT_HEADER: usize = 11;
const IDS_PER_INDEX_BLOCK: usize = BLOCK_SIZE / 8;

enum Layout {
    Inline { len: usize },
    Indirect { len: usize, index_blocks: Vec<BlockId> },
}

fn corrupt(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// A fixed-size reference to a blob.
#[derive(Clone, PartialEq, Eq)]
pub struct BlobRef {
    bytes: Vec<u8>,
}

impl std::fmt::Debug for BlobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobRef")
            .field("size", &self.bytes.len())
            .field("kind", &self.bytes[0])
            .finish_non_exhaustive()
    }
}

impl BlobRef {
    /// An empty blob with a reference of `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `size` cannot hold the indirect header.
    #[must_use]
    pub fn empty(size: usize) -> Self {
        assert!(size >= INDIRECT_HEADER, "blob reference of {size} bytes is too small");
        Self {
            bytes: vec![0; size],
        }
    }

    /// Wrap reference bytes read from a superblock.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut blob_ref = Self::empty(bytes.len());
        blob_ref.bytes.copy_from_slice(bytes);
        blob_ref
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn ref_size(&self) -> usize {
        self.bytes.len()
    }

    fn max_inline(&self) -> usize {
        (self.bytes.len() - INLINE_HEADER).min(usize::from(u16::MAX))
    }

    fn max_index_blocks(&self) -> usize {
        ((self.bytes.len() - INDIRECT_HEADER) / 8).min(usize::from(u16::MAX))
    }

    /// Largest value this reference can address.
    #[must_use]
    pub fn max_value_size(&self) -> usize {
        let indirect = self.max_index_blocks() * IDS_PER_INDEX_BLOCK * BLOCK_SIZE;
        indirect.max(self.max_inline())
    }

    fn layout(&self) -> io::Result<Layout> {
        match self.bytes[0] {
            KIND_INLINE => {
                let len = usize::from(LittleEndian::read_u16(&self.bytes[1..3]));
                if len > self.max_inline() {
                    return Err(corrupt(format!("inline blob length {len} overflows reference")));
                }
                Ok(Layout::Inline { len })
            }
            KIND_INDIRECT => {
                let len = LittleEndian::read_u64(&self.bytes[1..9]);
                let len = usize::try_from(len)
                    .map_err(|_| corrupt(format!("blob length {len} overflows usize")))?;
                let count = usize::from(LittleEndian::read_u16(&self.bytes[9..11]));
                if count > self.max_index_blocks()
                    || count != data_block_count(len).div_ceil(IDS_PER_INDEX_BLOCK)
                {
                    return Err(corrupt(format!(
                        "blob of {len} bytes cannot have {count} index blocks"
                    )));
                }
                let index_blocks = (0..count)
                    .map(|i| {
                        let at = INDIRECT_HEADER + i * 8;
                        LittleEndian::read_u64(&self.bytes[at..at + 8])
                    })
                    .collect();
                Ok(Layout::Indirect { len, index_blocks })
            }
            kind => Err(corrupt(format!("unknown blob reference kind {kind}"))),
        }
    }

    /// Length of the stored value.
    pub fn value_size(&self) -> io::Result<usize> {
        Ok(match self.layout()? {
            Layout::Inline { len } | Layout::Indirect { len, .. } => len,
        })
    }

    fn data_blocks(
        source: &impl BlockSource,
        len: usize,
        index_blocks: &[BlockId],
    ) -> io::Result<Vec<BlockId>> {
        let mut remaining = data_block_count(len);
        let mut ids = Vec::with_capacity(remaining);
        for &index in index_blocks {
            let block = source.read_block(index)?;
            let here = remaining.min(IDS_PER_INDEX_BLOCK);
            ids.extend((0..here).map(|i| LittleEndian::read_u64(&block[i * 8..i * 8 + 8])));
            remaining -= here;
        }
        Ok(ids)
    }

    /// Every block this blob occupies, index blocks included.
    pub fn block_ids(&self, source: &impl BlockSource) -> io::Result<Vec<BlockId>> {
        match self.layout()? {
            Layout::Inline { .. } => Ok(Vec::new()),
            Layout::Indirect { len, index_blocks } => {
                let mut ids = Self::data_blocks(source, len, &index_blocks)?;
                ids.extend(index_blocks);
                Ok(ids)
            }
        }
    }

    /// Add every block this blob occupies to `live`.
    pub fn collect_live_blocks(
        &self,
        source: &impl BlockSource,
        live: &mut BTreeSet<BlockId>,
    ) -> io::Result<()> {
        live.extend(self.block_ids(source)?);
        Ok(())
    }

    /// Read the whole value.
    pub fn expose_all(&self, source: &impl BlockSource) -> io::Result<Vec<u8>> {
        match self.layout()? {
            Layout::Inline { len } => Ok(self.bytes[INLINE_HEADER..INLINE_HEADER + len].to_vec()),
            Layout::Indirect { len, index_blocks } => {
                let mut value = Vec::with_capacity(len);
                for id in Self::data_blocks(source, len, &index_blocks)? {
                    value.extend_from_slice(&source.read_block(id)?);
                }
                value.truncate(len);
                Ok(value)
            }
        }
    }

    /// Remove the value, releasing its blocks.
    pub fn clear(&mut self, txn: &mut WriteTxn<'_>) -> MetadataResult<()> {
        self.store(txn, &[])
    }

    /// Grow the value by `n` zero bytes.
    pub fn append_region(&mut self, txn: &mut WriteTxn<'_>, n: usize) -> MetadataResult<()> {
        let mut value = self.expose_all(&*txn)?;
        value.resize(value.len() + n, 0);
        self.store(txn, &value)
    }

    /// Overwrite `bytes.len()` bytes of the value starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range extends past the end of the value; grow it with
    /// [`BlobRef::append_region`] first.
    pub fn write_from_bytes(
        &mut self,
        txn: &mut WriteTxn<'_>,
        bytes: &[u8],
        offset: usize,
    ) -> MetadataResult<()> {
        let mut value = self.expose_all(&*txn)?;
        let end = offset + bytes.len();
        assert!(
            end <= value.len(),
            "write of {}..{} past blob end {}",
            offset,
            end,
            value.len()
        );
        value[offset..end].copy_from_slice(bytes);
        self.store(txn, &value)
    }

    /// Replace the value wholesale.
    fn store(&mut self, txn: &mut WriteTxn<'_>, value: &[u8]) -> MetadataResult<()> {
        let max = self.max_value_size();
        if value.len() > max {
            return Err(MetadataError::BlobTooLarge {
                len: value.len(),
                max,
            });
        }

        for id in self.block_ids(&*txn)? {
            txn.free_block(id);
        }
        self.bytes.fill(0);

        if value.len() <= self.max_inline() {
            self.bytes[0] = KIND_INLINE;
            LittleEndian::write_u16(&mut self.bytes[1..3], value.len() as u16);
            self.bytes[INLINE_HEADER..INLINE_HEADER + value.len()].copy_from_slice(value);
            return Ok(());
        }

        let data_ids: Vec<BlockId> = value
            .chunks(BLOCK_SIZE)
            .map(|chunk| {
                let id = txn.allocate();
                let mut block = vec![0u8; BLOCK_SIZE].into_boxed_slice();
                block[..chunk.len()].copy_from_slice(chunk);
                txn.write_block(id, block);
                id
            })
            .collect();

        let index_ids: Vec<BlockId> = data_ids
            .chunks(IDS_PER_INDEX_BLOCK)
            .map(|ids| {
                let id = txn.allocate();
                let mut block = vec![0u8; BLOCK_SIZE].into_boxed_slice();
                for (i, data_id) in ids.iter().enumerate() {
                    LittleEndian::write_u64(&mut block[i * 8..i * 8 + 8], *data_id);
                }
                txn.write_block(id, block);
                id
            })
            .collect();

        self.bytes[0] = KIND_INDIRECT;
        LittleEndian::write_u64(&mut self.bytes[1..9], value.len() as u64);
        LittleEndian::write_u16(&mut self.bytes[9..11], index_ids.len() as u16);
        for (i, id) in index_ids.iter().enumerate() {
            let at = INDIRECT_HEADER + i * 8;
            LittleEndian::write_u64(&mut self.bytes[at..at + 8], *id);
        }
        trace!(
            "stored {} byte blob in {} data and {} index blocks",
            value.len(),
            data_ids.len(),
            index_ids.len()
        );
        Ok(())
    }
}

fn data_block_count(len: usize) -> usize {
    len.div_ceil(BLOCK_SIZE)
}
