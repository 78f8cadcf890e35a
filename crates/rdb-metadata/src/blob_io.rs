//! Archive values stored in blobs.

use rdb_datum::{Archive, CodecResult, CodecVersion, from_slice, to_vec};
use tracing::trace;

use crate::blob::BlobRef;
use crate::block::{BlockSource, WriteTxn};
use crate::error::MetadataResult;

/// Replace the blob's contents with `value` in the latest format.
pub fn write_blob<T: Archive>(
    txn: &mut WriteTxn<'_>,
    blob_ref: &mut BlobRef,
    value: &T,
) -> MetadataResult<()> {
    write_versioned(txn, blob_ref, value, CodecVersion::LATEST)
}

/// Write in an older format. Only fixtures for migration tests need this.
#[cfg(test)]
pub(crate) fn write_blob_at<T: Archive>(
    txn: &mut WriteTxn<'_>,
    blob_ref: &mut BlobRef,
    value: &T,
    version: CodecVersion,
) -> MetadataResult<()> {
    write_versioned(txn, blob_ref, value, version)
}

fn write_versioned<T: Archive>(
    txn: &mut WriteTxn<'_>,
    blob_ref: &mut BlobRef,
    value: &T,
    version: CodecVersion,
) -> MetadataResult<()> {
    let buf = to_vec(value, version)?;
    debug_assert_eq!(buf.len(), value.serialized_size(version));

    blob_ref.clear(txn)?;
    blob_ref.append_region(txn, buf.len())?;
    blob_ref.write_from_bytes(txn, &buf, 0)?;
    trace!("wrote {} byte blob at {}", buf.len(), version);
    Ok(())
}

/// Read the blob and decode it with `decode`.
///
/// # Panics
///
/// The blob holds this process's own metadata, so a decode failure means the
/// file is corrupted and panics.
pub fn read_blob<T>(
    source: &impl BlockSource,
    blob_ref: &BlobRef,
    decode: impl FnOnce(&[u8]) -> CodecResult<T>,
) -> MetadataResult<T> {
    let bytes = blob_ref.expose_all(source)?;
    match decode(&bytes) {
        Ok(value) => Ok(value),
        Err(e) => panic!("corrupted metadata: failed to decode {} byte blob: {e}", bytes.len()),
    }
}

/// [`read_blob`] for an [`Archive`] value written at `version`.
pub fn read_archive<T: Archive>(
    source: &impl BlockSource,
    blob_ref: &BlobRef,
    version: CodecVersion,
) -> MetadataResult<T> {
    read_blob(source, blob_ref, |bytes| from_slice(bytes, version))
}
