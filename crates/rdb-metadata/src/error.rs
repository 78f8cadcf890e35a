//! Metadata store error types.

use std::path::PathBuf;

use thiserror::Error;

/// Metadata store error type.
///
/// Only conditions a caller can act on are represented here. Corrupted
/// on-disk metadata and unsupported format versions are not recoverable and
/// panic instead.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// Another process holds the lock on the metadata file.
    #[error("metadata file {} is in use by another process", path.display())]
    FileInUse { path: PathBuf },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Codec error while encoding a value for disk.
    #[error("codec error: {0}")]
    Codec(#[from] rdb_datum::CodecError),

    /// Serialized value does not fit the blob reference it is stored through.
    #[error("blob of {len} bytes exceeds the {max} bytes its reference can address")]
    BlobTooLarge { len: usize, max: usize },

    /// File length is not a whole number of blocks.
    #[error("metadata file {} has invalid length {len}", path.display())]
    InvalidLength { path: PathBuf, len: u64 },
}

/// Result type for metadata operations.
pub type MetadataResult<T> = Result<T, MetadataError>;
