//! Codec error types.

use std::io;

use thiserror::Error;

use crate::CodecVersion;

/// Error produced while encoding or decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Underlying reader or writer failed.
    #[error("io error: {0}")]
    Io(io::Error),

    /// Input ended in the middle of a value.
    #[error("unexpected end of input")]
    Truncated,

    /// A varint had more than 64 bits of payload.
    #[error("varint overflows 64 bits")]
    VarintOverflow,

    /// A decoded length does not fit the host's `usize`.
    #[error("length {0} does not fit in usize")]
    SizeOverflow(u64),

    /// Type tag byte not known at this format version.
    #[error("unknown datum type tag {tag} at {version}")]
    UnknownTag { tag: u8, version: CodecVersion },

    /// Bool byte other than 0 or 1.
    #[error("invalid bool byte {0:#04x}")]
    InvalidBool(u8),

    /// Integer tag carrying a magnitude that a double cannot hold exactly.
    #[error("integer magnitude {0} exceeds 2^53")]
    IntegerOutOfRange(u64),

    /// Object or map contained the same key twice.
    #[error("duplicate key {0}")]
    DuplicateKey(String),

    /// String payload was not valid UTF-8.
    #[error("invalid utf-8 in string: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Array longer than the configured limit (size-checked serialization only).
    #[error("array of {len} elements exceeds limit of {limit}")]
    ArrayTooLarge { len: usize, limit: usize },

    /// Value has no representation at the requested format version.
    #[error("{what} cannot be serialized at {version}")]
    Unsupported {
        what: &'static str,
        version: CodecVersion,
    },

    /// Nesting deeper than [`crate::MAX_NESTING_DEPTH`].
    #[error("datum nested deeper than {0} levels")]
    NestingTooDeep(usize),

    /// Bytes remained after a complete value was decoded.
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
}

impl From<io::Error> for CodecError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Self::Truncated
        } else {
            Self::Io(err)
        }
    }
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
