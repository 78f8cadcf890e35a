//! Versioned binary codec for dynamically-typed document values.
//!
//! This crate provides the serialization layer underneath the metadata store:
//!
//! - [`Datum`]: an immutable JSON-like value with a distinct binary variant
//! - [`codec`]: the tagged, byte-stable datum wire format
//! - [`varint`]: base-128 integers and fixed-width primitives
//! - [`Archive`]: a serialization trait threaded with a [`CodecVersion`], so
//!   that payloads written by older releases keep decoding
//!
//! # Usage
//!
//! ```
//! use rdb_datum::{CodecVersion, Datum, codec};
//!
//! let doc = Datum::object([("a", Datum::Null), ("b", Datum::Null)]);
//!
//! let mut bytes = Vec::new();
//! codec::serialize(&mut bytes, &doc, CodecVersion::LATEST, codec::DEFAULT_ARRAY_LIMIT)?;
//! assert_eq!(bytes.len(), codec::serialized_size(&doc, CodecVersion::LATEST));
//!
//! let back = codec::deserialize(&mut bytes.as_slice(), CodecVersion::LATEST)?;
//! assert_eq!(back, doc);
//! # Ok::<(), rdb_datum::CodecError>(())
//! ```

pub mod archive;
pub mod codec;
mod datum;
mod error;
mod json;
pub mod varint;
mod version;

pub use archive::{Archive, from_slice, to_vec};
pub use codec::{ArrayCheck, DEFAULT_ARRAY_LIMIT, MAX_NESTING_DEPTH};
pub use datum::{Datum, DatumType};
pub use error::{CodecError, CodecResult};
pub use json::{BINARY_TYPE, REQL_TYPE_KEY};
pub use version::CodecVersion;
