//! Versioned on-disk storage for cluster metadata.
//!
//! A metadata file is a sequence of 4096-byte blocks. Block 0 is a
//! superblock holding a format magic and fixed-size blob references; the
//! blobs hold [`rdb_datum::Archive`]-encoded payloads.
//!
//! ```text
//! PersistentFile (auth / cluster)
//!   └─ superblock: magic + blob refs       superblock.rs
//!        └─ blob: inline or indirect       blob.rs
//!             └─ block file + txns         block.rs
//! ```
//!
//! Files written by older releases are migrated in place the first time they
//! are opened. Branch history lives alongside the cluster metadata and is
//! flushed asynchronously through a [`ThrottledCommitter`].

pub mod blob;
pub mod blob_io;
pub mod block;
mod branch_history;
mod committer;
mod config;
mod error;
pub mod migration;
mod persistent_file;
mod persister;
pub mod superblock;
pub mod types;

pub use branch_history::BranchHistoryManager;
pub use committer::ThrottledCommitter;
pub use config::MetadataConfig;
pub use error::{MetadataError, MetadataResult};
pub use persistent_file::{AuthPersistentFile, ClusterPersistentFile, PersistentFile};
pub use persister::SemilatticeWatchingPersister;
pub use types::{
    AuthMetadata, BranchBirthCertificate, BranchHistory, BranchId, ClusterMetadata, KeyRange,
    ServerId, Version,
};
