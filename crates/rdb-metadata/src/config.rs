//! Tunables for metadata files.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Configuration shared by the auth and cluster metadata files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Call `fsync` at each commit point.
    pub fsync: bool,
    /// Branch-history flush rounds that may run at once.
    pub max_active_commits: usize,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            fsync: true,
            max_active_commits: 1,
        }
    }
}

impl MetadataConfig {
    /// Defaults overridden by `RDB_METADATA_FSYNC` and `RDB_MAX_ACTIVE_COMMITS`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(fsync) = env_var("RDB_METADATA_FSYNC") {
            config.fsync = fsync;
        }
        if let Some(max) = env_var::<usize>("RDB_MAX_ACTIVE_COMMITS") {
            config.max_active_commits = max.max(1);
        }
        config
    }
}

fn env_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring unparseable {}={:?}", name, raw);
            None
        }
    }
}
