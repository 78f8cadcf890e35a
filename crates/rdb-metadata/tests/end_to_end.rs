//! Full lifecycle of a cluster metadata file.

use std::collections::BTreeMap;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use rdb_datum::Datum;
use rdb_metadata::types::{Deletable, TableMetadata, Version};
use rdb_metadata::{
    BranchBirthCertificate, ClusterMetadata, ClusterPersistentFile, KeyRange, MetadataConfig,
    MetadataError, PersistentFile, SemilatticeWatchingPersister,
};
use tempfile::TempDir;
use tokio::sync::watch;
use uuid::Uuid;

fn config() -> MetadataConfig {
    MetadataConfig {
        fsync: false,
        ..MetadataConfig::default()
    }
}

fn certificate() -> BranchBirthCertificate {
    BranchBirthCertificate {
        region: KeyRange::universe(),
        initial_timestamp: 17,
        origin: vec![(KeyRange::universe(), Version::zero())],
    }
}

#[tokio::test]
async fn test_branch_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("metadata");
    let server = Uuid::new_v4();
    let branch = Uuid::new_v4();

    let file = Arc::new(
        ClusterPersistentFile::create(&path, server, &ClusterMetadata::default(), &config())
            .unwrap(),
    );
    let (publish, view) = watch::channel(ClusterMetadata::default());
    let persister = SemilatticeWatchingPersister::new(Arc::clone(&file), view);

    file.branch_history_manager()
        .create_branch(branch, certificate());

    let table = TableMetadata {
        database: Uuid::new_v4(),
        name: "events".into(),
        primary_key: "id".into(),
        config: Datum::object([("shards", Datum::from(1))]),
    };
    let mut cluster = ClusterMetadata::default();
    cluster
        .tables
        .insert(Uuid::new_v4(), Deletable::Live(table));
    publish.send_replace(cluster.clone());

    persister.stop_and_flush().await.unwrap();
    drop(file);

    let file = ClusterPersistentFile::open_existing(&path, &config()).unwrap();
    assert_eq!(file.read_server_id(), server);
    assert_eq!(file.branch_history_manager().get_branch(branch), certificate());
    assert_eq!(file.read_metadata().unwrap(), cluster);
}

#[tokio::test]
async fn test_locked_file_is_reported_in_use() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("metadata");
    let _open =
        ClusterPersistentFile::create(&path, Uuid::new_v4(), &ClusterMetadata::default(), &config())
            .unwrap();

    let err = ClusterPersistentFile::open_existing(&path, &config())
        .err()
        .unwrap();
    assert!(matches!(err, MetadataError::FileInUse { .. }), "{err}");
}

#[tokio::test]
async fn test_exported_history_imports_elsewhere() {
    let dir = TempDir::new().unwrap();
    let source = ClusterPersistentFile::create(
        dir.path().join("a"),
        Uuid::new_v4(),
        &ClusterMetadata::default(),
        &config(),
    )
    .unwrap();
    let target = ClusterPersistentFile::create(
        dir.path().join("b"),
        Uuid::new_v4(),
        &ClusterMetadata::default(),
        &config(),
    )
    .unwrap();

    let parent = Uuid::new_v4();
    let child = Uuid::new_v4();
    let mut child_cert = certificate();
    child_cert.origin = vec![(KeyRange::universe(), Version::new(parent, 17))];
    let source_history = source.branch_history_manager();
    source_history.create_branch(parent, certificate());
    source_history.create_branch(child, child_cert.clone());

    let exported = source_history.export_branch_history([child]);
    target.branch_history_manager().import_branch_history(&exported);
    target.branch_history_manager().flush().await;

    assert_eq!(
        exported.branches,
        BTreeMap::from([(parent, certificate()), (child, child_cert)])
    );
    assert!(target.branch_history_manager().is_branch_known(parent));
}
