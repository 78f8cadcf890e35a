//! In-memory branch history with asynchronous persistence.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::committer::ThrottledCommitter;
use crate::error::MetadataResult;
use crate::types::{BranchBirthCertificate, BranchHistory, BranchId};

type Branches = BTreeMap<BranchId, BranchBirthCertificate>;

/// Holds every known branch and flushes additions in the background.
///
/// Mutations apply to memory immediately and never wait on disk; use
/// [`BranchHistoryManager::flush`] when durability is required.
pub struct BranchHistoryManager {
    branches: Arc<Mutex<Branches>>,
    committer: ThrottledCommitter,
}

impl BranchHistoryManager {
    /// `persist` receives a snapshot of the whole history each round.
    pub fn new(
        initial: BranchHistory,
        max_active_commits: usize,
        persist: impl Fn(&BranchHistory) -> MetadataResult<()> + Send + Sync + 'static,
    ) -> Self {
        let branches = Arc::new(Mutex::new(initial.branches));
        let source = Arc::clone(&branches);
        // Held from snapshot to write so rounds land in the order they snapshot;
        // an older snapshot written last would drop branches from disk.
        let write_order = Mutex::new(());
        let committer = ThrottledCommitter::new(max_active_commits, move || {
            let _ordered = write_order.lock();
            let snapshot = BranchHistory {
                branches: source.lock().clone(),
            };
            persist(&snapshot)
        });
        Self {
            branches,
            committer,
        }
    }

    /// # Panics
    ///
    /// Panics if the branch is unknown.
    #[must_use]
    pub fn get_branch(&self, branch: BranchId) -> BranchBirthCertificate {
        let found = self.branches.lock().get(&branch).cloned();
        match found {
            Some(certificate) => certificate,
            None => panic!("unknown branch {branch}"),
        }
    }

    #[must_use]
    pub fn is_branch_known(&self, branch: BranchId) -> bool {
        self.branches.lock().contains_key(&branch)
    }

    /// Record a new branch and schedule a flush.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if the branch already exists.
    pub fn create_branch(&self, branch: BranchId, certificate: BranchBirthCertificate) {
        {
            let mut branches = self.branches.lock();
            assert!(
                !branches.contains_key(&branch),
                "branch {branch} already exists"
            );
            branches.insert(branch, certificate);
        }
        debug!("created branch {}", branch);
        self.committer.request();
    }

    /// Add every branch not already known and schedule a flush.
    ///
    /// Must be called within a Tokio runtime.
    pub fn import_branch_history(&self, history: &BranchHistory) {
        let added = {
            let mut branches = self.branches.lock();
            let before = branches.len();
            for (id, certificate) in &history.branches {
                branches
                    .entry(*id)
                    .or_insert_with(|| certificate.clone());
            }
            branches.len() - before
        };
        debug!("imported {} of {} branches", added, history.branches.len());
        self.committer.request();
    }

    #[must_use]
    pub fn known_branches(&self) -> Vec<BranchId> {
        self.branches.lock().keys().copied().collect()
    }

    /// The given branches and all of their ancestors.
    ///
    /// # Panics
    ///
    /// Panics if any of them, or any ancestor, is unknown.
    #[must_use]
    pub fn export_branch_history(&self, branches: impl IntoIterator<Item = BranchId>) -> BranchHistory {
        let known = self.branches.lock();
        let mut out = BTreeMap::new();
        let mut stack: Vec<BranchId> = branches.into_iter().collect();
        while let Some(id) = stack.pop() {
            if out.contains_key(&id) {
                continue;
            }
            let Some(certificate) = known.get(&id) else {
                panic!("unknown branch {id}");
            };
            stack.extend(certificate.parents());
            out.insert(id, certificate.clone());
        }
        BranchHistory { branches: out }
    }

    /// Wait until everything recorded before this call is durable.
    pub async fn flush(&self) {
        self.committer.sync().await;
    }

    /// Number of flush rounds started so far.
    #[must_use]
    pub fn flush_rounds(&self) -> u64 {
        self.committer.rounds_started()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::types::tests::sample_certificate;

    fn recording() -> (Arc<Mutex<Vec<BranchHistory>>>, BranchHistoryManager) {
        let flushed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&flushed);
        let manager = BranchHistoryManager::new(BranchHistory::default(), 1, move |history| {
            sink.lock().push(history.clone());
            Ok(())
        });
        (flushed, manager)
    }

    #[tokio::test]
    async fn test_create_then_flush() {
        let (flushed, manager) = recording();
        let b1 = Uuid::from_u128(1);

        assert!(!manager.is_branch_known(b1));
        manager.create_branch(b1, sample_certificate(None));
        assert!(manager.is_branch_known(b1));
        assert_eq!(manager.get_branch(b1), sample_certificate(None));

        manager.flush().await;
        let last = flushed.lock().last().cloned().unwrap();
        assert_eq!(last.branches.len(), 1);
        assert_eq!(last.branches[&b1], sample_certificate(None));
    }

    #[tokio::test]
    #[should_panic(expected = "already exists")]
    async fn test_duplicate_create_panics() {
        let (_, manager) = recording();
        manager.create_branch(Uuid::from_u128(1), sample_certificate(None));
        manager.create_branch(Uuid::from_u128(1), sample_certificate(None));
    }

    #[test]
    #[should_panic(expected = "unknown branch")]
    fn test_get_unknown_panics() {
        let (_, manager) = recording();
        let _ = manager.get_branch(Uuid::from_u128(42));
    }

    #[tokio::test]
    async fn test_import_keeps_existing_certificates() {
        let (_, manager) = recording();
        let b1 = Uuid::from_u128(1);
        let b2 = Uuid::from_u128(2);
        manager.create_branch(b1, sample_certificate(None));

        let mut changed = sample_certificate(None);
        changed.initial_timestamp = 999;
        manager.import_branch_history(&BranchHistory {
            branches: [(b1, changed), (b2, sample_certificate(Some(b1)))].into(),
        });

        assert_eq!(manager.get_branch(b1), sample_certificate(None));
        assert_eq!(manager.get_branch(b2), sample_certificate(Some(b1)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_rounds_never_write_an_older_snapshot_last() {
        let flushed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&flushed);
        let manager = BranchHistoryManager::new(BranchHistory::default(), 4, move |history| {
            // Smaller snapshots take longer, so unordered rounds would finish backwards.
            let delay = 40u64.saturating_sub(10 * history.branches.len() as u64);
            std::thread::sleep(std::time::Duration::from_millis(delay));
            sink.lock().push(history.branches.len());
            Ok(())
        });

        for i in 0..4 {
            manager.create_branch(Uuid::from_u128(i), sample_certificate(None));
        }
        manager.flush().await;

        let flushed = flushed.lock().clone();
        assert!(flushed.is_sorted(), "{flushed:?}");
        assert_eq!(flushed.last(), Some(&4));
    }

    #[tokio::test]
    async fn test_export_includes_ancestors() {
        let (_, manager) = recording();
        let root = Uuid::from_u128(1);
        let child = Uuid::from_u128(2);
        let grandchild = Uuid::from_u128(3);
        let unrelated = Uuid::from_u128(4);
        manager.create_branch(root, sample_certificate(None));
        manager.create_branch(child, sample_certificate(Some(root)));
        manager.create_branch(grandchild, sample_certificate(Some(child)));
        manager.create_branch(unrelated, sample_certificate(None));

        let exported = manager.export_branch_history([grandchild]);
        assert_eq!(
            exported.branches.keys().copied().collect::<Vec<_>>(),
            vec![root, child, grandchild]
        );
        assert!(manager.export_branch_history([]).branches.is_empty());
    }
}
