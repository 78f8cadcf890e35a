//! Keep a metadata file in step with a live configuration view.

use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::committer::run_blocking;
use crate::error::MetadataResult;
use crate::persistent_file::PersistentFile;

/// Writes every value published on `view` to `file`.
///
/// Values published while a write is in progress are folded together; only
/// the newest one is written next. The view is owned elsewhere; this type
/// only subscribes to it.
pub struct SemilatticeWatchingPersister<F: PersistentFile> {
    file: Arc<F>,
    view: watch::Receiver<F::Metadata>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<MetadataResult<()>>,
}

impl<F: PersistentFile> SemilatticeWatchingPersister<F> {
    /// Start persisting. Must be called within a Tokio runtime.
    pub fn new(file: Arc<F>, view: watch::Receiver<F::Metadata>) -> Self {
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(persist_loop(Arc::clone(&file), view.clone(), stopped));
        Self {
            file,
            view,
            stop,
            task,
        }
    }

    /// Stop watching, write the latest value, and wait for auxiliary flushes.
    ///
    /// # Errors
    ///
    /// Returns the first write error, from the loop or from the final flush.
    ///
    /// # Panics
    ///
    /// Panics if the watching task panicked or was cancelled, or if an
    /// auxiliary flush fails.
    pub async fn stop_and_flush(self) -> MetadataResult<()> {
        // The loop may already have exited if the view's owner went away.
        let _ = self.stop.send(());
        match self.task.await {
            Ok(result) => result?,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => panic!("persister task failed: {e}"),
        }

        let latest = self.view.borrow().clone();
        persist(&self.file, latest).await?;
        self.file.flush_auxiliary().await;
        debug!("persister stopped");
        Ok(())
    }
}

async fn persist<F: PersistentFile>(file: &Arc<F>, value: F::Metadata) -> MetadataResult<()> {
    let file = Arc::clone(file);
    run_blocking(move || file.update_metadata(&value)).await
}

async fn persist_loop<F: PersistentFile>(
    file: Arc<F>,
    mut view: watch::Receiver<F::Metadata>,
    mut stopped: oneshot::Receiver<()>,
) -> MetadataResult<()> {
    loop {
        let value = view.borrow_and_update().clone();
        if let Err(e) = persist(&file, value).await {
            error!("failed to persist metadata: {}", e);
            return Err(e);
        }

        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    debug!("metadata view closed");
                    return Ok(());
                }
            }
            _ = &mut stopped => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::migration::tests::test_config;
    use crate::persistent_file::AuthPersistentFile;
    use crate::types::{AuthMetadata, Versioned};

    fn key(value: &str, timestamp: u64) -> AuthMetadata {
        AuthMetadata {
            auth_key: Versioned::new(value.into(), timestamp),
        }
    }

    #[tokio::test]
    async fn test_changes_reach_disk() {
        let dir = TempDir::new().unwrap();
        let file = Arc::new(
            AuthPersistentFile::create(dir.path().join("auth"), &key("a", 1), &test_config())
                .unwrap(),
        );
        let (publish, view) = watch::channel(key("a", 1));
        let persister = SemilatticeWatchingPersister::new(Arc::clone(&file), view);

        publish.send_replace(key("b", 2));
        let mut attempts = 0;
        while file.read_metadata().unwrap() != key("b", 2) {
            attempts += 1;
            assert!(attempts < 1000, "change never persisted");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        publish.send_replace(key("c", 3));
        persister.stop_and_flush().await.unwrap();
        assert_eq!(file.read_metadata().unwrap(), key("c", 3));
    }

    #[tokio::test]
    async fn test_stop_after_view_closed() {
        let dir = TempDir::new().unwrap();
        let file = Arc::new(
            AuthPersistentFile::create(dir.path().join("auth"), &key("a", 1), &test_config())
                .unwrap(),
        );
        let (publish, view) = watch::channel(key("z", 9));
        let persister = SemilatticeWatchingPersister::new(Arc::clone(&file), view);
        drop(publish);

        persister.stop_and_flush().await.unwrap();
        assert_eq!(file.read_metadata().unwrap(), key("z", 9));
    }
}
