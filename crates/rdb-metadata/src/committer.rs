//! Bounded, coalescing commit scheduling.
//!
//! Callers that ask for a commit while a round is already running are folded
//! into a single follow-up round:
//!
//! ```text
//! sync A ──▶ round 1 ████████
//! sync B ─────▶  waits ······ round 2 ████████
//! sync C ───────▶ waits ····· (joins round 2)
//! ```
//!
//! Each round captures whatever state exists when it starts, so one round
//! after the last request is enough to cover every request before it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::error::MetadataResult;

type CommitFn = dyn Fn() -> MetadataResult<()> + Send + Sync;

/// Runs a commit function, at most `max_active_commits` at a time.
///
/// A failed commit is fatal to the committer: the round's waiters, callers
/// already queued for the next round, and every later caller panic with the
/// failure.
///
/// Cloning yields another handle to the same committer.
#[derive(Clone)]
pub struct ThrottledCommitter {
    inner: Arc<Inner>,
}

struct Inner {
    commit: Box<CommitFn>,
    max_active: usize,
    rounds_started: AtomicU64,
    state: Mutex<State>,
}

struct State {
    active: usize,
    /// Completed by the next round to start; subscribers wait on it.
    next_round: watch::Sender<bool>,
    /// Whether a round has been asked for but not yet started.
    pending: bool,
    /// Set once a round fails; no round starts afterwards.
    failed: Option<String>,
}

impl ThrottledCommitter {
    /// # Panics
    ///
    /// Panics if `max_active_commits` is zero.
    pub fn new(
        max_active_commits: usize,
        commit: impl Fn() -> MetadataResult<()> + Send + Sync + 'static,
    ) -> Self {
        assert!(max_active_commits > 0, "max_active_commits must be positive");
        let (next_round, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                commit: Box::new(commit),
                max_active: max_active_commits,
                rounds_started: AtomicU64::new(0),
                state: Mutex::new(State {
                    active: 0,
                    next_round,
                    pending: false,
                    failed: None,
                }),
            }),
        }
    }

    /// Wait until a commit round that started after this call has finished.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if that round, or any earlier one, failed.
    pub async fn sync(&self) {
        let mut round = {
            let mut state = self.inner.state.lock();
            if let Some(failure) = &state.failed {
                panic!("metadata commit failed: {failure}");
            }
            let round = state.next_round.subscribe();
            state.pending = true;
            self.inner.maybe_start(&mut state);
            round
        };
        if round.wait_for(|done| *done).await.is_err() {
            let failure = self.inner.state.lock().failed.clone().unwrap_or_default();
            panic!("metadata commit failed: {failure}");
        }
    }

    /// Ask for a round without waiting for it.
    ///
    /// Must be called within a Tokio runtime. Does nothing once a round has
    /// failed.
    pub fn request(&self) {
        let mut state = self.inner.state.lock();
        state.pending = true;
        self.inner.maybe_start(&mut state);
    }

    /// Total rounds started so far.
    #[must_use]
    pub fn rounds_started(&self) -> u64 {
        self.inner.rounds_started.load(Ordering::Acquire)
    }

    /// Callers waiting for a round that has not started yet.
    #[must_use]
    pub fn queued_waiters(&self) -> usize {
        self.inner.state.lock().next_round.receiver_count()
    }

    /// The error that stopped this committer, if any.
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        self.inner.state.lock().failed.clone()
    }
}

impl Inner {
    fn maybe_start(self: &Arc<Self>, state: &mut State) {
        if state.failed.is_some() || !state.pending || state.active >= self.max_active {
            return;
        }
        let (fresh, _) = watch::channel(false);
        let signal = std::mem::replace(&mut state.next_round, fresh);
        state.pending = false;
        state.active += 1;
        let round = self.rounds_started.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("starting commit round {} ({} active)", round, state.active);

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run_round(round, signal).await });
    }

    async fn run_round(self: Arc<Self>, round: u64, signal: watch::Sender<bool>) {
        let inner = Arc::clone(&self);
        let outcome = match tokio::task::spawn_blocking(move || (inner.commit)()).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        // Settle the bookkeeping before anyone waiting on this round wakes up.
        let mut state = self.state.lock();
        state.active -= 1;
        match outcome {
            Ok(()) => {
                self.maybe_start(&mut state);
                drop(state);
                signal.send_replace(true);
            }
            Err(failure) => {
                error!("commit round {} failed: {}", round, failure);
                state.failed = Some(failure);
                // Dropping both senders fails this round's waiters and the queued ones.
                let (fresh, _) = watch::channel(false);
                drop(std::mem::replace(&mut state.next_round, fresh));
                drop(state);
                drop(signal);
            }
        }
    }
}

/// Run `f` on the blocking pool, resuming its panic if it panics.
pub(crate) async fn run_blocking<T: Send + 'static>(
    f: impl FnOnce() -> T + Send + 'static,
) -> T {
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => panic!("blocking task failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    use super::*;
    use crate::error::MetadataError;

    fn counting() -> (Arc<AtomicUsize>, impl Fn() -> MetadataResult<()> + Send + Sync) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move || {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_sequential_syncs_each_start_a_round() {
        let (count, commit) = counting();
        let committer = ThrottledCommitter::new(1, commit);

        committer.sync().await;
        committer.sync().await;
        committer.sync().await;

        assert_eq!(committer.rounds_started(), 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_syncs_coalesce() {
        let open = Arc::new(AtomicBool::new(false));
        let count = Arc::new(AtomicUsize::new(0));
        let committer = ThrottledCommitter::new(1, {
            let open = Arc::clone(&open);
            let count = Arc::clone(&count);
            move || {
                while !open.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let first = tokio::spawn({
            let committer = committer.clone();
            async move { committer.sync().await }
        });
        while committer.rounds_started() == 0 {
            tokio::task::yield_now().await;
        }

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let committer = committer.clone();
                tokio::spawn(async move { committer.sync().await })
            })
            .collect();
        while committer.queued_waiters() < 8 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        // Still blocked in round one, so nobody can have returned.
        assert_eq!(committer.rounds_started(), 1);
        assert!(!first.is_finished());

        open.store(true, Ordering::SeqCst);
        first.await.unwrap();
        for waiter in waiters {
            waiter.await.unwrap();
        }

        assert_eq!(committer.rounds_started(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_parallel_rounds_up_to_limit() {
        let (count, commit) = counting();
        let committer = ThrottledCommitter::new(4, commit);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let committer = committer.clone();
                tokio::spawn(async move { committer.sync().await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let rounds = committer.rounds_started();
        assert!((1..=16).contains(&rounds));
        assert_eq!(count.load(Ordering::SeqCst) as u64, rounds);
    }

    #[tokio::test]
    async fn test_request_then_sync() {
        let (count, commit) = counting();
        let committer = ThrottledCommitter::new(1, commit);

        committer.request();
        committer.sync().await;

        assert_eq!(committer.rounds_started(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    fn failing() -> impl Fn() -> MetadataResult<()> + Send + Sync {
        || Err(MetadataError::Io(std::io::Error::other("disk full")))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_round_fails_its_waiters() {
        let committer = ThrottledCommitter::new(1, failing());

        let waiter = tokio::spawn({
            let committer = committer.clone();
            async move { committer.sync().await }
        });
        let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter hung after a failed commit");
        let err = outcome.unwrap_err();
        assert!(err.is_panic());

        let failure = committer.failure().unwrap();
        assert!(failure.contains("disk full"), "{failure}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_later_syncs_fail_after_a_failed_round() {
        let committer = ThrottledCommitter::new(1, failing());
        committer.request();
        while committer.failure().is_none() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        for _ in 0..3 {
            let waiter = tokio::spawn({
                let committer = committer.clone();
                async move { committer.sync().await }
            });
            let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
                .await
                .expect("sync hung after a failed commit");
            assert!(outcome.unwrap_err().is_panic());
        }

        // No further rounds are attempted.
        committer.request();
        assert_eq!(committer.rounds_started(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_round_fails_queued_waiters() {
        let open = Arc::new(AtomicBool::new(false));
        let committer = ThrottledCommitter::new(1, {
            let open = Arc::clone(&open);
            move || {
                while !open.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(MetadataError::Io(std::io::Error::other("disk full")))
            }
        });

        committer.request();
        let queued = tokio::spawn({
            let committer = committer.clone();
            async move { committer.sync().await }
        });
        while committer.queued_waiters() < 1 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        open.store(true, Ordering::SeqCst);
        let outcome = tokio::time::timeout(Duration::from_secs(5), queued)
            .await
            .expect("queued waiter hung after a failed commit");
        assert!(outcome.unwrap_err().is_panic());
        assert_eq!(committer.rounds_started(), 1);
    }

    #[test]
    #[should_panic(expected = "must be positive")]
    fn test_zero_limit_rejected() {
        let _ = ThrottledCommitter::new(0, || Ok(()));
    }
}
