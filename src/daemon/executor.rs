use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::worker::WorkerError;

#[derive(Error, Debug)]
pub enum JobError {
    /// The job panicked or its task was cancelled before producing a result
    #[error("job aborted before producing a result")]
    Aborted,

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl JobError {
    /// True when the job failed because a worker process could not be reached
    pub fn is_worker_unavailable(&self) -> bool {
        matches!(self, JobError::Worker(e) if e.is_unavailable())
    }
}

/// Result of an offloaded unit of work, resolved when the work finishes
pub struct Job<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for Job<T> {
    type Output = Result<T, JobError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map_err(|_| JobError::Aborted)
    }
}

/// Spawns offloaded work and, once shutdown has begun, remembers it so the
/// shutdown path can wait for it.
///
/// Jobs that finish before tracking is switched on are never recorded.
pub struct JobTracker {
    tracking: AtomicBool,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self {
            tracking: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn start_tracking(&self) {
        self.tracking.store(true, Ordering::SeqCst);
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::SeqCst)
    }

    /// Number of recorded handles, finished or not
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Run a blocking closure on the shared blocking thread pool
    pub fn spawn_blocking<F, T>(&self, func: F) -> Job<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let handle = tokio::task::spawn_blocking(move || {
            let _ = tx.send(func());
        });
        self.track(handle);
        Job { rx }
    }

    /// Run a future as its own task on the runtime
    pub fn spawn<Fut>(&self, future: Fut) -> Job<Fut::Output>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let _ = tx.send(future.await);
        });
        self.track(handle);
        Job { rx }
    }

    fn track(&self, handle: JoinHandle<()>) {
        if self.is_tracking() {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle);
        }
    }

    /// Wait until every recorded job, including ones recorded while waiting,
    /// has finished.
    pub async fn drain(&self) {
        tokio::task::yield_now().await;
        loop {
            let recorded = {
                let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *pending)
            };
            if recorded.is_empty() {
                break;
            }

            let unfinished: Vec<JoinHandle<()>> = recorded
                .into_iter()
                .filter(|handle| !handle.is_finished())
                .collect();
            if unfinished.is_empty() {
                tokio::task::yield_now().await;
                continue;
            }

            debug!(count = unfinished.len(), "Waiting for pending jobs");
            for result in join_all(unfinished).await {
                if let Err(e) = result {
                    warn!("Pending job ended abnormally: {}", e);
                }
            }
        }
    }
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_blocking_job_returns_result() {
        let tracker = JobTracker::new();
        let value = tracker.spawn_blocking(|| 6 * 7).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_job_error_propagates() {
        let tracker = JobTracker::new();
        let result: Result<u32, String> = tracker
            .spawn_blocking(|| Err("boom".to_string()))
            .await
            .unwrap();
        assert_eq!(result, Err("boom".to_string()));
    }

    #[tokio::test]
    async fn test_panicking_job_is_aborted() {
        let tracker = JobTracker::new();
        let job = tracker.spawn_blocking(|| -> u32 { panic!("job failure") });
        assert!(matches!(job.await, Err(JobError::Aborted)));
    }

    #[tokio::test]
    async fn test_jobs_untracked_before_shutdown() {
        let tracker = JobTracker::new();
        tracker.spawn(async { 1 }).await.unwrap();
        tracker.spawn_blocking(|| 2).await.unwrap();
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_waits_for_tracked_jobs() {
        let tracker = JobTracker::new();
        tracker.start_tracking();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let done = Arc::clone(&done);
            let _job = tracker.spawn_blocking(move || {
                std::thread::sleep(Duration::from_millis(50));
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(tracker.pending_count(), 3);

        tracker.drain().await;

        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_with_no_jobs_returns() {
        let tracker = JobTracker::new();
        tracker.start_tracking();
        tokio::time::timeout(Duration::from_secs(1), tracker.drain())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_drain_picks_up_jobs_added_while_waiting() {
        let tracker = Arc::new(JobTracker::new());
        tracker.start_tracking();
        let done = Arc::new(AtomicUsize::new(0));

        let inner_tracker = Arc::clone(&tracker);
        let inner_done = Arc::clone(&done);
        let _outer = tracker.spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _inner = inner_tracker.spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                inner_done.fetch_add(1, Ordering::SeqCst);
            });
        });

        tracker.drain().await;

        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
