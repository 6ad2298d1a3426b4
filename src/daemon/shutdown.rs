//! Graceful shutdown: stop callbacks, pending-job drain, listener cancellation.

use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::executor::JobTracker;

pub type StopCallback = Box<dyn FnOnce() + Send>;

pub struct ShutdownCoordinator {
    callbacks: Mutex<Vec<StopCallback>>,
    jobs: JobTracker,
    listener: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
            jobs: JobTracker::new(),
            listener: CancellationToken::new(),
        }
    }

    /// Register a callback to run once when shutdown begins
    pub fn on_stop(&self, callback: impl FnOnce() + Send + 'static) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(callback));
    }

    pub fn jobs(&self) -> &JobTracker {
        &self.jobs
    }

    /// Token cancelled after all jobs have drained
    pub fn listener_token(&self) -> CancellationToken {
        self.listener.clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.jobs.is_tracking()
    }

    pub fn is_stopped(&self) -> bool {
        self.listener.is_cancelled()
    }

    /// Run the shutdown sequence.
    ///
    /// Jobs started from here on are tracked; stop callbacks run once, then
    /// every tracked job is awaited before the listener is cancelled.
    pub async fn stop(&self) {
        info!("Shutting down");
        self.jobs.start_tracking();

        let callbacks = std::mem::take(
            &mut *self.callbacks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        debug!(count = callbacks.len(), "Running stop callbacks");
        for callback in callbacks {
            callback();
        }

        self.jobs.drain().await;
        self.listener.cancel();
        info!("Shutdown complete");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Termination signals (SIGTERM/SIGINT, or Ctrl+C off unix)
pub struct ShutdownSignal {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignal {
    /// Install the signal handlers. Signals arriving after this call are not
    /// lost even if nobody is waiting yet.
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    /// Wait for the next termination signal and return its name
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigint.recv() => "SIGINT",
        }
    }
}

#[cfg(not(unix))]
impl ShutdownSignal {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {})
    }

    pub async fn recv(&mut self) -> &'static str {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        "Ctrl+C"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_runs_callbacks_once() {
        let coordinator = ShutdownCoordinator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            coordinator.on_stop(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        coordinator.stop().await;
        coordinator.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(coordinator.is_stopped());
    }

    #[tokio::test]
    async fn test_stop_waits_for_jobs_started_during_shutdown() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let done = Arc::new(AtomicUsize::new(0));

        let inner = Arc::clone(&coordinator);
        let job_done = Arc::clone(&done);
        coordinator.on_stop(move || {
            for _ in 0..4 {
                let job_done = Arc::clone(&job_done);
                let _job = inner.jobs().spawn_blocking(move || {
                    std::thread::sleep(Duration::from_millis(30));
                    job_done.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        coordinator.stop().await;

        assert_eq!(done.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_listener_cancelled_after_drain() {
        let coordinator = ShutdownCoordinator::new();
        let token = coordinator.listener_token();
        assert!(!token.is_cancelled());
        assert!(!coordinator.is_stopping());

        coordinator.stop().await;

        assert!(coordinator.is_stopping());
        assert!(token.is_cancelled());
    }
}
