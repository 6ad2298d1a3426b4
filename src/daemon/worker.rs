//! Parent side of a worker subprocess.
//!
//! A [`ProcessWorker`] owns a child process speaking JSON lines: one request
//! value per line on the child's stdin, one reply value per line on its
//! stdout. The child's stderr is inherited so its logs land next to ours.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::store::StoreError;

/// How often a pending receive checks that the child is still alive
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Errors raised while waiting for a reply from a worker
#[derive(Error, Debug)]
pub enum ReceiveError {
    #[error("worker '{worker}' is no longer alive")]
    Exited { worker: String },

    #[error("worker '{worker}' closed its output")]
    Closed { worker: String },

    #[error("failed to read from worker: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker replied with invalid JSON: {0}")]
    Decode(#[source] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to send to worker: {0}")]
    Send(#[source] std::io::Error),

    #[error("worker input is closed")]
    Closed,

    #[error(transparent)]
    Receive(#[from] ReceiveError),

    #[error("failed to encode worker payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WorkerError {
    /// True when the worker process could not be talked to
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            WorkerError::Send(_) | WorkerError::Closed | WorkerError::Receive(_)
        )
    }
}

/// How to launch a worker process
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub poll_interval: Duration,
}

impl WorkerCommand {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Command running `<program> worker <factory>`
    pub fn for_factory(program: impl Into<PathBuf>, factory: &str) -> Self {
        Self::new(factory, program).args(["worker", factory])
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Running,
    Exited(ExitStatus),
    /// Waiting on the child failed; treat it as gone
    Lost,
}

impl ChildStatus {
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self {
            ChildStatus::Exited(status) => Some(*status),
            _ => None,
        }
    }
}

pub struct ProcessWorker {
    name: String,
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Lines<BufReader<ChildStdout>>>,
    exchange_lock: Mutex<()>,
    cancel: CancellationToken,
    status: watch::Receiver<ChildStatus>,
    poll_interval: Duration,
}

impl ProcessWorker {
    /// Spawn the child process. Must be called from within a tokio runtime.
    pub fn spawn(command: &WorkerCommand) -> Result<Self, WorkerError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                program: command.program.display().to_string(),
                source,
            })?;

        let pid = child.id();
        let stdin = child.stdin.take().ok_or(WorkerError::Closed)?;
        let stdout = child.stdout.take().ok_or_else(|| ReceiveError::Closed {
            worker: command.name.clone(),
        })?;

        info!(worker = %command.name, ?pid, "Started worker process");

        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(ChildStatus::Running);
        tokio::spawn(reap(command.name.clone(), child, cancel.clone(), status_tx));

        Ok(Self {
            name: command.name.clone(),
            pid,
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(BufReader::new(stdout).lines()),
            exchange_lock: Mutex::new(()),
            cancel,
            status: status_rx,
            poll_interval: command.poll_interval,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS process id, if the child was still running when spawned
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        *self.status.borrow() == ChildStatus::Running
    }

    pub fn status(&self) -> ChildStatus {
        *self.status.borrow()
    }

    /// Write one payload line to the child
    pub async fn send(&self, payload: &Value) -> Result<(), WorkerError> {
        let mut line = serde_json::to_string(payload).map_err(WorkerError::Encode)?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        let pipe = stdin.as_mut().ok_or(WorkerError::Closed)?;
        pipe.write_all(line.as_bytes())
            .await
            .map_err(WorkerError::Send)?;
        pipe.flush().await.map_err(WorkerError::Send)?;
        trace!(worker = %self.name, bytes = line.len(), "Sent payload");
        Ok(())
    }

    /// Wait for the next reply line.
    ///
    /// Buffered output is always delivered first. While no line is available
    /// the child's liveness is checked once per poll interval.
    pub async fn recv(&self) -> Result<Value, ReceiveError> {
        let mut stdout = self.stdout.lock().await;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                line = stdout.next_line() => {
                    return match line? {
                        Some(line) => {
                            trace!(worker = %self.name, bytes = line.len(), "Received reply");
                            serde_json::from_str(&line).map_err(ReceiveError::Decode)
                        }
                        None => Err(ReceiveError::Closed {
                            worker: self.name.clone(),
                        }),
                    };
                }
                _ = ticker.tick() => {
                    if !self.is_alive() {
                        debug!(worker = %self.name, status = ?self.status(), "Worker died while waiting for a reply");
                        return Err(ReceiveError::Exited {
                            worker: self.name.clone(),
                        });
                    }
                }
            }
        }
    }

    /// Send a payload and wait for its reply, one exchange at a time
    pub async fn exchange(&self, payload: &Value) -> Result<Value, WorkerError> {
        let _guard = self.exchange_lock.lock().await;
        self.send(payload).await?;
        Ok(self.recv().await?)
    }

    /// Ask the child to terminate. Does not wait for it to exit.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    /// Callback for the shutdown coordinator that terminates this worker
    pub fn stop_callback(self: &Arc<Self>) -> impl FnOnce() + Send + 'static {
        let worker = Arc::clone(self);
        move || {
            info!(worker = %worker.name, "Terminating worker process");
            worker.terminate();
        }
    }

    /// Close the child's input and wait for it to exit
    pub async fn shutdown(&self) -> Option<ExitStatus> {
        self.stdin.lock().await.take();

        let mut status = self.status.clone();
        let exited = status
            .wait_for(|status| *status != ChildStatus::Running)
            .await;
        match exited {
            Ok(status) => status.exit_status(),
            Err(_) => None,
        }
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Own the child until it exits, terminating it when `cancel` fires
async fn reap(
    name: String,
    mut child: Child,
    cancel: CancellationToken,
    status_tx: watch::Sender<ChildStatus>,
) {
    let waited = tokio::select! {
        result = child.wait() => result,
        _ = cancel.cancelled() => {
            terminate_child(&name, &mut child);
            child.wait().await
        }
    };

    let status = match waited {
        Ok(status) => {
            debug!(worker = %name, %status, "Worker process exited");
            ChildStatus::Exited(status)
        }
        Err(e) => {
            warn!(worker = %name, "Failed to wait for worker process: {}", e);
            ChildStatus::Lost
        }
    };
    let _ = status_tx.send(status);
}

#[cfg(unix)]
fn terminate_child(name: &str, child: &mut Child) {
    let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: pid refers to our own child, which has not been reaped yet
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        warn!(
            worker = %name,
            "Failed to send SIGTERM: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn terminate_child(name: &str, child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(worker = %name, "Failed to kill worker process: {}", e);
    }
}

/// Spawn a worker for a single exchange, then close its input and reap it
pub async fn run_once(command: &WorkerCommand, payload: &Value) -> Result<Value, WorkerError> {
    let worker = ProcessWorker::spawn(command)?;
    let result = worker.exchange(payload).await;
    if result.is_err() {
        worker.terminate();
    }
    let status = worker.shutdown().await;
    debug!(worker = %command.name, ?status, "One-shot worker finished");
    result
}
