//! Child side of a worker process.
//!
//! The same binary re-executes itself as `cpias worker <name>`. The child
//! looks up `<name>` in a [`WorkerCatalog`], builds the stateful callback,
//! then answers one JSON line on stdout for every JSON line on stdin until
//! its input closes or it receives SIGTERM/SIGINT.

use std::collections::BTreeMap;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::shutdown::ShutdownSignal;

/// Stateful computation living inside a worker process
pub trait WorkerCallback: Send {
    fn call(&mut self, payload: Value) -> anyhow::Result<Value>;
}

impl<F> WorkerCallback for F
where
    F: FnMut(Value) -> anyhow::Result<Value> + Send,
{
    fn call(&mut self, payload: Value) -> anyhow::Result<Value> {
        self(payload)
    }
}

pub type WorkerFactory = Box<dyn Fn() -> anyhow::Result<Box<dyn WorkerCallback>> + Send + Sync>;

/// Named worker factories the child can be asked to run
#[derive(Default)]
pub struct WorkerCatalog {
    factories: BTreeMap<String, WorkerFactory>,
}

impl WorkerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> anyhow::Result<Box<dyn WorkerCallback>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build a fresh callback from the named factory
    pub fn build(&self, name: &str) -> anyhow::Result<Box<dyn WorkerCallback>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown worker factory: {}", name))?;
        factory()
    }
}

/// Why the receive loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// A termination signal arrived
    Cancelled,
    /// The parent closed its end of the channel
    Closed,
    /// The callback failed, or its result could not be encoded
    CallbackFailed,
}

impl LoopExit {
    pub fn exit_code(self) -> i32 {
        match self {
            LoopExit::Cancelled | LoopExit::Closed => 0,
            LoopExit::CallbackFailed => 1,
        }
    }
}

/// Answer payload lines from `reader` on `writer` until cancelled or closed
pub async fn run_worker_loop<R, W>(
    reader: R,
    mut writer: W,
    callback: &mut dyn WorkerCallback,
    cancel: &CancellationToken,
) -> LoopExit
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();

    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Worker loop cancelled");
                return LoopExit::Cancelled;
            }
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Worker input closed");
                return LoopExit::Closed;
            }
            Err(e) => {
                warn!("Failed to read worker input: {}", e);
                return LoopExit::Closed;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let payload: Value = match serde_json::from_str(&line) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Received invalid worker payload: {}", e);
                continue;
            }
        };

        let result = match callback.call(payload) {
            Ok(result) => result,
            Err(e) => {
                error!("Worker callback failed: {:#}", e);
                return LoopExit::CallbackFailed;
            }
        };

        let mut reply = match serde_json::to_string(&result) {
            Ok(reply) => reply,
            Err(e) => {
                error!("Failed to encode worker result: {}", e);
                return LoopExit::CallbackFailed;
            }
        };
        reply.push('\n');

        if let Err(e) = write_reply(&mut writer, &reply).await {
            debug!("Worker output closed: {}", e);
            return LoopExit::Closed;
        }
    }
}

async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, reply: &str) -> std::io::Result<()> {
    writer.write_all(reply.as_bytes()).await?;
    writer.flush().await
}

/// Entry point of `cpias worker <name>`, serving on stdin/stdout
pub async fn run_worker(catalog: &WorkerCatalog, name: &str) -> anyhow::Result<LoopExit> {
    let cancel = CancellationToken::new();
    let mut signal = ShutdownSignal::install()?;
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        let received = signal.recv().await;
        info!("Worker received {}", received);
        signal_token.cancel();
    });

    let mut callback = catalog.build(name).map_err(|e| {
        error!("Failed to create callback for worker '{}': {:#}", name, e);
        e
    })?;

    info!(worker = name, pid = std::process::id(), "Worker ready");
    let exit = run_worker_loop(
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        callback.as_mut(),
        &cancel,
    )
    .await;
    info!(worker = name, ?exit, "Worker stopped");
    Ok(exit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{duplex, AsyncReadExt};

    fn counter() -> impl FnMut(Value) -> anyhow::Result<Value> + Send {
        let mut seen = 0u64;
        move |payload| {
            seen += 1;
            Ok(json!({"seen": seen, "payload": payload}))
        }
    }

    async fn run_with_input(input: &str, callback: &mut dyn WorkerCallback) -> (LoopExit, String) {
        let (mut parent, child) = duplex(4096);
        parent.write_all(input.as_bytes()).await.unwrap();
        parent.shutdown().await.unwrap();

        let (child_read, child_write) = tokio::io::split(child);
        let exit = run_worker_loop(
            BufReader::new(child_read),
            child_write,
            callback,
            &CancellationToken::new(),
        )
        .await;

        let mut output = String::new();
        parent.read_to_string(&mut output).await.unwrap();
        (exit, output)
    }

    #[tokio::test]
    async fn test_loop_answers_each_line_with_state() {
        let mut callback = counter();
        let (exit, output) = run_with_input("\"a\"\n{\"b\": 1}\n", &mut callback).await;

        assert_eq!(exit, LoopExit::Closed);
        let replies: Vec<Value> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(
            replies,
            vec![
                json!({"seen": 1, "payload": "a"}),
                json!({"seen": 2, "payload": {"b": 1}}),
            ]
        );
    }

    #[tokio::test]
    async fn test_loop_skips_invalid_payload() {
        let mut callback = counter();
        let (exit, output) = run_with_input("not json\n\n7\n", &mut callback).await;

        assert_eq!(exit, LoopExit::Closed);
        assert_eq!(output, "{\"payload\":7,\"seen\":1}\n");
    }

    #[tokio::test]
    async fn test_loop_ends_on_callback_error() {
        let mut callback = |_payload: Value| -> anyhow::Result<Value> { anyhow::bail!("boom") };
        let (exit, output) = run_with_input("1\n2\n", &mut callback).await;

        assert_eq!(exit, LoopExit::CallbackFailed);
        assert_eq!(exit.exit_code(), 1);
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn test_loop_stops_on_cancel() {
        let (_parent, child) = duplex(64);
        let (child_read, child_write) = tokio::io::split(child);
        let cancel = CancellationToken::new();
        let mut callback = counter();

        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            token.cancel();
        });

        let exit = run_worker_loop(BufReader::new(child_read), child_write, &mut callback, &cancel).await;
        assert_eq!(exit, LoopExit::Cancelled);
    }

    #[test]
    fn test_catalog_build() {
        let mut catalog = WorkerCatalog::new();
        catalog.register("echo", || {
            Ok(Box::new(|payload: Value| -> anyhow::Result<Value> { Ok(payload) }) as Box<dyn WorkerCallback>)
        });

        assert!(catalog.contains("echo"));
        assert_eq!(catalog.names(), vec!["echo"]);

        let mut callback = catalog.build("echo").unwrap();
        assert_eq!(callback.call(json!([1])).unwrap(), json!([1]));
        assert!(catalog.build("missing").is_err());
    }
}
