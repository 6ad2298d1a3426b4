use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::executor::{Job, JobError};
use super::protocol::{version_line, Message};
use super::registry::{CommandRegistry, Handler, HandlerResult, TypedHandler};
use super::shutdown::ShutdownCoordinator;
use super::store::Store;
use super::worker::{run_once, ProcessWorker, WorkerCommand, WorkerError};
use crate::clienv;
use crate::error::{Result, ServerError};

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Program re-executed as `<program> worker <factory>` for process jobs
    pub worker_program: PathBuf,
    pub poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: clienv::host(),
            port: clienv::port(),
            worker_program: clienv::worker_program(),
            poll_interval: clienv::poll_interval(),
        }
    }
}

pub struct Server {
    config: ServerConfig,
    registry: CommandRegistry,
    store: Store,
    shutdown: ShutdownCoordinator,
}

impl Server {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: CommandRegistry::new(),
            store: Store::new(),
            shutdown: ShutdownCoordinator::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Register a typed handler. Its argument type validates the request data.
    pub fn register<F, T, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Arc<Server>, Message, T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler(name, Arc::new(TypedHandler::new(handler)));
    }

    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        let name = name.into();
        debug!(command = %name, "Registered command");
        self.registry.register(name, handler);
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Run `callback` once when the server begins stopping
    pub fn on_stop(&self, callback: impl FnOnce() + Send + 'static) {
        self.shutdown.on_stop(callback);
    }

    /// Run a blocking closure on the blocking thread pool
    pub fn add_executor_job<F, T>(&self, func: F) -> Job<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.shutdown.jobs().spawn_blocking(func)
    }

    /// Schedule an async task that shutdown will wait for
    pub fn create_task<Fut>(&self, future: Fut) -> Job<Fut::Output>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        self.shutdown.jobs().spawn(future)
    }

    pub fn worker_command(&self, factory: &str) -> WorkerCommand {
        WorkerCommand::for_factory(&self.config.worker_program, factory)
            .poll_interval(self.config.poll_interval)
    }

    /// Run the named worker factory in a fresh process for a single payload
    pub async fn run_process_job(
        &self,
        factory: &str,
        payload: Value,
    ) -> std::result::Result<Value, JobError> {
        let command = self.worker_command(factory);
        let job = self
            .shutdown
            .jobs()
            .spawn(async move { run_once(&command, &payload).await });
        Ok(job.await??)
    }

    /// The persistent worker stored under `key`, spawned on first use.
    ///
    /// The worker is terminated when the server stops.
    pub fn worker(
        &self,
        key: &str,
        factory: &str,
    ) -> std::result::Result<Arc<ProcessWorker>, WorkerError> {
        self.store.get_or_try_insert_with(key, || {
            let worker = Arc::new(ProcessWorker::spawn(&self.worker_command(factory))?);
            self.shutdown.on_stop(worker.stop_callback());
            Ok(worker)
        })
    }

    /// Exchange one payload with a persistent worker
    pub async fn run_worker_job(
        &self,
        worker: &Arc<ProcessWorker>,
        payload: Value,
    ) -> std::result::Result<Value, JobError> {
        let worker = Arc::clone(worker);
        let job = self
            .shutdown
            .jobs()
            .spawn(async move { worker.exchange(&payload).await });
        Ok(job.await??)
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|source| ServerError::Bind {
                host: self.config.host.clone(),
                port: self.config.port,
                source,
            })?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections until the server is stopped
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let token = self.shutdown.listener_token();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Listener stopped");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(server.handle_connection(stream, peer));
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        Ok(())
    }

    /// Bind and serve in a background task
    pub async fn start(self: &Arc<Self>) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let listener = self.bind().await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(Arc::clone(self).serve(listener));
        Ok((addr, handle))
    }

    /// Run stop callbacks, wait for pending jobs, then stop the listener
    pub async fn stop(&self) {
        self.shutdown.stop().await;
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        debug!(%peer, "Connection accepted");
        if let Err(e) = stream.set_nodelay(true) {
            trace!(%peer, "Failed to set TCP_NODELAY: {}", e);
        }

        let (reader, writer) = stream.into_split();
        match self.serve_connection(BufReader::new(reader), writer, peer).await {
            Ok(()) => debug!(%peer, "Connection closed"),
            Err(e) => error!(%peer, "Connection handler error: {}", e),
        }
    }

    /// Greet the peer, then answer requests one at a time until EOF
    pub async fn serve_connection<R, W>(
        self: &Arc<Self>,
        mut reader: R,
        mut writer: W,
        peer: SocketAddr,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        writer.write_all(version_line().as_bytes()).await?;
        writer.flush().await?;

        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                return Ok(());
            }

            if let Some(reply) = self.dispatch(&line, peer).await? {
                writer.write_all(reply.encode()?.as_bytes()).await?;
                writer.flush().await?;
            }
        }
    }

    /// Handle one request line. Returns `None` when no reply should be sent.
    pub async fn dispatch(self: &Arc<Self>, line: &[u8], peer: SocketAddr) -> Result<Option<Message>> {
        let message = match Message::decode(line) {
            Ok(message) => message,
            Err(e) => {
                error!(%peer, "Received invalid message: {}", e);
                return Ok(None);
            }
        };

        let Some(handler) = message
            .command
            .as_deref()
            .and_then(|command| self.registry.get(command))
        else {
            warn!(%peer, command = ?message.command, "Received unknown command");
            return Ok(None);
        };

        let command = message.command_name().to_string();
        debug!(%peer, %command, client = ?message.client, "Dispatching command");
        let reply = handler
            .call(Arc::clone(self), message)
            .await
            .map_err(|source| ServerError::Handler { command, source })?;
        Ok(Some(reply))
    }
}
