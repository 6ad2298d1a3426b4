//! Command dispatch server
//!
//! Accepts line-delimited JSON requests over TCP, dispatches each to a
//! registered handler and writes the handler's reply back on the same
//! connection. Handlers can offload work to the blocking thread pool, to a
//! one-shot worker process, or to a persistent worker process.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                  cpias serve                    │
//! ├────────────────────────────────────────────────┤
//! │  Listener  │  Dispatch loop  │  Shutdown coord  │
//! │  (tcp)     │  (per conn)     │  (jobs, stop cb) │
//! ├────────────────────────────────────────────────┤
//! │  inline │ blocking pool │ one-shot │ persistent │
//! └────────────────────────────────────────────────┘
//!                          │ stdin/stdout JSON lines
//!                  cpias worker <factory>
//! ```

pub mod child;
pub mod client;
pub mod executor;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use child::{run_worker, LoopExit, WorkerCallback, WorkerCatalog};
pub use client::Client;
pub use executor::{Job, JobError, JobTracker};
pub use protocol::Message;
pub use registry::{CommandRegistry, Handler, HandlerResult, TypedHandler};
pub use server::{Server, ServerConfig};
pub use shutdown::{ShutdownCoordinator, ShutdownSignal};
pub use store::{Store, StoreError};
pub use worker::{ProcessWorker, ReceiveError, WorkerCommand, WorkerError};
