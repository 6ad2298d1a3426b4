use std::io;

use thiserror::Error;

use crate::daemon::executor::JobError;
use crate::daemon::protocol::DecodeError;
use crate::daemon::store::StoreError;
use crate::daemon::worker::{ReceiveError, WorkerError};

/// Errors that end the server or a single connection task
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {host}:{port}: {source}")]
    Bind {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode reply: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("command '{command}' failed: {source}")]
    Handler {
        command: String,
        #[source]
        source: HandlerError,
    },
}

/// Errors a command handler may return
///
/// Any of these propagates out of the dispatch loop and closes the connection
/// the request arrived on.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Receive(#[from] ReceiveError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to decode result: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;
