//! Built-in command packages

pub mod hello;

use crate::daemon::child::WorkerCatalog;
use crate::daemon::server::Server;

/// Register every built-in command package on `server`
pub fn register_all(server: &Server) {
    hello::register(server);
}

/// Worker factories available to `cpias worker <name>`
pub fn worker_catalog() -> WorkerCatalog {
    let mut catalog = WorkerCatalog::new();
    hello::register_workers(&mut catalog);
    catalog
}
