use cpias::commands;
use cpias::daemon::run_worker;
use tracing::error;

/// Serve the named worker and return the process exit code
pub(crate) async fn cmd_worker(name: &str) -> i32 {
    match run_worker(&commands::worker_catalog(), name).await {
        Ok(exit) => exit.exit_code(),
        Err(e) => {
            error!("Worker '{}' failed: {:#}", name, e);
            1
        }
    }
}
