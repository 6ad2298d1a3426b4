use std::path::PathBuf;
use std::time::Duration;

use crate::daemon::worker::DEFAULT_POLL_INTERVAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvVar {
    CpiasHost,
    CpiasPort,
    CpiasPollIntervalMs,
    CpiasWorkerProgram,
    CpiasLog,
    RustLog,
}

impl EnvVar {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvVar::CpiasHost => "CPIAS_HOST",
            EnvVar::CpiasPort => "CPIAS_PORT",
            EnvVar::CpiasPollIntervalMs => "CPIAS_POLL_INTERVAL_MS",
            EnvVar::CpiasWorkerProgram => "CPIAS_WORKER_PROGRAM",
            EnvVar::CpiasLog => "CPIAS_LOG",
            EnvVar::RustLog => "RUST_LOG",
        }
    }
}

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8555;
const FALLBACK_WORKER_PROGRAM: &str = "cpias";
const DEFAULT_LOG_FILTER: &str = "info";
const DEBUG_LOG_FILTER: &str = "debug";

/// Non-empty value of an environment variable
pub fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub fn env_or(name: &str, default: &str) -> String {
    env_opt(name).unwrap_or_else(|| default.to_string())
}

/// Listen host ($CPIAS_HOST or 127.0.0.1)
pub fn host() -> String {
    let host = env_or(EnvVar::CpiasHost.as_str(), DEFAULT_HOST);
    tracing::trace!(%host, "Resolved listen host");
    host
}

/// Listen port ($CPIAS_PORT or 8555)
pub fn port() -> u16 {
    let port = parse_or(EnvVar::CpiasPort, DEFAULT_PORT);
    tracing::trace!(port, "Resolved listen port");
    port
}

/// Worker liveness poll interval ($CPIAS_POLL_INTERVAL_MS or 500ms)
pub fn poll_interval() -> Duration {
    let interval = env_opt(EnvVar::CpiasPollIntervalMs.as_str())
        .and_then(|v| match v.trim().parse::<u64>() {
            Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
            _ => {
                tracing::warn!(value = %v, "Ignoring invalid CPIAS_POLL_INTERVAL_MS");
                None
            }
        })
        .unwrap_or(DEFAULT_POLL_INTERVAL);
    tracing::trace!(?interval, "Resolved worker poll interval");
    interval
}

/// Program run as `<program> worker <factory>` ($CPIAS_WORKER_PROGRAM or the current executable)
pub fn worker_program() -> PathBuf {
    let program = env_opt(EnvVar::CpiasWorkerProgram.as_str())
        .map(PathBuf::from)
        .or_else(|| std::env::current_exe().ok())
        .unwrap_or_else(|| PathBuf::from(FALLBACK_WORKER_PROGRAM));
    tracing::trace!(program = %program.display(), "Resolved worker program");
    program
}

/// Log filter: `debug` when forced, else $CPIAS_LOG, $RUST_LOG, `info`
pub fn log_filter(debug: bool) -> String {
    if debug {
        return DEBUG_LOG_FILTER.to_string();
    }
    env_opt(EnvVar::CpiasLog.as_str())
        .or_else(|| env_opt(EnvVar::RustLog.as_str()))
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
}

fn parse_or<T: std::str::FromStr>(var: EnvVar, default: T) -> T {
    match env_opt(var.as_str()) {
        Some(v) => v.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(var = var.as_str(), value = %v, "Ignoring unparsable value");
            default
        }),
        None => default,
    }
}
