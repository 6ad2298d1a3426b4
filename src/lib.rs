pub mod clienv;
pub mod commands;
pub mod daemon;
pub mod error;
pub mod telemetry;

pub use error::{HandlerError, Result, ServerError};
