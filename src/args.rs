use clap::{Parser, Subcommand};

pub(crate) const DEFAULT_MESSAGE: &str =
    "{\"cli\": \"client-1\", \"cmd\": \"hello\", \"dta\": {\"planet\": \"world\"}}\n";

#[derive(Parser)]
#[command(name = "cpias")]
#[command(version)]
#[command(about = "Line-delimited JSON command server", long_about = None)]
pub(crate) struct Cli {
    /// Log at debug level. Otherwise CPIAS_LOG or RUST_LOG decide.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the command server until SIGINT/SIGTERM
    Serve {
        /// Host to listen on (default: $CPIAS_HOST or 127.0.0.1)
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to listen on (default: $CPIAS_PORT or 8555)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Connect to a server and send a message twice
    Client {
        /// Raw request line to send
        #[arg(long, default_value = DEFAULT_MESSAGE)]
        message: String,

        /// Server host (default: $CPIAS_HOST or 127.0.0.1)
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Server port (default: $CPIAS_PORT or 8555)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run a worker process on stdin/stdout (spawned by the server)
    #[command(hide = true)]
    Worker {
        /// Worker factory name
        name: String,
    },
}
