mod args;
mod cmd_client;
mod cmd_serve;
mod cmd_worker;

use args::{Cli, Commands};
use clap::Parser;
use cpias::{clienv, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    telemetry::init(&clienv::log_filter(cli.debug));

    match cli.command {
        Commands::Serve { host, port } => cmd_serve::cmd_serve(host, port).await?,
        Commands::Client {
            message,
            host,
            port,
        } => cmd_client::cmd_client(&message, host, port).await?,
        Commands::Worker { name } => {
            let code = cmd_worker::cmd_worker(&name).await;
            // The runtime would otherwise wait on the blocking stdin reader
            std::process::exit(code);
        }
    }

    Ok(())
}
