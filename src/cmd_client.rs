use cpias::clienv;
use cpias::daemon::client::run_client;

pub(crate) async fn cmd_client(
    message: &str,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(clienv::host);
    let port = port.unwrap_or_else(clienv::port);
    run_client(message, &host, port).await?;
    Ok(())
}
