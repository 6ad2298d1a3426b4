use cpias::daemon::{Server, ServerConfig, ShutdownSignal};
use cpias::{clienv, commands};
use tracing::{error, info};

pub(crate) async fn cmd_serve(host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let config = ServerConfig {
        host: host.unwrap_or_else(clienv::host),
        port: port.unwrap_or_else(clienv::port),
        ..ServerConfig::default()
    };
    info!(
        "Starting CPIAServer {} (worker program: {})",
        env!("CARGO_PKG_VERSION"),
        config.worker_program.display()
    );

    let mut signal = ShutdownSignal::install()?;
    let server = Server::new(config);
    commands::register_all(&server);
    info!("Registered commands: {}", server.registry().names().join(", "));

    let (addr, serve) = server.start().await?;
    info!("CPIAServer ready on {}", addr);

    let received = signal.recv().await;
    info!("Received {}", received);

    server.stop().await;
    match serve.await {
        Ok(result) => result?,
        Err(e) => error!("Listener task failed: {}", e),
    }

    info!("CPIAServer stopped");
    Ok(())
}
