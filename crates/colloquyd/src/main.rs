//! Directory service daemon for the bus transport.
//!
//! Hosts the service-manager interface on the socket named by
//! `RPCD_SOCKET_LOCATION`. Keeps no persistent state: published names live
//! exactly as long as the process.

use tracing_subscriber::EnvFilter;

use colloquy::bus;
use colloquy::Server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let uri = bus::socket_location();
    let server = Server::listen(&uri, bus::service_manager_context()).await?;
    server.resume();
    tracing::info!(uri = %server.local_uri(), "directory service listening");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.close().await;
    Ok(())
}
