//! Dedicated relay entry point.
//!
//! Usage: `rampart-server [listen_addr]` (default 0.0.0.0:1234).
//! Log verbosity is controlled through `RUST_LOG`.

use rampart_server::{RelayServer, ServerSettings};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "0.0.0.0:1234".to_string());

    let settings = ServerSettings {
        listen_addr,
        ..ServerSettings::default()
    };

    let server = RelayServer::bind(settings).await?;
    tracing::info!(addr = %server.local_addr()?, "rampart relay up");
    server.run().await?;
    Ok(())
}
