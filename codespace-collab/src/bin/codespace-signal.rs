//! Signaling relay binary.
//!
//! Configuration comes from `CODESPACE_SIGNAL_*` variables (an `app.env` or
//! `.env` file is read first). Stops on Ctrl-C.

use codespace_collab::server::{ServerConfig, ServerError, SignalServer};

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    log::info!(
        "Starting signal relay (max {} peers per room)",
        config.max_peers_per_room
    );

    let server = SignalServer::new(config);
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
            log::info!("Shutdown requested");
        })
        .await
}
