//! Chat service binary. Configured from `CHAT_*` variables; stops on
//! SIGINT or SIGTERM after closing every socket.

use codespace_chat::{ChatConfig, ChatError, ChatServer};

#[tokio::main]
async fn main() -> Result<(), ChatError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ChatConfig::load()?;
    let server = ChatServer::new(config);
    server.run_until(shutdown_signal()).await
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = tokio::signal::ctrl_c() => log::info!("Received SIGINT, shutting down..."),
                _ = sigterm.recv() => log::info!("Received SIGTERM, shutting down..."),
            },
            Err(e) => {
                log::warn!("SIGTERM handler unavailable: {e}");
                let _ = tokio::signal::ctrl_c().await;
                log::info!("Received SIGINT, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("Received Ctrl-C, shutting down...");
    }
}
