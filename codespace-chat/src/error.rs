use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Environment variable error: {0}")]
    Config(#[from] envy::Error),
}
