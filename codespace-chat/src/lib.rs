//! # codespace-chat: Standalone room chat over WebSocket
//!
//! ```text
//! client ──ws?roomId&userId&userName──► ChatServer ──► ChatHub
//!                                                        │
//!                         rooms: roomId → {sockets, history (capped)}
//!                         users: userId → live socket (one at most)
//! ```
//!
//! Everything is in memory; a restart loses rooms, sockets and history.

pub mod config;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod server;

pub use config::ChatConfig;
pub use error::ChatError;
pub use hub::{ChatHub, ConnectionId, Flow};
pub use protocol::{ChatFrame, ChatMessage, ConnectParams, FrameType, OnlineUser, ProtocolError};
pub use server::ChatServer;
