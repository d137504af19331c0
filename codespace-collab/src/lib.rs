//! # codespace-collab: Real-time room sessions for a collaborative code workspace
//!
//! Editors, the shared console and the history panel each join a *room*
//! identified by a namespaced string. Every room is backed by one replicated
//! Yrs document and one reconnecting transport to the signaling relay, shared
//! by all participants of the same process.
//!
//! ## Architecture
//!
//! ```text
//!  ContentSync   CommandLog   SharedHistory   PresenceEngine
//!       │             │             │               │
//!       └─────────────┴──────┬──────┴───────────────┘
//!                            ▼
//!                  ┌───────────────────┐  join / release
//!                  │   RoomRegistry    │◄──────────────── ParticipantHandle
//!                  └─────────┬─────────┘
//!                            ▼
//!                  ┌───────────────────┐
//!                  │  RoomConnection   │── ReplicatedDoc + AwarenessCache
//!                  └─────────┬─────────┘
//!                            ▼
//!                  ┌───────────────────┐     WebSocket     ┌─────────────┐
//!                  │ TransportSession  │ ◄───────────────► │ SignalServer│
//!                  └───────────────────┘   Binary Proto    └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`doc`]: replicated document wrapper
//! - [`transport`]: reconnecting transport state machine
//! - [`room`]: one shared connection per room id
//! - [`registry`]: join/release with reference counting and grace-period cleanup
//! - [`presence`]: awareness state and stale-entry sweeping
//! - [`content`]: shared editor text with initial reconciliation
//! - [`command_log`]: append-only console history
//! - [`shared_state`]: save/restore notifications over a shared map
//! - [`backend`]: REST history backend
//! - [`broadcast`] and [`server`]: the signaling relay

pub mod protocol;
pub mod doc;
pub mod config;
pub mod transport;
pub mod presence;
pub mod room;
pub mod registry;
pub mod content;
pub mod command_log;
pub mod backend;
pub mod shared_state;
pub mod broadcast;
pub mod server;

// Re-exports for convenience
pub use protocol::{MessageType, PeerInfo, ProtocolError, RoomId, RoomKind, SyncMessage};
pub use doc::{DocError, ReplicatedDoc};
pub use config::{ConfigError, RoomConfig};
pub use transport::{
    BackoffPolicy, Dialer, Link, TransportEvent, TransportSession, TransportState, WsDialer,
};
pub use presence::{
    AwarenessCache, AwarenessMessage, CursorPosition, Identity, PresenceEngine, PresenceEntry,
    Selection,
};
pub use room::{Origin, ParticipantId, RoomConnection, RoomError, RoomEvent};
pub use registry::{ParticipantHandle, RoomRegistry};
pub use content::{ContentSync, Reconciliation};
pub use command_log::{CommandLog, CommandLogEntry};
pub use backend::{
    BackendError, HistoryBackend, HistoryEntry, RestHistoryBackend, StaticToken, TokenSource,
};
pub use shared_state::{NotificationSignal, OperationType, SharedHistory, SharedMap};
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope};
pub use server::{ServerConfig, ServerError, ServerStats, SignalServer};
