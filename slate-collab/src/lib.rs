//! # slate-collab — Transports and relay for Slate whiteboards
//!
//! Moves board events between replicas of one session and hosts the
//! reference relay that keeps the authoritative snapshot.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  local broadcast   ┌──────────────┐
//! │ SyncSession  │ ◄────────────────► │ SyncSession  │   same process
//! │ (teacher)    │                    │ (student)    │
//! └──────┬───────┘                    └──────┬───────┘
//!        │ push (ws) or polling (http)       │
//!        ▼                                   ▼
//! ┌─────────────────────────────────────────────────┐
//! │ RelayServer                                     │
//! │   RelayHub ── DocumentSnapshot per session      │
//! │       └──── BroadcastGroup (fan-out)            │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`] — Session fan-out with backpressure
//! - [`transport`] — Transport trait and inbound stream
//! - [`local`] — In-process local broadcast
//! - [`push`] — WebSocket stream client with offline outbox
//! - [`polling`] — Snapshot polling client and the `RelayApi` contract
//! - [`probe`] — One-shot push/polling selection
//! - [`coalesce`] — Outbound append coalescing
//! - [`session`] — Session driver around the document controller
//! - [`relay`] — Authoritative in-memory relay store
//! - [`http`] — Relay HTTP API
//! - [`server`] — Relay server

pub mod broadcast;
pub mod coalesce;
pub mod http;
pub mod local;
pub mod polling;
pub mod probe;
pub mod protocol;
pub mod push;
pub mod relay;
pub mod server;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use coalesce::AppendCoalescer;
pub use local::{LocalBroadcast, LocalHub};
pub use polling::{HttpRelay, PollingTransport, RelayApi};
pub use probe::{probe_stream, RemoteMode};
pub use protocol::{MessageType, PeerInfo, ProtocolError, RelayedEvent, SyncMessage};
pub use push::{OfflineQueue, PushConfig, PushTransport};
pub use relay::RelayHub;
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use session::{SessionConfig, SessionUpdate, SyncSession};
pub use transport::{Inbound, Subscription, SyncFault, Transport, TransportKind};
