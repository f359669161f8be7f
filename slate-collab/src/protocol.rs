//! Binary protocol for the relay stream.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ session key  │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ len + utf-8  │ varint   │ variable │
//! └──────────┴───────────┴──────────────┴──────────┴──────────┘
//! ```
//!
//! `Event` payloads carry a bincode [`RelayedEvent`]; `InitState` payloads a
//! bincode [`DocumentSnapshot`]. The HTTP API uses the same types as JSON.

use serde::{Deserialize, Serialize};
use slate_core::{BoardEvent, DocumentSnapshot, ReplicaId, Role};
use uuid::Uuid;

/// Message types for the relay protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// First frame from a client: which session, who is asking.
    Join = 1,
    /// Full authoritative snapshot, sent once after `Join`.
    InitState = 2,
    /// One board event, relayed after the relay applied it.
    Event = 3,
    PeerJoined = 4,
    PeerLeft = 5,
    Ping = 6,
    Pong = 7,
}

/// Participant identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub replica_id: ReplicaId,
    pub name: String,
    pub role: Role,
}

impl PeerInfo {
    /// New identity with a fresh replica id.
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self::with_id(Uuid::new_v4(), name, role)
    }

    pub fn with_id(replica_id: ReplicaId, name: impl Into<String>, role: Role) -> Self {
        Self {
            replica_id,
            name: name.into(),
            role,
        }
    }
}

/// A board event stamped with its sender and the sender's publish clock.
///
/// `(origin, clock)` is unique per published event and is what receivers
/// use to drop repeat deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayedEvent {
    pub origin: ReplicaId,
    pub clock: u64,
    pub event: BoardEvent,
}

impl RelayedEvent {
    pub fn new(origin: ReplicaId, clock: u64, event: BoardEvent) -> Self {
        Self { origin, clock, event }
    }

    pub fn key(&self) -> (ReplicaId, u64) {
        (self.origin, self.clock)
    }
}

/// Top-level stream message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub session: String,
    /// Sender's publish clock (events only)
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    pub fn join(session: impl Into<String>, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Join,
            peer_id: info.replica_id,
            session: session.into(),
            clock: 0,
            payload: encode_payload(info)?,
        })
    }

    pub fn init_state(
        session: impl Into<String>,
        snapshot: &DocumentSnapshot,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::InitState,
            peer_id: Uuid::nil(),
            session: session.into(),
            clock: snapshot.revision,
            payload: encode_payload(snapshot)?,
        })
    }

    pub fn event(session: impl Into<String>, event: &RelayedEvent) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Event,
            peer_id: event.origin,
            session: session.into(),
            clock: event.clock,
            payload: encode_payload(event)?,
        })
    }

    pub fn peer_joined(session: impl Into<String>, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::PeerJoined,
            ..Self::join(session, info)?
        })
    }

    pub fn peer_left(peer_id: Uuid, session: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::PeerLeft,
            peer_id,
            session: session.into(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            peer_id,
            session: String::new(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            ..Self::ping(peer_id)
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the identity carried by `Join` / `PeerJoined`.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        match self.msg_type {
            MessageType::Join | MessageType::PeerJoined => decode_payload(&self.payload),
            _ => Err(ProtocolError::InvalidMessageType),
        }
    }

    pub fn snapshot(&self) -> Result<DocumentSnapshot, ProtocolError> {
        if self.msg_type != MessageType::InitState {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    pub fn relayed_event(&self) -> Result<RelayedEvent, ProtocolError> {
        if self.msg_type != MessageType::Event {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
    /// HTTP request failed or returned a non-success status.
    Http(String),
    /// The relay refused to apply an event.
    Rejected(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
            Self::Http(e) => write!(f, "HTTP error: {e}"),
            Self::Rejected(e) => write!(f, "Rejected by relay: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
