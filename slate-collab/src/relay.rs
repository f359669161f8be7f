//! In-memory reference relay: one authoritative snapshot and one broadcast
//! group per session key.
//!
//! Every accepted event is applied to the snapshot before it is fanned out,
//! so a replica that joins (or polls) later sees the same board as one that
//! followed the stream.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use slate_core::{BoardEvent, DocumentSnapshot, Role};

use crate::broadcast::RoomManager;
use crate::polling::RelayApi;
use crate::protocol::{PeerInfo, ProtocolError, RelayedEvent, SyncMessage};

pub struct RelayHub {
    rooms: RoomManager,
    documents: RwLock<HashMap<String, DocumentSnapshot>>,
    /// Role announced by every replica that ever joined, per session.
    roles: RwLock<HashMap<String, HashMap<Uuid, Role>>>,
    max_peers_per_session: usize,
}

impl RelayHub {
    pub fn new(broadcast_capacity: usize, max_peers_per_session: usize) -> Self {
        Self {
            rooms: RoomManager::new(broadcast_capacity),
            documents: RwLock::new(HashMap::new()),
            roles: RwLock::new(HashMap::new()),
            max_peers_per_session,
        }
    }

    /// Current snapshot; an unknown session is an empty board.
    pub async fn snapshot(&self, session: &str) -> DocumentSnapshot {
        self.documents
            .read()
            .await
            .get(session)
            .cloned()
            .unwrap_or_default()
    }

    /// Apply an event to the session's snapshot, then relay it to every
    /// stream member. Returns whether the snapshot changed.
    ///
    /// Events that change nothing (stroke-end, tool announcements, replays)
    /// are still relayed. Fan-out happens under the document lock so members
    /// see events in the order they were applied. A clear is followed by the
    /// full snapshot, which settles strokes its sender had not seen yet.
    ///
    /// Page and file events from a replica that joined without the teacher
    /// role are rejected. Origins that never joined the stream are not
    /// checked.
    pub async fn apply(&self, session: &str, relayed: &RelayedEvent) -> Result<bool, ProtocolError> {
        check_session_key(session)?;
        if relayed.event.is_teacher_only() {
            if let Some(role) = self.role_of(session, relayed.origin).await {
                if role != Role::Teacher {
                    return Err(ProtocolError::Rejected(format!(
                        "{} from {} with role {role:?}",
                        relayed.event.name(),
                        relayed.origin
                    )));
                }
            }
        }
        let room = self.rooms.get(session).await;

        let mut documents = self.documents.write().await;
        let doc = documents.entry(session.to_string()).or_default();
        let changed = doc
            .apply(&relayed.event)
            .map_err(|e| ProtocolError::Rejected(e.to_string()))?;

        if let Some(room) = room {
            let reached = room.broadcast(&SyncMessage::event(session, relayed)?)?;
            log::trace!(
                "Relayed {} from {} to {reached} receivers in {session}",
                relayed.event.name(),
                relayed.origin
            );
            if relayed.event == BoardEvent::Clear {
                room.broadcast(&SyncMessage::init_state(session, doc)?)?;
            }
        }
        Ok(changed)
    }

    /// Add a stream member. The receiver is registered before the snapshot
    /// is read, so nothing applied afterwards can be missed.
    pub async fn join(
        &self,
        session: &str,
        info: PeerInfo,
    ) -> Result<(broadcast::Receiver<Arc<Vec<u8>>>, DocumentSnapshot), ProtocolError> {
        check_session_key(session)?;
        let room = self.rooms.get_or_create(session).await;
        if room.peer_count().await >= self.max_peers_per_session && !room.has_peer(&info.replica_id).await {
            return Err(ProtocolError::Rejected(format!("session {session} is full")));
        }

        let joined = SyncMessage::peer_joined(session, &info)?;
        self.roles
            .write()
            .await
            .entry(session.to_string())
            .or_default()
            .insert(info.replica_id, info.role);
        let rx = room.add_peer(info).await;
        room.broadcast(&joined)?;
        Ok((rx, self.snapshot(session).await))
    }

    /// Remove a stream member. The snapshot is kept for later joins.
    pub async fn leave(&self, session: &str, peer_id: Uuid) {
        let Some(room) = self.rooms.get(session).await else {
            return;
        };
        if room.remove_peer(&peer_id).await.is_some() {
            let _ = room.broadcast(&SyncMessage::peer_left(peer_id, session));
        }
        if self.rooms.remove_if_empty(session).await {
            log::info!("Session {session} has no stream members left");
        }
    }

    /// Role a replica announced when it joined `session`.
    pub async fn role_of(&self, session: &str, replica: Uuid) -> Option<Role> {
        self.roles.read().await.get(session)?.get(&replica).copied()
    }

    pub async fn member_count(&self, session: &str) -> usize {
        match self.rooms.get(session).await {
            Some(room) => room.peer_count().await,
            None => 0,
        }
    }

    /// Sessions with at least one stream member.
    pub async fn active_sessions(&self) -> usize {
        self.rooms.room_count().await
    }

    /// Sessions with a stored snapshot.
    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new(256, 100)
    }
}

impl RelayApi for RelayHub {
    async fn fetch_snapshot(&self, session: &str) -> Result<DocumentSnapshot, ProtocolError> {
        check_session_key(session)?;
        Ok(self.snapshot(session).await)
    }

    async fn post_event(&self, session: &str, event: &RelayedEvent) -> Result<(), ProtocolError> {
        self.apply(session, event).await.map(|_| ())
    }
}

fn check_session_key(session: &str) -> Result<(), ProtocolError> {
    if session.is_empty() || session.contains('/') {
        return Err(ProtocolError::Rejected(format!("invalid session key {session:?}")));
    }
    Ok(())
}
