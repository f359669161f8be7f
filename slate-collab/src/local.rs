//! Same-device fan-out between replicas of one session (for example two
//! views in the same process). Nothing here is durable.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use slate_core::Provenance;

use crate::broadcast::{BroadcastGroup, RoomManager};
use crate::protocol::{PeerInfo, RelayedEvent, SyncMessage};
use crate::transport::{Inbound, Subscription, Transport, TransportKind};

/// Process-wide hub. Clone the handle to share it.
#[derive(Clone)]
pub struct LocalHub {
    rooms: Arc<RoomManager>,
}

impl LocalHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RoomManager::new(capacity)),
        }
    }

    /// Join `session` as `peer`.
    pub async fn join(&self, session: &str, peer: PeerInfo) -> LocalBroadcast {
        let room = self.rooms.get_or_create(session).await;
        // The receiver from registration is not needed; each subscription
        // takes its own.
        drop(room.add_peer(peer.clone()).await);
        LocalBroadcast {
            hub: self.clone(),
            room,
            session: session.to_string(),
            peer,
        }
    }

    pub async fn session_count(&self) -> usize {
        self.rooms.room_count().await
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(256)
    }
}

pub struct LocalBroadcast {
    hub: LocalHub,
    room: Arc<BroadcastGroup>,
    session: String,
    peer: PeerInfo,
}

impl LocalBroadcast {
    pub fn session(&self) -> &str {
        &self.session
    }

    pub async fn member_count(&self) -> usize {
        self.room.peer_count().await
    }

    /// Leave the session; the room disappears with its last member.
    pub async fn leave(&self) {
        self.room.remove_peer(&self.peer.replica_id).await;
        self.hub.rooms.remove_if_empty(&self.session).await;
    }
}

impl Transport for LocalBroadcast {
    fn kind(&self) -> TransportKind {
        TransportKind::LocalBroadcast
    }

    fn publish(&self, event: RelayedEvent) {
        match SyncMessage::event(self.session.as_str(), &event) {
            Ok(msg) => {
                if let Err(e) = self.room.broadcast(&msg) {
                    log::warn!("Local broadcast of {} failed: {e}", event.event.name());
                }
            }
            Err(e) => log::warn!("Could not encode {}: {e}", event.event.name()),
        }
    }

    fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(256);
        let mut frames = self.room.subscribe();
        let room = self.room.clone();
        let own = self.peer.replica_id;

        let task = tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(data) => {
                        let relayed = match SyncMessage::decode(&data).and_then(|m| m.relayed_event()) {
                            Ok(relayed) => relayed,
                            Err(e) => {
                                log::warn!("Dropping malformed local frame: {e}");
                                continue;
                            }
                        };
                        if relayed.origin == own {
                            continue;
                        }
                        if tx.send(Inbound::from_relayed(relayed, Provenance::LocalBroadcast)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Local subscriber {own} lagged by {n} messages");
                        room.record_lag(n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription::new(rx, vec![task])
    }
}
