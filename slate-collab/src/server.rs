//! Reference relay server: WebSocket push stream plus the HTTP polling API.
//!
//! Architecture:
//! ```text
//! Replica A ──ws──┐
//!                  ├── session key ── RelayHub ── DocumentSnapshot
//! Replica B ──ws──┘                     │
//!                                       ├── BroadcastGroup ──► stream members
//! Replica C ──http (poll / post)────────┘
//! ```
//!
//! A stream connection starts with `Join`; the relay answers with
//! `InitState` (the full snapshot) and from then on forwards every event
//! other replicas publish. Events arriving on the stream are applied to the
//! authoritative snapshot before they are fanned out.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use slate_core::Role;

use crate::http;
use crate::protocol::{MessageType, PeerInfo, SyncMessage};
use crate::relay::RelayHub;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket stream address
    pub bind_addr: String,
    /// HTTP snapshot/event API address (None = stream only)
    pub http_addr: Option<String>,
    /// Maximum stream members per session
    pub max_peers_per_session: usize,
    /// Broadcast channel capacity per session
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            http_addr: Some("127.0.0.1:9091".to_string()),
            max_peers_per_session: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_events: u64,
}

/// Who a stream connection joined as, once it has.
#[derive(Default)]
struct Membership {
    peer_id: Option<Uuid>,
    session: Option<String>,
}

pub struct RelayServer {
    config: ServerConfig,
    hub: Arc<RelayHub>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(RelayHub::new(
            config.broadcast_capacity,
            config.max_peers_per_session,
        ));
        Self {
            config,
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Start listening. Runs until the stream listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay stream listening on {}", self.config.bind_addr);

        if let Some(http_addr) = &self.config.http_addr {
            let http_listener = TcpListener::bind(http_addr).await?;
            log::info!("Relay HTTP API listening on {http_addr}");
            let app = http::router(self.hub.clone());
            tokio::spawn(async move {
                if let Err(e) = axum::serve(http_listener, app).await {
                    log::error!("HTTP API stopped: {e}");
                }
            });
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single stream connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<RelayHub>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut membership = Membership::default();
        let outcome = Self::serve_stream(ws_stream, addr, &hub, &stats, &mut membership).await;

        if let (Some(pid), Some(key)) = (membership.peer_id, membership.session.as_deref()) {
            hub.leave(key, pid).await;
            log::info!("Peer {pid} left session {key}");
        }
        stats.write().await.active_connections -= 1;

        outcome
    }

    async fn serve_stream<S>(
        ws_stream: tokio_tungstenite::WebSocketStream<S>,
        addr: SocketAddr,
        hub: &RelayHub,
        stats: &RwLock<ServerStats>,
        membership: &mut Membership,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let sync_msg = match SyncMessage::decode(&data) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }

                            match sync_msg.msg_type {
                                MessageType::Join => {
                                    if membership.session.is_some() {
                                        log::debug!("Ignoring second join from {addr}");
                                        continue;
                                    }
                                    let info = sync_msg.peer_info().unwrap_or_else(|_| {
                                        PeerInfo::with_id(sync_msg.peer_id, "Anonymous", Role::Student)
                                    });
                                    let (rx, snapshot) = match hub.join(&sync_msg.session, info.clone()).await {
                                        Ok(joined) => joined,
                                        Err(e) => {
                                            log::warn!("Join from {addr} refused: {e}");
                                            break;
                                        }
                                    };
                                    membership.peer_id = Some(info.replica_id);
                                    membership.session = Some(sync_msg.session.clone());
                                    broadcast_rx = Some(rx);

                                    let init = SyncMessage::init_state(sync_msg.session.as_str(), &snapshot)?;
                                    ws_sender.send(Message::Binary(init.encode()?.into())).await?;

                                    log::info!(
                                        "Peer {} ({}) joined session {} at revision {}",
                                        info.name,
                                        info.replica_id,
                                        sync_msg.session,
                                        snapshot.revision
                                    );
                                }

                                MessageType::Event => {
                                    let (Some(pid), Some(key)) = (membership.peer_id, membership.session.as_deref()) else {
                                        log::debug!("Event from {addr} before join");
                                        continue;
                                    };
                                    let relayed = match sync_msg.relayed_event() {
                                        Ok(r) if r.origin == pid && sync_msg.session == key => r,
                                        Ok(r) => {
                                            log::warn!("Dropping event from {addr} claiming origin {} in {}", r.origin, sync_msg.session);
                                            continue;
                                        }
                                        Err(e) => {
                                            log::warn!("Malformed event from {addr}: {e}");
                                            continue;
                                        }
                                    };
                                    if let Err(e) = hub.apply(key, &relayed).await {
                                        log::warn!("Rejected {} from {pid}: {e}", relayed.event.name());
                                        stats.write().await.rejected_events += 1;
                                    }
                                }

                                MessageType::Ping => {
                                    let pong = SyncMessage::pong(membership.peer_id.unwrap_or(sync_msg.peer_id));
                                    ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                }

                                _ => {
                                    log::debug!("Unhandled message type: {:?}", sync_msg.msg_type);
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Frames relayed from the rest of the session
                msg = async {
                    if let Some(ref mut rx) = broadcast_rx {
                        rx.recv().await
                    } else {
                        std::future::pending().await
                    }
                } => {
                    match msg {
                        Ok(data) => {
                            if let Ok(sync_msg) = SyncMessage::decode(&data) {
                                if Some(sync_msg.peer_id) == membership.peer_id {
                                    continue;
                                }
                            }
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Peer {:?} lagged by {n} messages", membership.peer_id);
                        }
                        Err(_) => break,
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn http_addr(&self) -> Option<&str> {
        self.config.http_addr.as_deref()
    }

    /// The authoritative store, shared with the HTTP API.
    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }
}
