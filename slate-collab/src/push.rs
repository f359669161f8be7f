//! Relay stream transport over WebSocket.
//!
//! Provides:
//! - Join handshake followed by the relay's full snapshot (`InitState`)
//! - Incremental events from other replicas, own echoes dropped
//! - Reconnect with exponential backoff
//! - Outbox for events published while disconnected, replayed on reconnect

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use slate_core::Provenance;

use crate::protocol::{MessageType, PeerInfo, ProtocolError, RelayedEvent, SyncMessage};
use crate::transport::{Inbound, Subscription, Transport, TransportKind};

/// Events published while the stream was down, oldest first.
pub struct OfflineQueue {
    queue: VecDeque<QueuedEvent>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedEvent {
    event: RelayedEvent,
    queued_at: Instant,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an event for replay. When full, the oldest entry is dropped.
    pub fn enqueue(&mut self, event: RelayedEvent) -> bool {
        let mut kept_all = true;
        if self.queue.len() >= self.max_size {
            if let Some(dropped) = self.queue.pop_front() {
                log::warn!(
                    "Outbox full, dropping {} queued {:?} ago",
                    dropped.event.event.name(),
                    dropped.queued_at.elapsed()
                );
            }
            kept_all = false;
        }
        if self.max_size > 0 {
            self.queue.push_back(QueuedEvent {
                event,
                queued_at: Instant::now(),
            });
        }
        kept_all
    }

    pub fn drain(&mut self) -> Vec<RelayedEvent> {
        self.queue.drain(..).map(|q| q.event).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Connection settings for the relay stream.
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// `ws://host:port`; the session key is sent in the join frame.
    pub url: String,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub outbox_capacity: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            reconnect_min: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(10),
            outbox_capacity: 1024,
        }
    }
}

pub struct PushTransport {
    config: PushConfig,
    session: String,
    peer: PeerInfo,
    outgoing_tx: mpsc::UnboundedSender<RelayedEvent>,
    /// Taken by the first `subscribe`.
    outgoing_rx: Mutex<Option<mpsc::UnboundedReceiver<RelayedEvent>>>,
}

impl PushTransport {
    pub fn new(config: PushConfig, session: impl Into<String>, peer: PeerInfo) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        Self {
            config,
            session: session.into(),
            peer,
            outgoing_tx,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
        }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

impl Transport for PushTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Push
    }

    fn publish(&self, event: RelayedEvent) {
        if self.outgoing_tx.send(event).is_err() {
            log::debug!("Push transport stopped; event dropped");
        }
    }

    fn subscribe(&self) -> Subscription {
        let outgoing = self.outgoing_rx.lock().ok().and_then(|mut slot| slot.take());
        let Some(outgoing) = outgoing else {
            log::warn!("Push transport for {} already subscribed", self.session);
            return Subscription::closed();
        };
        let (tx, rx) = mpsc::channel(256);
        let task = tokio::spawn(run_connection(
            self.config.clone(),
            self.session.clone(),
            self.peer.clone(),
            outgoing,
            tx,
        ));
        Subscription::new(rx, vec![task])
    }
}

enum Disconnect {
    /// Stream dropped; try again.
    Lost,
    /// Subscriber or publisher went away; stop for good.
    Stopped,
}

async fn run_connection(
    config: PushConfig,
    session: String,
    peer: PeerInfo,
    mut outgoing: mpsc::UnboundedReceiver<RelayedEvent>,
    inbound: mpsc::Sender<Inbound>,
) {
    let mut outbox = OfflineQueue::new(config.outbox_capacity);
    let mut backoff = config.reconnect_min;

    loop {
        match tokio_tungstenite::connect_async(config.url.as_str()).await {
            Ok((ws_stream, _)) => {
                log::info!("Connected to relay {} for session {session}", config.url);
                backoff = config.reconnect_min;
                match stream_session(ws_stream, &session, &peer, &mut outgoing, &mut outbox, &inbound).await {
                    Disconnect::Stopped => return,
                    Disconnect::Lost => log::warn!("Relay stream for {session} lost, reconnecting"),
                }
            }
            Err(e) => log::warn!("Relay connect to {} failed: {e}", config.url),
        }

        // Keep collecting publishes while waiting to retry.
        let retry_at = tokio::time::sleep(backoff);
        tokio::pin!(retry_at);
        loop {
            tokio::select! {
                _ = &mut retry_at => break,
                event = outgoing.recv() => match event {
                    Some(event) => { outbox.enqueue(event); }
                    None => return,
                },
            }
        }
        backoff = (backoff * 2).min(config.reconnect_max);
    }
}

async fn stream_session<S>(
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    session: &str,
    peer: &PeerInfo,
    outgoing: &mut mpsc::UnboundedReceiver<RelayedEvent>,
    outbox: &mut OfflineQueue,
    inbound: &mpsc::Sender<Inbound>,
) -> Disconnect
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let join = match SyncMessage::join(session, peer).and_then(|m| m.encode()) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::error!("Could not encode join for {session}: {e}");
            return Disconnect::Stopped;
        }
    };
    if ws_sender.send(Message::Binary(join.into())).await.is_err() {
        return Disconnect::Lost;
    }

    let queued = outbox.drain();
    if !queued.is_empty() {
        log::info!("Replaying {} queued events", queued.len());
    }
    for (i, event) in queued.iter().enumerate() {
        if send_event(&mut ws_sender, session, event).await.is_err() {
            for event in &queued[i..] {
                outbox.enqueue(event.clone());
            }
            return Disconnect::Lost;
        }
    }

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let item = match SyncMessage::decode(&data) {
                            Ok(sync_msg) => inbound_item(sync_msg, peer),
                            Err(e) => {
                                log::warn!("Failed to decode relay frame: {e}");
                                None
                            }
                        };
                        if let Some(item) = item {
                            if inbound.send(item).await.is_err() {
                                return Disconnect::Stopped;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_sender.send(Message::Pong(data)).await.is_err() {
                            return Disconnect::Lost;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Disconnect::Lost,
                    Some(Err(e)) => {
                        log::warn!("Relay stream error: {e}");
                        return Disconnect::Lost;
                    }
                    _ => {}
                }
            }
            event = outgoing.recv() => {
                let Some(event) = event else {
                    return Disconnect::Stopped;
                };
                if send_event(&mut ws_sender, session, &event).await.is_err() {
                    outbox.enqueue(event);
                    return Disconnect::Lost;
                }
            }
        }
    }
}

async fn send_event<W>(writer: &mut W, session: &str, event: &RelayedEvent) -> Result<(), ProtocolError>
where
    W: futures_util::Sink<Message> + Unpin,
{
    let bytes = match SyncMessage::event(session, event).and_then(|m| m.encode()) {
        Ok(bytes) => bytes,
        Err(e) => {
            // Not retryable; drop it.
            log::error!("Could not encode {}: {e}", event.event.name());
            return Ok(());
        }
    };
    writer
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|_| ProtocolError::ConnectionClosed)
}

fn inbound_item(msg: SyncMessage, peer: &PeerInfo) -> Option<Inbound> {
    match msg.msg_type {
        MessageType::InitState => match msg.snapshot() {
            Ok(snapshot) => Some(Inbound::Snapshot {
                snapshot,
                via: Provenance::Push,
            }),
            Err(e) => {
                log::warn!("Bad init-state payload: {e}");
                None
            }
        },
        MessageType::Event => {
            if msg.peer_id == peer.replica_id {
                return None;
            }
            match msg.relayed_event() {
                Ok(relayed) if relayed.origin == peer.replica_id => None,
                Ok(relayed) => Some(Inbound::from_relayed(relayed, Provenance::Push)),
                Err(e) => {
                    log::warn!("Bad event payload from {}: {e}", msg.peer_id);
                    None
                }
            }
        }
        MessageType::PeerJoined => {
            if let Ok(info) = msg.peer_info() {
                log::debug!("{} ({:?}) joined {}", info.name, info.role, msg.session);
            }
            None
        }
        MessageType::PeerLeft => {
            log::debug!("{} left {}", msg.peer_id, msg.session);
            None
        }
        _ => None,
    }
}
