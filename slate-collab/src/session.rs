//! Session driver: one document controller wired to the local broadcast
//! and at most one remote transport (push or polling).
//!
//! The controller stays single-threaded. Transports feed it through
//! channels drained by [`SyncSession::next_update`]; user commands publish
//! without waiting on the network.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior};

use slate_core::{
    BoardEvent, Color, DocumentController, MergeOutcome, Notification, PageError, PageRasterizer,
    PermissionSource, Point, Provenance, RenderPass, ReplicaId, RendererConfig, Role, Tool,
};

use crate::coalesce::{AppendCoalescer, DEFAULT_COALESCE_INTERVAL};
use crate::local::{LocalBroadcast, LocalHub};
use crate::polling::{HttpRelay, PollingTransport, DEFAULT_POLL_INTERVAL};
use crate::probe::{probe_stream, RemoteMode};
use crate::protocol::{PeerInfo, ProtocolError, RelayedEvent};
use crate::push::{PushConfig, PushTransport};
use crate::transport::{Inbound, Subscription, SyncFault, Transport, TransportKind};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Identifies the shared board (e.g. a lesson id)
    pub session_key: String,
    pub display_name: String,
    pub role: Role,
    pub remote: RemoteMode,
    /// Relay stream, `ws://host:port`
    pub push_url: String,
    /// Relay HTTP API, `http://host:port`
    pub relay_url: String,
    pub poll_interval: Duration,
    pub coalesce_interval: Duration,
    pub probe_timeout: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    /// Events kept for replay while the stream is down
    pub outbox_capacity: usize,
    /// How many recent `(origin, clock)` pairs are remembered
    pub dedup_window: usize,
    pub renderer: RendererConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let push = PushConfig::default();
        Self {
            session_key: "default".to_string(),
            display_name: "Anonymous".to_string(),
            role: Role::Student,
            remote: RemoteMode::Auto,
            push_url: push.url,
            relay_url: "http://127.0.0.1:9091".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            coalesce_interval: DEFAULT_COALESCE_INTERVAL,
            probe_timeout: Duration::from_secs(2),
            reconnect_min: push.reconnect_min,
            reconnect_max: push.reconnect_max,
            outbox_capacity: push.outbox_capacity,
            dedup_window: 4096,
            renderer: RendererConfig::default(),
        }
    }
}

impl SessionConfig {
    fn push_config(&self) -> PushConfig {
        PushConfig {
            url: self.push_url.clone(),
            reconnect_min: self.reconnect_min,
            reconnect_max: self.reconnect_max,
            outbox_capacity: self.outbox_capacity,
        }
    }
}

/// What one pass of the driver did.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// An inbound event or snapshot went through reconciliation.
    Merged {
        outcome: MergeOutcome,
        via: Provenance,
    },
    /// Coalesced appends were sent.
    Flushed(usize),
    Fault(SyncFault),
}

/// Recently seen `(origin, clock)` pairs, oldest evicted first.
struct SeenWindow {
    set: HashSet<(ReplicaId, u64)>,
    order: VecDeque<(ReplicaId, u64)>,
    capacity: usize,
}

impl SeenWindow {
    fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns `false` if the pair was already present.
    fn insert(&mut self, key: (ReplicaId, u64)) -> bool {
        if !self.set.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

pub struct SyncSession {
    controller: DocumentController,
    peer: PeerInfo,
    session_key: String,
    clock: u64,
    local: LocalBroadcast,
    local_sub: Option<Subscription>,
    remote: Option<Box<dyn Transport>>,
    remote_sub: Option<Subscription>,
    coalescer: AppendCoalescer,
    seen: SeenWindow,
    tick: Interval,
}

impl SyncSession {
    /// Join the session: local broadcast always, plus the remote transport
    /// chosen by `config.remote`.
    pub async fn join(
        config: SessionConfig,
        hub: &LocalHub,
        permissions: impl PermissionSource + Send + 'static,
    ) -> Result<Self, ProtocolError> {
        let peer = PeerInfo::new(config.display_name.clone(), config.role);
        let local = hub.join(&config.session_key, peer.clone()).await;

        let use_push = match config.remote {
            RemoteMode::Offline => None,
            RemoteMode::Push => Some(true),
            RemoteMode::Polling => Some(false),
            RemoteMode::Auto => Some(probe_stream(&config.push_url, config.probe_timeout).await),
        };
        let remote: Option<Box<dyn Transport>> = match use_push {
            None => None,
            Some(true) => Some(Box::new(PushTransport::new(
                config.push_config(),
                config.session_key.clone(),
                peer.clone(),
            ))),
            Some(false) => Some(Box::new(PollingTransport::new(
                Arc::new(HttpRelay::new(config.relay_url.clone())?),
                config.session_key.clone(),
                peer.replica_id,
                config.poll_interval,
            ))),
        };
        if let Some(remote) = &remote {
            log::info!(
                "{} joined {} via {}",
                peer.name,
                config.session_key,
                remote.kind()
            );
        }

        Ok(Self::with_transports(&config, peer, local, remote, permissions))
    }

    /// Assemble a session from already built transports.
    pub fn with_transports(
        config: &SessionConfig,
        peer: PeerInfo,
        local: LocalBroadcast,
        remote: Option<Box<dyn Transport>>,
        permissions: impl PermissionSource + Send + 'static,
    ) -> Self {
        let controller = DocumentController::new(
            peer.replica_id,
            peer.role,
            permissions,
            config.renderer.clone(),
        );
        let local_sub = Some(local.subscribe());
        let remote_sub = remote.as_ref().map(|r| r.subscribe());

        let mut tick = tokio::time::interval(config.coalesce_interval.max(Duration::from_millis(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            controller,
            peer,
            session_key: config.session_key.clone(),
            clock: 0,
            local,
            local_sub,
            remote,
            remote_sub,
            coalescer: AppendCoalescer::new(config.coalesce_interval),
            seen: SeenWindow::new(config.dedup_window),
            tick,
        }
    }

    pub fn id(&self) -> ReplicaId {
        self.peer.replica_id
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn remote_kind(&self) -> Option<TransportKind> {
        self.remote.as_ref().map(|r| r.kind())
    }

    pub fn controller(&self) -> &DocumentController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut DocumentController {
        &mut self.controller
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        self.controller.drain_notifications()
    }

    pub fn render(&mut self) -> RenderPass {
        self.controller.render()
    }

    // ───────────────────────────────────────────────────────────
    // Commands
    // ───────────────────────────────────────────────────────────

    pub fn pointer_down(&mut self, point: Point) {
        let events = self.controller.pointer_down(point);
        self.publish(events);
    }

    pub fn pointer_move(&mut self, point: Point) {
        let events = self.controller.pointer_move(point);
        self.publish(events);
    }

    pub fn pointer_up(&mut self) {
        let events = self.controller.pointer_up();
        self.publish(events);
    }

    pub fn pointer_leave(&mut self) {
        let events = self.controller.pointer_leave();
        self.publish(events);
    }

    pub fn undo(&mut self) {
        let events = self.controller.undo();
        self.publish(events);
    }

    pub fn redo(&mut self) {
        let events = self.controller.redo();
        self.publish(events);
    }

    pub fn clear(&mut self) {
        let events = self.controller.clear();
        self.publish(events);
    }

    pub fn set_page(&mut self, page: u32) {
        let events = self.controller.set_page(page);
        self.publish(events);
    }

    pub fn set_tool(&mut self, tool: Tool) {
        let events = self.controller.set_tool(tool);
        self.publish(events);
    }

    pub fn set_color(&mut self, color: Color) {
        let events = self.controller.set_color(color);
        self.publish(events);
    }

    pub fn set_width(&mut self, width: f32) {
        let events = self.controller.set_width(width);
        self.publish(events);
    }

    pub fn attach_file(
        &mut self,
        name: &str,
        locator: &str,
        bytes: &[u8],
        rasterizer: &mut dyn PageRasterizer,
    ) -> Result<(), PageError> {
        let events = self.controller.attach_file(name, locator, bytes, rasterizer)?;
        self.publish(events);
        Ok(())
    }

    /// Send every held append now.
    pub fn flush(&mut self) -> usize {
        let held = self.coalescer.flush();
        let sent = held.len();
        for event in held {
            self.send(event);
        }
        sent
    }

    fn publish(&mut self, events: Vec<BoardEvent>) {
        for event in events {
            for ready in self.coalescer.push(event) {
                self.send(ready);
            }
        }
    }

    fn send(&mut self, event: BoardEvent) {
        self.clock += 1;
        let relayed = RelayedEvent::new(self.peer.replica_id, self.clock, event);
        self.seen.insert(relayed.key());
        log::trace!("Publishing {} #{}", relayed.event.name(), relayed.clock);
        if let Some(remote) = &self.remote {
            remote.publish(relayed.clone());
        }
        self.local.publish(relayed);
    }

    // ───────────────────────────────────────────────────────────
    // Inbound
    // ───────────────────────────────────────────────────────────

    /// Wait for the next thing worth reporting: a merge, a flush of held
    /// appends or a fault. Duplicates and no-op ticks are absorbed.
    pub async fn next_update(&mut self) -> SessionUpdate {
        loop {
            let item = tokio::select! {
                item = next_inbound(&mut self.local_sub) => item,
                item = next_inbound(&mut self.remote_sub) => item,
                _ = self.tick.tick() => {
                    let ready = self.coalescer.poll();
                    let sent = ready.len();
                    for event in ready {
                        self.send(event);
                    }
                    if sent > 0 {
                        return SessionUpdate::Flushed(sent);
                    }
                    continue;
                }
            };
            if let Some(update) = self.handle_inbound(item) {
                return update;
            }
        }
    }

    /// Apply whatever is already queued without waiting.
    pub fn process_available(&mut self) -> Vec<SessionUpdate> {
        let mut items = Vec::new();
        for sub in [&mut self.local_sub, &mut self.remote_sub].into_iter().flatten() {
            while let Some(item) = sub.try_recv() {
                items.push(item);
            }
        }
        items
            .into_iter()
            .filter_map(|item| self.handle_inbound(item))
            .collect()
    }

    fn handle_inbound(&mut self, item: Inbound) -> Option<SessionUpdate> {
        match item {
            Inbound::Event {
                origin,
                clock,
                event,
                via,
            } => {
                if origin == self.peer.replica_id {
                    return None;
                }
                if !self.seen.insert((origin, clock)) && !upgrades_provenance(&event, via) {
                    log::trace!("Duplicate {} #{clock} from {origin} via {via:?}", event.name());
                    return None;
                }
                match self.controller.apply_event(origin, event, via) {
                    Ok(outcome) => Some(SessionUpdate::Merged { outcome, via }),
                    Err(e) => {
                        log::warn!("Discarding event #{clock} from {origin}: {e}");
                        None
                    }
                }
            }
            Inbound::Snapshot { snapshot, via } => {
                let outcome = self.controller.apply_snapshot(snapshot);
                Some(SessionUpdate::Merged { outcome, via })
            }
            Inbound::Fault(fault) => {
                log::warn!("{fault}");
                self.controller.report_fault(fault.to_string());
                Some(SessionUpdate::Fault(fault))
            }
        }
    }

    /// Flush, stop every transport task and leave the local session.
    pub async fn leave(mut self) {
        self.flush();
        self.local_sub = None;
        self.remote_sub = None;
        self.local.leave().await;
        log::info!("{} left {}", self.peer.name, self.session_key);
    }
}

/// A repeat delivery over the relay stream still confirms a stroke first
/// seen over the local broadcast.
fn upgrades_provenance(event: &BoardEvent, via: Provenance) -> bool {
    via == Provenance::Push
        && matches!(
            event,
            BoardEvent::StrokeBegin { .. } | BoardEvent::StrokeAppend { .. } | BoardEvent::Redo { .. }
        )
}

/// Next item from an optional subscription; pends forever once it is gone.
async fn next_inbound(sub: &mut Option<Subscription>) -> Inbound {
    if let Some(s) = sub {
        if let Some(item) = s.recv().await {
            return item;
        }
        log::debug!("Transport subscription ended");
        *sub = None;
    }
    std::future::pending().await
}
