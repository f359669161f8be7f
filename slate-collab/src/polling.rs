//! Snapshot polling transport, used when the relay stream is unavailable.
//!
//! Every `interval` the full snapshot is fetched and handed over unless its
//! revision did not move. Publishes are posted one at a time, in order.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use slate_core::{BoardEvent, DocumentSnapshot, Provenance, ReplicaId};

use crate::protocol::{ProtocolError, RelayedEvent};
use crate::transport::{Inbound, Subscription, SyncFault, Transport, TransportKind};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Request/response half of the relay contract.
pub trait RelayApi: Send + Sync + 'static {
    fn fetch_snapshot(
        &self,
        session: &str,
    ) -> impl Future<Output = Result<DocumentSnapshot, ProtocolError>> + Send;

    fn post_event(
        &self,
        session: &str,
        event: &RelayedEvent,
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send;
}

/// `RelayApi` over the relay's HTTP endpoints.
#[derive(Clone)]
pub struct HttpRelay {
    client: reqwest::Client,
    base: String,
}

impl HttpRelay {
    /// `base` is e.g. `http://127.0.0.1:9091`.
    pub fn new(base: impl Into<String>) -> Result<Self, ProtocolError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProtocolError::Http(e.to_string()))?;
        Ok(Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, session: &str, leaf: &str) -> String {
        format!("{}/sessions/{}/{}", self.base, session, leaf)
    }
}

impl RelayApi for HttpRelay {
    async fn fetch_snapshot(&self, session: &str) -> Result<DocumentSnapshot, ProtocolError> {
        let response = self
            .client
            .get(self.url(session, "snapshot"))
            .send()
            .await
            .map_err(|e| ProtocolError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProtocolError::Http(format!(
                "snapshot fetch failed with status: {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    async fn post_event(&self, session: &str, event: &RelayedEvent) -> Result<(), ProtocolError> {
        let response = self
            .client
            .post(self.url(session, "events"))
            .json(event)
            .send()
            .await
            .map_err(|e| ProtocolError::Http(e.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            let body = response.text().await.unwrap_or_default();
            return Err(ProtocolError::Rejected(body));
        }
        if !status.is_success() {
            return Err(ProtocolError::Http(format!("event post failed with status: {status}")));
        }
        Ok(())
    }
}

pub struct PollingTransport<A: RelayApi> {
    api: Arc<A>,
    session: String,
    me: ReplicaId,
    interval: Duration,
    outgoing_tx: mpsc::UnboundedSender<RelayedEvent>,
    /// Taken by the first `subscribe`.
    outgoing_rx: Mutex<Option<mpsc::UnboundedReceiver<RelayedEvent>>>,
}

impl<A: RelayApi> PollingTransport<A> {
    pub fn new(api: Arc<A>, session: impl Into<String>, me: ReplicaId, interval: Duration) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        Self {
            api,
            session: session.into(),
            me,
            interval,
            outgoing_tx,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl<A: RelayApi> Transport for PollingTransport<A> {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    fn publish(&self, event: RelayedEvent) {
        if self.outgoing_tx.send(event).is_err() {
            log::debug!("Polling transport stopped; event dropped");
        }
    }

    fn subscribe(&self) -> Subscription {
        let outgoing = self.outgoing_rx.lock().ok().and_then(|mut slot| slot.take());
        let Some(outgoing) = outgoing else {
            log::warn!("Polling transport for {} already subscribed", self.session);
            return Subscription::closed();
        };
        let (tx, rx) = mpsc::channel(64);
        let poller = tokio::spawn(poll_snapshots(
            self.api.clone(),
            self.session.clone(),
            self.interval,
            tx.clone(),
        ));
        let poster = tokio::spawn(post_events(self.api.clone(), self.session.clone(), self.me, outgoing, tx));
        Subscription::new(rx, vec![poller, poster])
    }
}

async fn poll_snapshots<A: RelayApi>(
    api: Arc<A>,
    session: String,
    interval: Duration,
    inbound: mpsc::Sender<Inbound>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_revision = None;

    loop {
        ticker.tick().await;
        match api.fetch_snapshot(&session).await {
            Ok(snapshot) => {
                if last_revision == Some(snapshot.revision) {
                    continue;
                }
                last_revision = Some(snapshot.revision);
                log::trace!("Polled {session} at revision {}", snapshot.revision);
                let item = Inbound::Snapshot {
                    snapshot,
                    via: Provenance::Polling,
                };
                if inbound.send(item).await.is_err() {
                    break;
                }
            }
            Err(e) => log::warn!("Snapshot poll for {session} failed: {e}"),
        }
    }
}

async fn post_events<A: RelayApi>(
    api: Arc<A>,
    session: String,
    me: ReplicaId,
    mut outgoing: mpsc::UnboundedReceiver<RelayedEvent>,
    inbound: mpsc::Sender<Inbound>,
) {
    while let Some(event) = outgoing.recv().await {
        debug_assert_eq!(event.origin, me);
        let Err(e) = api.post_event(&session, &event).await else {
            continue;
        };
        log::warn!("Posting {} for {session} failed: {e}", event.event.name());
        if event.event == BoardEvent::Clear {
            let fault = SyncFault::ClearNotPersisted { reason: e.to_string() };
            if inbound.send(Inbound::Fault(fault)).await.is_err() {
                break;
            }
        }
    }
}
