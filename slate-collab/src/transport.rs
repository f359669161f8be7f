//! Transport abstraction shared by the local broadcast, push and polling
//! channels.
//!
//! A transport is fire-and-forget on the way out and a stream of
//! [`Inbound`] items on the way in. The stream lives in a [`Subscription`],
//! which owns the background tasks feeding it and aborts them when dropped.

use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use slate_core::{BoardEvent, DocumentSnapshot, Provenance, ReplicaId};

use crate::protocol::RelayedEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    LocalBroadcast,
    Push,
    Polling,
}

impl TransportKind {
    pub fn provenance(self) -> Provenance {
        match self {
            TransportKind::LocalBroadcast => Provenance::LocalBroadcast,
            TransportKind::Push => Provenance::Push,
            TransportKind::Polling => Provenance::Polling,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::LocalBroadcast => f.write_str("local-broadcast"),
            TransportKind::Push => f.write_str("push"),
            TransportKind::Polling => f.write_str("polling"),
        }
    }
}

/// Problems worth telling the user about. Everything else is retried.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncFault {
    /// A clear was shown locally but the store never recorded it.
    ClearNotPersisted { reason: String },
}

impl fmt::Display for SyncFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncFault::ClearNotPersisted { reason } => {
                write!(f, "The board was cleared here but the clear could not be saved: {reason}")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum Inbound {
    Event {
        origin: ReplicaId,
        clock: u64,
        event: BoardEvent,
        via: Provenance,
    },
    Snapshot {
        snapshot: DocumentSnapshot,
        via: Provenance,
    },
    Fault(SyncFault),
}

impl Inbound {
    pub fn from_relayed(relayed: RelayedEvent, via: Provenance) -> Self {
        Inbound::Event {
            origin: relayed.origin,
            clock: relayed.clock,
            event: relayed.event,
            via,
        }
    }
}

/// Inbound stream of one transport.
pub struct Subscription {
    rx: mpsc::Receiver<Inbound>,
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<Inbound>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { rx, tasks }
    }

    /// A subscription that never yields anything.
    pub fn closed() -> Self {
        let (_, rx) = mpsc::channel(1);
        Self::new(rx, Vec::new())
    }

    /// Next inbound item; `None` once every feeding task has stopped.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Inbound> {
        self.rx.try_recv().ok()
    }

    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|t| t.is_finished())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// One way of exchanging board events with other replicas.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Hand an event to the transport. Never blocks; failures are logged
    /// and retried (or reported as [`Inbound::Fault`]) by the transport.
    fn publish(&self, event: RelayedEvent);

    /// Start receiving. Background work stops when the returned
    /// subscription is dropped.
    fn subscribe(&self) -> Subscription;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_dropping_subscription_aborts_tasks() {
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(async move {
            loop {
                if tx.send(Inbound::Fault(SyncFault::ClearNotPersisted { reason: "x".into() })).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        let abort = task.abort_handle();
        let mut sub = Subscription::new(rx, vec![task]);
        assert!(sub.recv().await.is_some());

        drop(sub);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(abort.is_finished());
    }

    #[tokio::test]
    async fn test_closed_subscription_yields_nothing() {
        let mut sub = Subscription::closed();
        assert!(sub.recv().await.is_none());
        assert!(sub.try_recv().is_none());
        assert!(sub.is_finished());
    }

    #[test]
    fn test_kind_maps_to_provenance() {
        assert_eq!(TransportKind::Push.provenance(), Provenance::Push);
        assert_eq!(TransportKind::Polling.to_string(), "polling");
    }
}
