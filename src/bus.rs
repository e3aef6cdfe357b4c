//! Message bus between the coordinator, replicas and requesters.
//!
//! Delivery is at-least-once: subscribers must treat a repeated event as a
//! no-op. [`LocalBus`] is the in-process implementation; a broker-backed bus
//! only has to implement [`MessageBus`].

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::checksum::Checksum;
use crate::ledger::{ReplicaId, StoreState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    /// Someone wants `path` preserved in `replicas`
    StoreRequested {
        path: PathBuf,
        checksum: Option<Checksum>,
        replicas: Vec<ReplicaId>,
        reply_to: Option<String>,
    },
    /// A replica durably holds the file and reports its digest
    ReplicaConfirmed {
        filename: String,
        replica: ReplicaId,
        checksum: Checksum,
    },
    /// A replica refused or lost the file
    ReplicaRejected {
        filename: String,
        replica: ReplicaId,
        reason: String,
    },
    /// Terminal state reached for one replica
    StoreOutcome {
        filename: String,
        replica: ReplicaId,
        state: StoreState,
    },
    /// Decision for a whole request, published once per reply marker
    StoreReply {
        filename: String,
        token: String,
        reply_to: Option<String>,
        failed: Vec<ReplicaId>,
    },
}

impl BusEvent {
    pub fn filename(&self) -> Option<&str> {
        match self {
            BusEvent::StoreRequested { .. } => None,
            BusEvent::ReplicaConfirmed { filename, .. }
            | BusEvent::ReplicaRejected { filename, .. }
            | BusEvent::StoreOutcome { filename, .. }
            | BusEvent::StoreReply { filename, .. } => Some(filename),
        }
    }
}

pub trait MessageBus: Send + Sync {
    fn publish(&self, event: BusEvent);

    fn subscribe(&self) -> Subscription;
}

/// Receiving end of a bus subscription
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<BusEvent>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<BusEvent>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BusEvent> {
        self.rx.try_recv().ok()
    }
}

/// In-process bus. Every subscriber gets every event published after it
/// subscribed; nothing is dropped.
#[derive(Debug, Default)]
pub struct LocalBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<BusEvent>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageBus for LocalBus {
    fn publish(&self, event: BusEvent) {
        tracing::trace!(?event, "publish");
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        Subscription::new(rx)
    }
}
