//! Subscriber registry and notification fan-out.
//!
//! Consumers subscribe for refresh outcomes and receive at most one event
//! per cycle: a published snapshot on success or partial success, a failure
//! notice on a hard-failed cycle. Delivery order across subscribers is
//! unspecified.

use crate::coordinator::CycleError;
use crate::snapshot::Snapshot;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Opaque handle identifying one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(Uuid);

/// Event delivered to subscribers, at most once per refresh cycle.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A new snapshot was published (success or partial success)
    SnapshotPublished(Arc<Snapshot>),
    /// The cycle hard-failed; the previously published snapshot stands
    RefreshFailed(CycleError),
}

/// Tracks interested consumers and fans events out to them.
pub struct SubscriptionRegistry {
    subscribers: DashMap<SubscriptionHandle, mpsc::UnboundedSender<SyncEvent>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
        }
    }

    /// Register a subscriber; events arrive on the returned receiver.
    pub fn subscribe(&self) -> (SubscriptionHandle, mpsc::UnboundedReceiver<SyncEvent>) {
        let handle = SubscriptionHandle(Uuid::new_v4());
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(handle, tx);
        debug!(subscribers = self.subscribers.len(), "Subscriber added");
        (handle, rx)
    }

    /// Remove a subscriber. Returns false for an unknown handle.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.subscribers.remove(&handle).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Deliver one event to every current subscriber.
    ///
    /// Subscribers whose receiver has been dropped are pruned.
    pub fn notify(&self, event: &SyncEvent) {
        let mut dropped = Vec::new();
        for entry in self.subscribers.iter() {
            if entry.value().send(event.clone()).is_err() {
                dropped.push(*entry.key());
            }
        }
        for handle in dropped {
            self.subscribers.remove(&handle);
            debug!("Pruned disconnected subscriber");
        }
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
