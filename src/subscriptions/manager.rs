//! Subscription manager for fanning feed entries out to subscribers.

use crate::types::FeedEntry;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::types::{
    DropReason, FeedEvent, SharedState, Subscription, SubscriptionConfig, SubscriptionId,
    SubscriptionState,
};

/// Internal subscription state.
struct Subscriber {
    config: SubscriptionConfig,
    sender: Sender<FeedEvent>,
    state: Arc<SharedState>,
}

impl Subscriber {
    /// Try to send an event. Returns false if the subscriber should be removed.
    fn try_send(&self, event: FeedEvent) -> bool {
        self.sender.try_send(event).is_ok()
    }

    fn over_limit(&self) -> bool {
        match self.config.max_pending {
            Some(max) => self.sender.len() >= max,
            None => false,
        }
    }
}

/// A subscription created but not yet registered for live delivery.
///
/// The feed's sequencer replays the snapshot into it and then calls
/// [`SubscriptionManager::activate`], so no entry is missed or repeated.
pub(crate) struct PendingSubscriber {
    pub(crate) id: SubscriptionId,
    config: SubscriptionConfig,
    sender: Sender<FeedEvent>,
    state: Arc<SharedState>,
}

impl PendingSubscriber {
    /// Queue a replayed entry. Returns false if the receiver is gone.
    pub(crate) fn replay(&self, entry: FeedEntry) -> bool {
        self.sender.send(FeedEvent::Message { entry }).is_ok()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Reject the subscription before it goes live.
    pub(crate) fn reject(self, reason: DropReason) {
        let _ = self.sender.send(FeedEvent::Dropped { reason });
    }
}

/// Manages subscriptions and broadcasts entries.
///
/// Only the feed's sequencer broadcasts, so every subscriber receives entries
/// in the same total order.
pub struct SubscriptionManager {
    /// Live subscriptions by ID.
    subscriptions: RwLock<BTreeMap<SubscriptionId, Subscriber>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
}

impl SubscriptionManager {
    /// Create a new subscription manager.
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a subscription in the `Replaying` state.
    ///
    /// Returns the consumer-side handle and the pending registration that the
    /// sequencer completes.
    pub(crate) fn create(
        self: &Arc<Self>,
        config: SubscriptionConfig,
    ) -> (Subscription, PendingSubscriber) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = unbounded();
        let state = SharedState::new(SubscriptionState::Replaying);

        let pending = PendingSubscriber {
            id,
            config,
            sender,
            state: Arc::clone(&state),
        };
        let subscription = Subscription::new(id, receiver, state, Arc::downgrade(self));

        (subscription, pending)
    }

    /// Finish replay and start live delivery.
    ///
    /// Returns false if the subscription was closed while replaying.
    pub(crate) fn activate(&self, pending: PendingSubscriber) -> bool {
        let mut subs = self.subscriptions.write();
        if pending.state.is_closed() {
            debug!(id = pending.id.0, "subscription closed before going live");
            return false;
        }
        if pending.sender.send(FeedEvent::CaughtUp).is_err() {
            return false;
        }
        subs.insert(
            pending.id,
            Subscriber {
                config: pending.config,
                sender: pending.sender,
                state: pending.state,
            },
        );
        true
    }

    /// Unsubscribe and clean up. Unknown or already closed IDs are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let removed = self.subscriptions.write().remove(&id);
        if let Some(sub) = removed {
            sub.state.close();
            debug!(id = id.0, "unsubscribed");
        }
    }

    /// Drop every subscription with the given reason.
    pub fn terminate_all(&self, reason: DropReason) {
        let drained: Vec<_> = std::mem::take(&mut *self.subscriptions.write())
            .into_iter()
            .collect();
        if drained.is_empty() {
            return;
        }

        debug!(count = drained.len(), ?reason, "terminating subscriptions");
        for (_, sub) in drained {
            let _ = sub.sender.try_send(FeedEvent::Dropped {
                reason: reason.clone(),
            });
        }
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Broadcast a newly appended entry to every live subscription.
    pub fn broadcast(&self, entry: &FeedEntry) {
        let mut to_remove = Vec::new();

        {
            let subs = self.subscriptions.read();
            for (id, sub) in subs.iter() {
                if sub.state.is_closed() {
                    to_remove.push((*id, None));
                } else if sub.over_limit() {
                    to_remove.push((*id, Some(DropReason::BufferOverflow)));
                } else if !sub.try_send(FeedEvent::Message {
                    entry: entry.clone(),
                }) {
                    // Receiver dropped
                    to_remove.push((*id, None));
                }
            }
        }

        if !to_remove.is_empty() {
            let mut subs = self.subscriptions.write();
            for (id, reason) in to_remove {
                if let Some(sub) = subs.remove(&id) {
                    if let Some(reason) = reason {
                        warn!(id = id.0, ?reason, "dropping subscriber");
                        let _ = sub.sender.try_send(FeedEvent::Dropped { reason });
                    }
                }
            }
        }
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}
