//! Subscription types for live feed updates.

use crate::types::{FeedEntry, SequenceKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::manager::SubscriptionManager;

/// Configuration for a subscription.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionConfig {
    /// Max undelivered live events before the subscriber is dropped.
    /// Default: None (unbounded, no backpressure)
    pub max_pending: Option<usize>,
}

impl SubscriptionConfig {
    /// Drop the subscriber once more than `max_pending` live events queue up.
    pub fn bounded(max_pending: usize) -> Self {
        Self {
            max_pending: Some(max_pending),
        }
    }
}

/// Events emitted to a subscription, in delivery order.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    /// A feed entry, either replayed from the snapshot or appended live.
    Message { entry: FeedEntry },

    /// Finished replaying the snapshot, now streaming live.
    CaughtUp,

    /// Subscription ended by the feed. Always the last event.
    Dropped { reason: DropReason },
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Explicitly unsubscribed.
    Unsubscribed,
    /// Too many undelivered events (slow consumer).
    BufferOverflow,
    /// The backing connection was closed or lost.
    ConnectionLost,
    /// The feed itself shut down.
    FeedClosed,
    /// Internal error.
    Error(String),
}

impl DropReason {
    /// Whether the subscriber should be told about this through its error callback.
    pub fn is_error(&self) -> bool {
        !matches!(self, DropReason::Unsubscribed | DropReason::FeedClosed)
    }
}

/// Lifecycle of a single subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Replaying,
    Live,
    Closed,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// State shared between a subscription handle and the manager.
#[derive(Debug)]
pub(crate) struct SharedState(Mutex<SubscriptionState>);

impl SharedState {
    pub(crate) fn new(state: SubscriptionState) -> Arc<Self> {
        Arc::new(Self(Mutex::new(state)))
    }

    pub(crate) fn get(&self) -> SubscriptionState {
        *self.0.lock()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.get() == SubscriptionState::Closed
    }

    /// Move to `next` unless already closed. Returns the resulting state.
    pub(crate) fn advance(&self, next: SubscriptionState) -> SubscriptionState {
        let mut state = self.0.lock();
        if *state != SubscriptionState::Closed {
            *state = next;
        }
        *state
    }

    pub(crate) fn close(&self) -> bool {
        let mut state = self.0.lock();
        let was_open = *state != SubscriptionState::Closed;
        *state = SubscriptionState::Closed;
        was_open
    }
}

/// Channel-based handle to a subscription.
///
/// Yields the replayed snapshot, then `CaughtUp`, then live entries. The
/// state moves `Replaying -> Live -> Closed` as events are consumed. Once the
/// subscription is closed, no further events are returned even if some were
/// still queued.
pub struct Subscription {
    pub id: SubscriptionId,
    pub(crate) receiver: crossbeam_channel::Receiver<FeedEvent>,
    pub(crate) state: Arc<SharedState>,
    pub(crate) manager: Weak<SubscriptionManager>,
    /// Highest key seen so far, used to assert ordering in debug builds.
    last_key: Mutex<Option<SequenceKey>>,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        receiver: crossbeam_channel::Receiver<FeedEvent>,
        state: Arc<SharedState>,
        manager: Weak<SubscriptionManager>,
    ) -> Self {
        Self {
            id,
            receiver,
            state,
            manager,
            last_key: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        self.state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<FeedEvent, crossbeam_channel::RecvError> {
        if self.is_closed() {
            return Err(crossbeam_channel::RecvError);
        }
        let event = self.receiver.recv()?;
        self.observe(event).ok_or(crossbeam_channel::RecvError)
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<FeedEvent, crossbeam_channel::TryRecvError> {
        if self.is_closed() {
            return Err(crossbeam_channel::TryRecvError::Disconnected);
        }
        let event = self.receiver.try_recv()?;
        self.observe(event)
            .ok_or(crossbeam_channel::TryRecvError::Disconnected)
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<FeedEvent, crossbeam_channel::RecvTimeoutError> {
        if self.is_closed() {
            return Err(crossbeam_channel::RecvTimeoutError::Disconnected);
        }
        let event = self.receiver.recv_timeout(timeout)?;
        self.observe(event)
            .ok_or(crossbeam_channel::RecvTimeoutError::Disconnected)
    }

    /// Stop receiving events. Idempotent.
    pub fn unsubscribe(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.unsubscribe(self.id);
        }
        self.state.close();
    }

    /// Apply a received event to the state machine. Returns None if the
    /// subscription was closed while the event was in flight.
    fn observe(&self, event: FeedEvent) -> Option<FeedEvent> {
        match &event {
            FeedEvent::Message { entry } => {
                if self.is_closed() {
                    return None;
                }
                let mut last = self.last_key.lock();
                debug_assert!(last.map_or(true, |k| k < entry.key), "out of order delivery");
                *last = Some(entry.key);
            }
            FeedEvent::CaughtUp => {
                if self.state.advance(SubscriptionState::Live) == SubscriptionState::Closed {
                    return None;
                }
            }
            FeedEvent::Dropped { .. } => {
                if !self.state.close() {
                    return None;
                }
            }
        }
        Some(event)
    }
}

/// Handle to a callback-driven subscription.
///
/// Dropping the handle does not unsubscribe; the listener stays attached
/// until `unsubscribe` is called or the feed ends the subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub(crate) subscription: Arc<Subscription>,
    pub(crate) worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl SubscriptionHandle {
    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        self.subscription.state()
    }

    pub fn is_closed(&self) -> bool {
        self.subscription.is_closed()
    }

    /// Stop delivery. Idempotent. A callback already running may finish.
    pub fn unsubscribe(&self) {
        self.subscription.unsubscribe();
    }

    /// Wait for the delivery thread to exit. Must not be called from inside
    /// one of this subscription's own callbacks.
    pub fn join(&self) {
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
