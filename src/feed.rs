//! Main Feed struct tying storage, sequencing and subscriptions together.

use crate::connection::{CloseListenerId, Connection};
use crate::error::{FeedError, Result};
use crate::storage::FeedStorage;
use crate::subscriptions::{
    DropReason, FeedEvent, PendingSubscriber, Subscription, SubscriptionConfig,
    SubscriptionHandle, SubscriptionManager,
};
use crate::types::{FeedEntry, FeedStats, Message, SequenceKey, Timestamp};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How many entries the feed keeps available for replay.
///
/// Retention only bounds the replay window. Stored entries are never
/// rewritten and keys are never reused.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Retention {
    /// Replay everything ever appended.
    #[default]
    Unbounded,
    /// Replay at most the newest N entries.
    MaxEntries(usize),
    /// Replay entries created within the given age. Evicts from the oldest
    /// key forward, stopping at the first entry still inside the window.
    MaxAge(Duration),
}

/// Feed configuration.
#[derive(Clone, Debug, Default)]
pub struct FeedConfig {
    pub retention: Retention,
}

/// Requests handled by the sequencer thread, in arrival order.
enum Command {
    Append {
        message: Message,
        reply: Sender<Result<SequenceKey>>,
    },
    Subscribe {
        pending: PendingSubscriber,
    },
    Sync {
        reply: Sender<Result<()>>,
    },
    Disconnect,
    Shutdown,
}

/// Entries visible to readers. Written only by the sequencer.
#[derive(Default)]
struct FeedState {
    entries: VecDeque<FeedEntry>,
    total_appended: u64,
    last_key: Option<SequenceKey>,
}

impl FeedState {
    fn apply_retention(&mut self, retention: &Retention) {
        match retention {
            Retention::Unbounded => {}
            Retention::MaxEntries(max) => {
                while self.entries.len() > *max {
                    self.entries.pop_front();
                }
            }
            Retention::MaxAge(age) => {
                let age = i64::try_from(age.as_millis()).unwrap_or(i64::MAX);
                let cutoff = Timestamp::now().as_millis().saturating_sub(age);
                while self
                    .entries
                    .front()
                    .map_or(false, |e| e.message.created_at.as_millis() < cutoff)
                {
                    self.entries.pop_front();
                }
            }
        }
    }
}

/// The single authority that assigns sequence keys.
///
/// Appends, snapshot replays and broadcasts all run on this thread, so every
/// subscriber sees one gap-free, duplicate-free order.
struct Sequencer {
    storage: Box<dyn FeedStorage>,
    state: Arc<RwLock<FeedState>>,
    subscriptions: Arc<SubscriptionManager>,
    retention: Retention,
    next_key: SequenceKey,
    connected: bool,
}

impl Sequencer {
    fn run(mut self, commands: Receiver<Command>) {
        for command in commands.iter() {
            match command {
                Command::Append { message, reply } => {
                    let _ = reply.send(self.append(message));
                }
                Command::Subscribe { pending } => self.subscribe(pending),
                Command::Sync { reply } => {
                    let _ = reply.send(self.storage.sync());
                }
                Command::Disconnect => {
                    self.connected = false;
                    self.subscriptions.terminate_all(DropReason::ConnectionLost);
                }
                Command::Shutdown => break,
            }
        }

        if let Err(e) = self.storage.sync() {
            warn!(error = %e, "failed to sync feed storage on shutdown");
        }
        self.subscriptions.terminate_all(DropReason::FeedClosed);
        debug!("sequencer stopped");
    }

    fn append(&mut self, message: Message) -> Result<SequenceKey> {
        if !self.connected {
            return Err(FeedError::BackendUnavailable("connection closed".into()));
        }

        let key = self.next_key;
        let next_key = key
            .next()
            .ok_or_else(|| FeedError::BackendUnavailable("sequence keys exhausted".into()))?;
        let entry = FeedEntry::new(key, message);

        self.storage
            .append(&entry)
            .map_err(|e| FeedError::BackendUnavailable(e.to_string()))?;
        self.next_key = next_key;

        {
            let mut state = self.state.write();
            state.entries.push_back(entry.clone());
            state.total_appended += 1;
            state.last_key = Some(key);
            state.apply_retention(&self.retention);
        }

        self.subscriptions.broadcast(&entry);
        debug!(key = key.0, author = %entry.message.author, "appended");

        Ok(key)
    }

    fn subscribe(&mut self, pending: PendingSubscriber) {
        if !self.connected {
            pending.reject(DropReason::ConnectionLost);
            return;
        }

        let id = pending.id;
        self.state.write().apply_retention(&self.retention);

        // Only this thread writes the state, so it cannot change during replay
        let state = self.state.read();
        let mut replayed = 0usize;
        for entry in state.entries.iter() {
            if pending.is_closed() || !pending.replay(entry.clone()) {
                debug!(id = id.0, "subscriber went away during replay");
                return;
            }
            replayed += 1;
        }
        drop(state);

        if self.subscriptions.activate(pending) {
            debug!(id = id.0, replayed, "subscription live");
        }
    }
}

/// An append outstanding at the sequencer.
///
/// The result is reported once; later calls after it was taken return
/// `BackendUnavailable`.
#[must_use = "an append reports its key or failure through this handle"]
pub struct PendingAppend {
    receiver: Receiver<Result<SequenceKey>>,
}

impl PendingAppend {
    fn stopped() -> FeedError {
        FeedError::BackendUnavailable("feed sequencer stopped".into())
    }

    /// Block until the key is assigned.
    pub fn wait(self) -> Result<SequenceKey> {
        self.receiver.recv().map_err(|_| Self::stopped())?
    }

    /// Wait up to `timeout`. Returns None if the append is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<SequenceKey>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => None,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Some(Err(Self::stopped())),
        }
    }

    /// Check without blocking. Returns None if the append is still pending.
    pub fn try_result(&self) -> Option<Result<SequenceKey>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(crossbeam_channel::TryRecvError::Empty) => None,
            Err(crossbeam_channel::TryRecvError::Disconnected) => Some(Err(Self::stopped())),
        }
    }
}

/// An append-only, totally ordered message feed with live subscriptions.
///
/// Provides a unified interface for:
/// - Appending messages (keys assigned by a single sequencer thread)
/// - Subscribing with snapshot replay followed by live delivery
/// - Reading the retained entries
pub struct Feed {
    connection: Arc<Connection>,
    commands: Sender<Command>,
    state: Arc<RwLock<FeedState>>,
    subscriptions: Arc<SubscriptionManager>,
    worker: Mutex<Option<JoinHandle<()>>>,
    close_listener: CloseListenerId,
}

impl Feed {
    /// Open the feed on a connection and start its sequencer.
    pub fn open(connection: Arc<Connection>, config: FeedConfig) -> Result<Self> {
        let mut storage = connection.attach_feed()?;

        let entries = match storage.load() {
            Ok(entries) => entries,
            Err(e) => {
                connection.detach_feed();
                return Err(e);
            }
        };

        let next_key = match entries.last() {
            Some(last) => match last.key.next() {
                Some(key) => key,
                None => {
                    connection.detach_feed();
                    return Err(FeedError::Corruption(format!(
                        "Stored key {} leaves no room for new entries",
                        last.key
                    )));
                }
            },
            None => SequenceKey::FIRST,
        };

        let mut state = FeedState {
            total_appended: entries.len() as u64,
            last_key: entries.last().map(|e| e.key),
            entries: entries.into(),
        };
        state.apply_retention(&config.retention);

        let state = Arc::new(RwLock::new(state));
        let subscriptions = Arc::new(SubscriptionManager::new());
        let (commands, receiver) = unbounded();

        let sequencer = Sequencer {
            storage,
            state: Arc::clone(&state),
            subscriptions: Arc::clone(&subscriptions),
            retention: config.retention,
            next_key,
            connected: true,
        };

        let worker = match thread::Builder::new()
            .name("hail-feed-sequencer".into())
            .spawn(move || sequencer.run(receiver))
        {
            Ok(worker) => worker,
            Err(e) => {
                connection.detach_feed();
                return Err(e.into());
            }
        };

        let disconnect = commands.clone();
        let close_listener = connection.on_close(move || {
            let _ = disconnect.send(Command::Disconnect);
        });

        info!(next_key = next_key.0, "feed opened");

        Ok(Self {
            connection,
            commands,
            state,
            subscriptions,
            worker: Mutex::new(Some(worker)),
            close_listener,
        })
    }

    /// The connection this feed runs on.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| FeedError::BackendUnavailable("feed sequencer stopped".into()))
    }

    // --- Appends ---

    /// Queue a message for appending. Does not wait for the key.
    ///
    /// Appends are ordered by arrival at the sequencer: an append issued
    /// after another one's key was reported is always ordered after it.
    pub fn append(&self, message: Message) -> Result<PendingAppend> {
        self.connection.ensure_open()?;

        let (reply, receiver) = bounded(1);
        self.send(Command::Append { message, reply })?;

        Ok(PendingAppend { receiver })
    }

    /// Append a message and wait for its key.
    pub fn append_blocking(&self, message: Message) -> Result<SequenceKey> {
        self.append(message)?.wait()
    }

    // --- Subscriptions ---

    /// Subscribe through a channel.
    ///
    /// The subscription replays every retained entry, emits `CaughtUp`, then
    /// delivers each later append exactly once.
    pub fn subscribe_channel(&self, config: SubscriptionConfig) -> Result<Subscription> {
        self.connection.ensure_open()?;

        let (subscription, pending) = self.subscriptions.create(config);
        self.send(Command::Subscribe { pending })?;

        debug!(id = subscription.id.0, "subscription requested");
        Ok(subscription)
    }

    /// Subscribe with callbacks using the default configuration.
    pub fn subscribe<M, E>(&self, on_message: M, on_error: E) -> Result<SubscriptionHandle>
    where
        M: FnMut(&Message, SequenceKey) + Send + 'static,
        E: FnOnce(FeedError) + Send + 'static,
    {
        self.subscribe_with(SubscriptionConfig::default(), on_message, on_error)
    }

    /// Subscribe with callbacks.
    ///
    /// Callbacks run on a dedicated delivery thread. `on_error` runs at most
    /// once, when the feed terminates the subscription; it is not called for
    /// an explicit unsubscribe or a feed shutdown.
    pub fn subscribe_with<M, E>(
        &self,
        config: SubscriptionConfig,
        on_message: M,
        on_error: E,
    ) -> Result<SubscriptionHandle>
    where
        M: FnMut(&Message, SequenceKey) + Send + 'static,
        E: FnOnce(FeedError) + Send + 'static,
    {
        let subscription = Arc::new(self.subscribe_channel(config)?);
        let id = subscription.id;

        let delivery = Arc::clone(&subscription);
        let worker = thread::Builder::new()
            .name(format!("hail-feed-sub-{}", id.0))
            .spawn(move || deliver(delivery, on_message, on_error));

        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                subscription.unsubscribe();
                return Err(e.into());
            }
        };

        Ok(SubscriptionHandle {
            id,
            subscription,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Stop a callback subscription. Idempotent.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        handle.unsubscribe();
    }

    /// Stop a channel subscription. Idempotent.
    pub fn unsubscribe_channel(&self, subscription: &Subscription) {
        subscription.unsubscribe();
    }

    // --- Reads ---

    /// Entries currently retained for replay, in key order.
    pub fn snapshot(&self) -> Vec<FeedEntry> {
        self.state.read().entries.iter().cloned().collect()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest key assigned so far.
    pub fn last_key(&self) -> Option<SequenceKey> {
        self.state.read().last_key
    }

    /// Get feed statistics.
    pub fn stats(&self) -> FeedStats {
        let state = self.state.read();
        FeedStats {
            retained_count: state.entries.len() as u64,
            total_appended: state.total_appended,
            last_key: state.last_key,
            subscriber_count: self.subscriptions.subscription_count() as u64,
        }
    }

    /// Flush storage after every append queued before this call.
    pub fn sync(&self) -> Result<()> {
        let (reply, receiver) = bounded(1);
        self.send(Command::Sync { reply })?;
        receiver
            .recv()
            .map_err(|_| FeedError::BackendUnavailable("feed sequencer stopped".into()))?
    }
}

impl Drop for Feed {
    fn drop(&mut self) {
        self.connection.remove_close_listener(self.close_listener);
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
        self.connection.detach_feed();
        info!("feed closed");
    }
}

/// Delivery loop for callback subscriptions.
fn deliver<M, E>(subscription: Arc<Subscription>, mut on_message: M, on_error: E)
where
    M: FnMut(&Message, SequenceKey),
    E: FnOnce(FeedError),
{
    let mut on_error = Some(on_error);

    while let Ok(event) = subscription.recv() {
        match event {
            FeedEvent::Message { entry } => on_message(entry.message.as_ref(), entry.key),
            FeedEvent::CaughtUp => debug!(id = subscription.id.0, "caught up"),
            FeedEvent::Dropped { reason } => {
                if reason.is_error() {
                    if let Some(on_error) = on_error.take() {
                        on_error(FeedError::SubscriptionTerminated(reason));
                    }
                }
                break;
            }
        }
    }

    debug!(id = subscription.id.0, "delivery stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLog;
    use crate::subscriptions::SubscriptionState;

    fn open_feed() -> Feed {
        Feed::open(Connection::in_memory(), FeedConfig::default()).unwrap()
    }

    fn msg(author: &str, body: &str, at: i64) -> Message {
        Message::at(author, body, Timestamp(at))
    }

    fn next_event(sub: &Subscription) -> FeedEvent {
        sub.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_append_assigns_increasing_keys() {
        let feed = open_feed();

        let a = feed.append_blocking(msg("bob", "hi", 1000)).unwrap();
        let b = feed.append_blocking(msg("bob", "again", 1001)).unwrap();

        assert_eq!(a, SequenceKey(1));
        assert_eq!(b, SequenceKey(2));
        assert_eq!(feed.last_key(), Some(b));
        assert_eq!(feed.len(), 2);
    }

    #[test]
    fn test_subscribe_empty_then_live() {
        let feed = open_feed();
        let sub = feed.subscribe_channel(SubscriptionConfig::default()).unwrap();

        assert!(matches!(next_event(&sub), FeedEvent::CaughtUp));
        assert_eq!(sub.state(), SubscriptionState::Live);

        let key = feed.append_blocking(msg("bob", "hi", 1000)).unwrap();
        match next_event(&sub) {
            FeedEvent::Message { entry } => {
                assert_eq!(entry.key, key);
                assert_eq!(*entry.message, msg("bob", "hi", 1000));
            }
            other => panic!("Expected Message, got {:?}", other),
        }
    }

    #[test]
    fn test_replay_then_caught_up() {
        let feed = open_feed();
        for i in 0..3 {
            feed.append_blocking(msg("alice", &format!("m{}", i), i)).unwrap();
        }

        let sub = feed.subscribe_channel(SubscriptionConfig::default()).unwrap();
        assert_eq!(sub.state(), SubscriptionState::Replaying);

        for expected in 1..=3 {
            match next_event(&sub) {
                FeedEvent::Message { entry } => assert_eq!(entry.key, SequenceKey(expected)),
                other => panic!("Expected replayed entry, got {:?}", other),
            }
        }
        assert!(matches!(next_event(&sub), FeedEvent::CaughtUp));
    }

    #[test]
    fn test_storage_failure_is_backend_unavailable() {
        let conn = Connection::with_memory_log(MemoryLog::failing());
        let feed = Feed::open(conn, FeedConfig::default()).unwrap();

        let result = feed.append_blocking(msg("bob", "hi", 1));
        assert!(matches!(result, Err(FeedError::BackendUnavailable(_))));
        assert_eq!(feed.last_key(), None);
    }

    #[test]
    fn test_retention_max_entries() {
        let conn = Connection::in_memory();
        let feed = Feed::open(
            conn,
            FeedConfig {
                retention: Retention::MaxEntries(2),
            },
        )
        .unwrap();

        for i in 0..5 {
            feed.append_blocking(msg("a", "b", i)).unwrap();
        }

        let keys: Vec<_> = feed.snapshot().iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![SequenceKey(4), SequenceKey(5)]);

        let stats = feed.stats();
        assert_eq!(stats.retained_count, 2);
        assert_eq!(stats.total_appended, 5);
        assert_eq!(stats.last_key, Some(SequenceKey(5)));
    }

    #[test]
    fn test_retention_max_age() {
        let feed = Feed::open(
            Connection::in_memory(),
            FeedConfig {
                retention: Retention::MaxAge(Duration::from_secs(60)),
            },
        )
        .unwrap();

        feed.append_blocking(msg("a", "ancient", 1000)).unwrap();
        feed.append_blocking(Message::new("a", "fresh")).unwrap();

        let bodies: Vec<_> = feed
            .snapshot()
            .iter()
            .map(|e| e.message.body.clone())
            .collect();
        assert_eq!(bodies, vec!["fresh".to_string()]);
    }

    #[test]
    fn test_reopen_continues_keys() {
        let conn = Connection::in_memory();
        {
            let feed = Feed::open(Arc::clone(&conn), FeedConfig::default()).unwrap();
            feed.append_blocking(msg("a", "1", 1)).unwrap();
            feed.append_blocking(msg("a", "2", 2)).unwrap();
        }

        let feed = Feed::open(conn, FeedConfig::default()).unwrap();
        assert_eq!(feed.len(), 2);
        assert_eq!(feed.append_blocking(msg("a", "3", 3)).unwrap(), SequenceKey(3));
    }

    #[test]
    fn test_retention_max_age_saturates() {
        for age in [Duration::MAX, Duration::from_secs(10u64.pow(16))] {
            let feed = Feed::open(
                Connection::in_memory(),
                FeedConfig {
                    retention: Retention::MaxAge(age),
                },
            )
            .unwrap();

            feed.append_blocking(msg("a", "ancient", 1000)).unwrap();
            feed.append_blocking(Message::new("a", "fresh")).unwrap();
            assert_eq!(feed.len(), 2);
        }
    }

    #[test]
    fn test_reopen_does_not_accumulate_close_listeners() {
        let conn = Connection::in_memory();
        for _ in 0..5 {
            let feed = Feed::open(Arc::clone(&conn), FeedConfig::default()).unwrap();
            assert_eq!(conn.close_listener_count(), 1);
            drop(feed);
        }
        assert_eq!(conn.close_listener_count(), 0);
    }

    #[test]
    fn test_exhausted_key_space_fails_open() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::create_dir_all(&path).unwrap();
        {
            let mut log = crate::storage::FeedLog::open(path.join("feed.log")).unwrap();
            log.append(&FeedEntry::new(SequenceKey(u64::MAX), msg("a", "last", 1)))
                .unwrap();
            log.sync().unwrap();
        }

        let conn = Connection::open(crate::connection::ConnectionConfig {
            path,
            ..Default::default()
        })
        .unwrap();
        for _ in 0..2 {
            assert!(matches!(
                Feed::open(Arc::clone(&conn), FeedConfig::default()),
                Err(FeedError::Corruption(_))
            ));
        }
    }

    #[test]
    fn test_snapshot_readable_during_replay() {
        let feed = Arc::new(open_feed());
        for i in 0..200 {
            feed.append_blocking(msg("a", "b", i)).unwrap();
        }

        let sub = feed.subscribe_channel(SubscriptionConfig::default()).unwrap();
        assert_eq!(feed.snapshot().len(), 200);

        let mut replayed = 0;
        loop {
            match next_event(&sub) {
                FeedEvent::Message { .. } => replayed += 1,
                FeedEvent::CaughtUp => break,
                other => panic!("Unexpected event: {:?}", other),
            }
        }
        assert_eq!(replayed, 200);
    }

    #[test]
    fn test_second_feed_on_connection_rejected() {
        let conn = Connection::in_memory();
        let _feed = Feed::open(Arc::clone(&conn), FeedConfig::default()).unwrap();
        assert!(matches!(
            Feed::open(conn, FeedConfig::default()),
            Err(FeedError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn test_pending_append_polling() {
        let feed = open_feed();
        let pending = feed.append(msg("a", "b", 1)).unwrap();

        let result = pending
            .wait_timeout(Duration::from_secs(5))
            .expect("append should complete");
        assert_eq!(result.unwrap(), SequenceKey(1));
    }

    #[test]
    fn test_drop_closes_subscriptions() {
        let feed = open_feed();
        let sub = feed.subscribe_channel(SubscriptionConfig::default()).unwrap();
        assert!(matches!(next_event(&sub), FeedEvent::CaughtUp));

        drop(feed);

        match next_event(&sub) {
            FeedEvent::Dropped { reason } => assert_eq!(reason, DropReason::FeedClosed),
            other => panic!("Expected Dropped, got {:?}", other),
        }
        assert_eq!(sub.state(), SubscriptionState::Closed);
    }
}
