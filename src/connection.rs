//! Backend connection shared by the identity store and the feed.

use crate::error::{FeedError, Result};
use crate::identity::{FilePreferences, KeyValueStore, MemoryPreferences};
use crate::storage::{FeedLog, FeedStorage, MemoryLog};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Connection configuration.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Data directory holding the feed log and preferences.
    pub path: PathBuf,

    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Sync the feed log every N appends (0 or 1 = every append).
    pub sync_interval: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./hail-data"),
            create_if_missing: true,
            sync_interval: FeedLog::DEFAULT_SYNC_INTERVAL,
        }
    }
}

/// Where the connection keeps its data.
enum Backing {
    Directory {
        path: PathBuf,
        sync_interval: u64,
        /// Lock file for exclusive access.
        _lock_file: File,
    },
    Memory {
        log: MemoryLog,
    },
}

type CloseListener = Box<dyn FnOnce() + Send>;

/// Identifies a listener registered with [`Connection::on_close`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloseListenerId(u64);

/// An explicitly opened and closed connection to the feed backend.
///
/// Both [`crate::IdentityStore`] and [`crate::Feed`] are built from a
/// connection. Closing it makes appends and new subscriptions fail with
/// [`FeedError::BackendUnavailable`] and terminates live subscriptions.
pub struct Connection {
    backing: Backing,
    preferences: Arc<dyn KeyValueStore>,
    open: AtomicBool,
    /// Whether a feed currently owns the storage.
    feed_attached: AtomicBool,
    close_listeners: Mutex<Vec<(CloseListenerId, CloseListener)>>,
    next_listener_id: AtomicU64,
}

impl Connection {
    /// Open a connection backed by a data directory.
    pub fn open(config: ConnectionConfig) -> Result<Arc<Self>> {
        if !config.path.exists() {
            if !config.create_if_missing {
                return Err(FeedError::NotInitialized);
            }
            fs::create_dir_all(&config.path)?;
        }

        let lock_file = Self::acquire_lock(&config.path)?;
        let preferences = FilePreferences::open(config.path.join("preferences.json"))?;

        info!(path = %config.path.display(), "connection opened");

        Ok(Arc::new(Self {
            backing: Backing::Directory {
                path: config.path,
                sync_interval: config.sync_interval,
                _lock_file: lock_file,
            },
            preferences: Arc::new(preferences),
            open: AtomicBool::new(true),
            feed_attached: AtomicBool::new(false),
            close_listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }))
    }

    /// Open a connection that keeps everything in memory.
    pub fn in_memory() -> Arc<Self> {
        Self::with_memory_log(MemoryLog::new())
    }

    /// Open an in-memory connection over a given log.
    pub fn with_memory_log(log: MemoryLog) -> Arc<Self> {
        Self::with_parts(log, Arc::new(MemoryPreferences::new()))
    }

    /// Open an in-memory connection over a given log and preference store.
    pub fn with_parts(log: MemoryLog, preferences: Arc<dyn KeyValueStore>) -> Arc<Self> {
        Arc::new(Self {
            backing: Backing::Memory { log },
            preferences,
            open: AtomicBool::new(true),
            feed_attached: AtomicBool::new(false),
            close_listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        })
    }

    /// Data directory, if this connection has one.
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Directory { path, .. } => Some(path),
            Backing::Memory { .. } => None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("connection closed");
        let listeners = std::mem::take(&mut *self.close_listeners.lock());
        for (_, listener) in listeners {
            listener();
        }
    }

    /// Run `listener` once when the connection closes (immediately if it
    /// already has).
    pub fn on_close(&self, listener: impl FnOnce() + Send + 'static) -> CloseListenerId {
        let id = CloseListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst));
        {
            let mut listeners = self.close_listeners.lock();
            if self.is_open() {
                listeners.push((id, Box::new(listener)));
                return id;
            }
        }
        listener();
        id
    }

    /// Forget a listener that has not run yet. Unknown ids are ignored.
    pub fn remove_close_listener(&self, id: CloseListenerId) {
        self.close_listeners.lock().retain(|(listener_id, _)| *listener_id != id);
    }

    #[cfg(test)]
    pub(crate) fn close_listener_count(&self) -> usize {
        self.close_listeners.lock().len()
    }

    /// Local preference store scoped to this connection.
    pub fn preferences(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.preferences)
    }

    /// Fail with `BackendUnavailable` if the connection is closed.
    pub fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(FeedError::BackendUnavailable("connection closed".into()))
        }
    }

    /// Hand out the feed storage. Only one feed may own it at a time.
    pub(crate) fn attach_feed(&self) -> Result<Box<dyn FeedStorage>> {
        self.ensure_open()?;
        if self.feed_attached.swap(true, Ordering::SeqCst) {
            return Err(FeedError::BackendUnavailable(
                "a feed is already open on this connection".into(),
            ));
        }

        let storage: Result<Box<dyn FeedStorage>> = match &self.backing {
            Backing::Directory {
                path,
                sync_interval,
                ..
            } => FeedLog::open_with_sync_interval(path.join("feed.log"), *sync_interval)
                .map(|log| Box::new(log) as Box<dyn FeedStorage>),
            Backing::Memory { log } => Ok(Box::new(log.clone())),
        };

        if storage.is_err() {
            self.feed_attached.store(false, Ordering::SeqCst);
        }
        storage
    }

    pub(crate) fn detach_feed(&self) {
        self.feed_attached.store(false, Ordering::SeqCst);
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| FeedError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
