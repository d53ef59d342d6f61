//! # Hail Feed
//!
//! A realtime, append-only message feed with ordered fan-out to
//! subscribers, plus the small identity and routing layer a chat client
//! needs on top of it.
//!
//! ## Core Concepts
//!
//! - **Connection**: Explicitly opened backend; owns the data directory
//! - **Identity**: The locally stored display name of the current user
//! - **Feed**: Append-only log whose order is fixed by a single sequencer
//! - **Subscriptions**: Snapshot replay, then each new entry exactly once
//!
//! ## Example
//!
//! ```ignore
//! use hail_feed::{Connection, ConnectionConfig, FeedConfig, Route, Session};
//!
//! let conn = Connection::open(ConnectionConfig {
//!     path: "./hail-data".into(),
//!     ..Default::default()
//! })?;
//! let session = Session::open(&conn, FeedConfig::default())?;
//!
//! if session.route()? == Route::ShowLogin {
//!     session.login("alice")?;
//! }
//!
//! let handle = session.open_feed(
//!     |msg, key| println!("[{}] {}: {}", key, msg.author, msg.body),
//!     |err| eprintln!("feed lost: {}", err),
//! )?;
//!
//! session.send("Hello, world!")?.wait()?;
//! handle.unsubscribe();
//! ```

pub mod connection;
pub mod error;
pub mod feed;
pub mod identity;
pub mod session;
pub mod storage;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use connection::{CloseListenerId, Connection, ConnectionConfig};
pub use error::{FeedError, Result};
pub use feed::{Feed, FeedConfig, PendingAppend, Retention};
pub use identity::{FilePreferences, IdentityStore, KeyValueStore, MemoryPreferences};
pub use session::{route, Route, Session};
pub use storage::{FeedLog, FeedStorage, MemoryLog};
pub use subscriptions::{
    DropReason, FeedEvent, Subscription, SubscriptionConfig, SubscriptionHandle, SubscriptionId,
    SubscriptionManager, SubscriptionState,
};
pub use types::*;
