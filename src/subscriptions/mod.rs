//! Subscription system for live feed updates.
//!
//! Every subscription first replays the entries present when it was
//! registered, then receives each later append exactly once:
//! - Replayed and live entries never overlap and never leave a gap
//! - All subscribers observe entries in the same key order
//! - Optional bounded queues drop slow subscribers
//!
//! # Example
//!
//! ```ignore
//! let sub = feed.subscribe_channel(SubscriptionConfig::default())?;
//!
//! loop {
//!     match sub.recv() {
//!         Ok(FeedEvent::Message { entry }) => println!("{}: {}", entry.key, entry.message.body),
//!         Ok(FeedEvent::CaughtUp) => println!("Now live!"),
//!         Ok(FeedEvent::Dropped { reason }) => break,
//!         Err(_) => break,
//!     }
//! }
//! ```

mod manager;
mod types;

pub(crate) use manager::PendingSubscriber;
pub use manager::SubscriptionManager;
pub use types::{
    DropReason, FeedEvent, Subscription, SubscriptionConfig, SubscriptionHandle, SubscriptionId,
    SubscriptionState,
};
