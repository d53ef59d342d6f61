//! Login/feed routing for a client session.

use crate::connection::Connection;
use crate::error::{FeedError, Result};
use crate::feed::{Feed, FeedConfig, PendingAppend};
use crate::identity::IdentityStore;
use crate::subscriptions::SubscriptionHandle;
use crate::types::{Message, SequenceKey};
use std::sync::Arc;
use tracing::info;

/// Which screen a client should show.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    ShowLogin,
    ShowFeed,
}

/// Route on whether an identity is currently set.
pub fn route(identity_present: bool) -> Route {
    if identity_present {
        Route::ShowFeed
    } else {
        Route::ShowLogin
    }
}

/// A client session: the stored identity plus the feed it posts to.
pub struct Session {
    identity: IdentityStore,
    feed: Arc<Feed>,
}

impl Session {
    pub fn new(identity: IdentityStore, feed: Arc<Feed>) -> Self {
        Self { identity, feed }
    }

    /// Build the identity store and feed from one connection.
    pub fn open(connection: &Arc<Connection>, config: FeedConfig) -> Result<Self> {
        let identity = IdentityStore::new(connection.preferences());
        let feed = Feed::open(Arc::clone(connection), config)?;
        Ok(Self::new(identity, Arc::new(feed)))
    }

    pub fn identity(&self) -> &IdentityStore {
        &self.identity
    }

    pub fn feed(&self) -> &Arc<Feed> {
        &self.feed
    }

    /// Where this session should start.
    pub fn route(&self) -> Result<Route> {
        Ok(route(self.identity.has_identity()?))
    }

    /// Store the submitted name and move on to the feed.
    pub fn login(&self, name: &str) -> Result<Route> {
        self.identity.set_identity(name)?;
        info!(identity = name, "logged in");
        Ok(Route::ShowFeed)
    }

    /// Forget the identity and go back to login.
    pub fn logout(&self) -> Result<Route> {
        self.identity.clear_identity()?;
        Ok(Route::ShowLogin)
    }

    /// Post `body` as the current identity, stamped with the current time.
    pub fn send(&self, body: &str) -> Result<PendingAppend> {
        let author = self.identity.get_identity()?.ok_or(FeedError::NotSignedIn)?;
        self.feed.append(Message::new(author, body))
    }

    /// Start listening to the feed. Requires a stored identity.
    pub fn open_feed<M, E>(&self, on_message: M, on_error: E) -> Result<SubscriptionHandle>
    where
        M: FnMut(&Message, SequenceKey) + Send + 'static,
        E: FnOnce(FeedError) + Send + 'static,
    {
        if self.route()? == Route::ShowLogin {
            return Err(FeedError::NotSignedIn);
        }
        self.feed.subscribe(on_message, on_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    #[test]
    fn test_route() {
        assert_eq!(route(false), Route::ShowLogin);
        assert_eq!(route(true), Route::ShowFeed);
    }

    #[test]
    fn test_login_flow() {
        let conn = Connection::in_memory();
        let session = Session::open(&conn, FeedConfig::default()).unwrap();

        assert_eq!(session.route().unwrap(), Route::ShowLogin);
        assert!(matches!(session.send("hi"), Err(FeedError::NotSignedIn)));

        assert_eq!(session.login("alice").unwrap(), Route::ShowFeed);
        assert_eq!(session.route().unwrap(), Route::ShowFeed);

        let key = session.send("hi").unwrap().wait().unwrap();
        let entries = session.feed().snapshot();
        assert_eq!(entries[0].key, key);
        assert_eq!(entries[0].message.author, "alice");
        assert_eq!(entries[0].message.body, "hi");

        assert_eq!(session.logout().unwrap(), Route::ShowLogin);
        assert_eq!(session.route().unwrap(), Route::ShowLogin);
    }

    #[test]
    fn test_open_feed_requires_identity() {
        let conn = Connection::in_memory();
        let session = Session::open(&conn, FeedConfig::default()).unwrap();

        let result = session.open_feed(|_, _| {}, |_| {});
        assert!(matches!(result, Err(FeedError::NotSignedIn)));

        session.login("bob").unwrap();
        let (tx, rx) = unbounded();
        let handle = session
            .open_feed(move |msg, _| { let _ = tx.send(msg.body.clone()); }, |_| {})
            .unwrap();

        session.send("first").unwrap().wait().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "first");
        handle.unsubscribe();
    }
}
