//! The current session's display name.

use super::KeyValueStore;
use crate::error::Result;
use std::sync::Arc;
use tracing::{debug, warn};

/// Key the display name is stored under.
pub const USERNAME_KEY: &str = "username";

/// Holds the single current identity for this device.
#[derive(Clone)]
pub struct IdentityStore {
    preferences: Arc<dyn KeyValueStore>,
}

impl IdentityStore {
    pub fn new(preferences: Arc<dyn KeyValueStore>) -> Self {
        Self { preferences }
    }

    /// Store `name` as the current identity, replacing any previous one.
    ///
    /// Empty names are stored as given.
    pub fn set_identity(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            warn!("storing an empty identity");
        }
        self.preferences.put(USERNAME_KEY, name)?;
        debug!(identity = name, "identity set");
        Ok(())
    }

    /// The last stored identity, or None if none was ever set.
    pub fn get_identity(&self) -> Result<Option<String>> {
        self.preferences.get(USERNAME_KEY)
    }

    pub fn has_identity(&self) -> Result<bool> {
        Ok(self.get_identity()?.is_some())
    }

    /// Forget the current identity.
    pub fn clear_identity(&self) -> Result<()> {
        self.preferences.remove(USERNAME_KEY)?;
        debug!("identity cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FeedError;
    use crate::identity::MemoryPreferences;

    fn store() -> IdentityStore {
        IdentityStore::new(Arc::new(MemoryPreferences::new()))
    }

    #[test]
    fn test_set_get() {
        let identity = store();
        assert!(!identity.has_identity().unwrap());
        assert_eq!(identity.get_identity().unwrap(), None);

        identity.set_identity("alice").unwrap();
        assert_eq!(identity.get_identity().unwrap(), Some("alice".to_string()));
        assert!(identity.has_identity().unwrap());
    }

    #[test]
    fn test_overwrite_and_clear() {
        let identity = store();
        identity.set_identity("alice").unwrap();
        identity.set_identity("bob").unwrap();
        assert_eq!(identity.get_identity().unwrap(), Some("bob".to_string()));

        identity.clear_identity().unwrap();
        assert!(!identity.has_identity().unwrap());
    }

    #[test]
    fn test_empty_identity_is_present() {
        let identity = store();
        identity.set_identity("").unwrap();
        assert!(identity.has_identity().unwrap());
        assert_eq!(identity.get_identity().unwrap(), Some(String::new()));
    }

    #[test]
    fn test_persistence_failure() {
        let identity = IdentityStore::new(Arc::new(MemoryPreferences::failing()));
        assert!(matches!(
            identity.set_identity("alice"),
            Err(FeedError::PersistenceUnavailable(_))
        ));
        assert!(matches!(
            identity.has_identity(),
            Err(FeedError::PersistenceUnavailable(_))
        ));
    }
}
