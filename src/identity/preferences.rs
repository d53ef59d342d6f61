//! Key-value preference stores.

use crate::error::{FeedError, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Durable string key-value store scoped to the local device.
pub trait KeyValueStore: Send + Sync {
    /// Get the value for `key`, or None if it was never set.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set `key` to `value`, replacing any previous value.
    fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

fn unavailable(path: &Path, e: impl std::fmt::Display) -> FeedError {
    FeedError::PersistenceUnavailable(format!("{}: {}", path.display(), e))
}

/// Preferences kept in a JSON object file.
///
/// Every change rewrites the file through a temporary file and a rename, so
/// a crash leaves either the old or the new contents.
pub struct FilePreferences {
    path: PathBuf,
    values: RwLock<BTreeMap<String, String>>,
}

impl FilePreferences {
    /// Open the preferences file, starting empty if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let values = if path.exists() {
            let bytes = fs::read(&path).map_err(|e| unavailable(&path, e))?;
            serde_json::from_slice(&bytes).map_err(|e| unavailable(&path, e))?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    /// Path to the preferences file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> Result<()> {
        let tmp_path = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(values)?;

        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&tmp_path, &self.path)
        };
        write().map_err(|e| unavailable(&self.path, e))?;

        debug!(path = %self.path.display(), keys = values.len(), "saved preferences");
        Ok(())
    }

    fn update(&self, change: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<()> {
        let mut values = self.values.write();
        let mut next = values.clone();
        change(&mut next);
        self.persist(&next)?;
        *values = next;
        Ok(())
    }
}

impl KeyValueStore for FilePreferences {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.update(|values| {
            values.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        if !self.values.read().contains_key(key) {
            return Ok(());
        }
        self.update(|values| {
            values.remove(key);
        })
    }
}

/// Preferences held in memory only.
#[derive(Default)]
pub struct MemoryPreferences {
    values: RwLock<BTreeMap<String, String>>,
    failing: bool,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every operation fails, for exercising persistence errors.
    pub fn failing() -> Self {
        Self {
            values: RwLock::default(),
            failing: true,
        }
    }

    fn check(&self) -> Result<()> {
        if self.failing {
            return Err(FeedError::PersistenceUnavailable(
                "memory preferences are failing".into(),
            ));
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryPreferences {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.values.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.check()?;
        self.values.write().remove(key);
        Ok(())
    }
}
