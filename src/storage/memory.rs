//! In-memory feed storage.

use super::FeedStorage;
use crate::error::Result;
use crate::types::FeedEntry;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;

/// Feed storage that lives as long as the connection that created it.
///
/// Clones share the same entries, so a feed reopened on the same connection
/// sees what was appended before.
#[derive(Clone, Default)]
pub struct MemoryLog {
    entries: Arc<Mutex<Vec<FeedEntry>>>,
    failing: bool,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A log whose appends always fail, for exercising backend errors.
    pub fn failing() -> Self {
        Self {
            entries: Arc::default(),
            failing: true,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FeedStorage for MemoryLog {
    fn load(&mut self) -> Result<Vec<FeedEntry>> {
        Ok(self.entries.lock().clone())
    }

    fn append(&mut self, entry: &FeedEntry) -> Result<()> {
        if self.failing {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "memory log is failing").into());
        }
        self.entries.lock().push(entry.clone());
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}
