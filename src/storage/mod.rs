//! Feed storage.
//!
//! Entries are persisted by a [`FeedStorage`] owned by the feed's sequencer.
//! [`FeedLog`] is a durable append-only file; [`MemoryLog`] keeps entries for
//! the lifetime of its connection only.

mod file;
mod memory;

pub use file::FeedLog;
pub use memory::MemoryLog;

use crate::error::Result;
use crate::types::FeedEntry;

/// Backing store for a feed's entries.
///
/// Implementations only ever see entries with strictly increasing keys.
pub trait FeedStorage: Send {
    /// Read every stored entry in key order.
    fn load(&mut self) -> Result<Vec<FeedEntry>>;

    /// Persist one entry after all previously appended ones.
    fn append(&mut self, entry: &FeedEntry) -> Result<()>;

    /// Flush pending writes.
    fn sync(&mut self) -> Result<()>;
}
