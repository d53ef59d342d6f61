//! Core types for the message feed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Position of an entry in the feed's total order (assigned by the sequencer).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct SequenceKey(pub u64);

impl fmt::Debug for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.0)
    }
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceKey {
    /// The first key handed out on an empty feed.
    pub const FIRST: SequenceKey = SequenceKey(1);

    /// The key after this one, or None once the key space is exhausted.
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(SequenceKey)
    }
}

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Timestamp(millis)
    }

    pub fn from_millis(millis: i64) -> Self {
        Timestamp(millis)
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }

    /// Human readable form shown next to a message, e.g. `Sun, Oct 18, 3:04 PM` (UTC).
    pub fn format_display(self) -> String {
        match chrono::DateTime::from_timestamp_millis(self.0) {
            Some(dt) => dt.format("%a, %b %-d, %-I:%M %p").to_string(),
            None => String::new(),
        }
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A chat message. Immutable once appended to a feed.
///
/// Field names on the wire follow the document shape used by existing
/// clients (`username`, `message`, `timestamp`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Identity of the producer.
    #[serde(rename = "username")]
    pub author: String,

    /// Message text. Empty bodies are accepted.
    #[serde(rename = "message")]
    pub body: String,

    /// Assigned by the producer at send time, not by the feed.
    #[serde(rename = "timestamp")]
    pub created_at: Timestamp,
}

impl Message {
    /// Create a message stamped with the current time.
    pub fn new(author: impl Into<String>, body: impl Into<String>) -> Self {
        Self::at(author, body, Timestamp::now())
    }

    /// Create a message with an explicit creation time.
    pub fn at(author: impl Into<String>, body: impl Into<String>, created_at: Timestamp) -> Self {
        Self {
            author: author.into(),
            body: body.into(),
            created_at,
        }
    }
}

/// A message together with the key the feed assigned to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub key: SequenceKey,
    pub message: Arc<Message>,
}

impl FeedEntry {
    pub fn new(key: SequenceKey, message: Message) -> Self {
        Self {
            key,
            message: Arc::new(message),
        }
    }
}

/// Feed statistics.
#[derive(Clone, Debug, Default)]
pub struct FeedStats {
    /// Entries currently available for replay.
    pub retained_count: u64,
    /// Entries ever appended (including ones outside the retention window).
    pub total_appended: u64,
    /// Highest key assigned so far.
    pub last_key: Option<SequenceKey>,
    /// Open subscriptions.
    pub subscriber_count: u64,
}
