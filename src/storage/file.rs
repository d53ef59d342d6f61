//! Append-only feed log file.

use super::FeedStorage;
use crate::error::{FeedError, Result};
use crate::types::{FeedEntry, Message, SequenceKey};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for each log frame.
const LOG_MAGIC: &[u8; 4] = b"HAL\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Frame header size (fixed part).
const FRAME_HEADER_SIZE: usize = 4 + 1 + 8 + 4; // magic + version + key + payload length

/// Frame trailer size.
const FRAME_TRAILER_SIZE: usize = 4; // crc32 of payload

/// Durable append-only log of feed entries.
pub struct FeedLog {
    /// Path to the log file.
    path: PathBuf,

    /// Log file handle.
    file: File,

    /// End of the last complete frame.
    file_size: u64,

    /// Highest key written.
    last_key: Option<SequenceKey>,

    /// Number of writes since last sync.
    writes_since_sync: u64,

    /// Sync every N writes.
    sync_interval: u64,
}

impl FeedLog {
    /// Default sync interval.
    pub const DEFAULT_SYNC_INTERVAL: u64 = 100;

    /// Open or create a feed log with default sync interval.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(path, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a feed log with custom sync interval.
    /// - sync_interval = 0 or 1: sync every write
    /// - sync_interval = 100: sync every 100 writes
    pub fn open_with_sync_interval(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();

        Ok(Self {
            path,
            file,
            file_size,
            last_key: None,
            writes_since_sync: 0,
            sync_interval: sync_interval.max(1),
        })
    }

    /// Path to the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the valid part of the log.
    pub fn size(&self) -> u64 {
        self.file_size
    }

    fn encode_frame(entry: &FeedEntry) -> Result<Vec<u8>> {
        let payload = rmp_serde::to_vec_named(entry.message.as_ref())?;

        let mut frame =
            Vec::with_capacity(FRAME_HEADER_SIZE + payload.len() + FRAME_TRAILER_SIZE);
        frame.extend_from_slice(LOG_MAGIC);
        frame.push(LOG_VERSION);
        frame.extend_from_slice(&entry.key.0.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());

        Ok(frame)
    }

    fn write_frame(&mut self, frame: &[u8], sync: bool) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.file_size))?;
        self.file.write_all(frame)?;
        if sync {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Cut the file back to the last complete frame after a failed write.
    fn rollback(&mut self) {
        if let Err(e) = self.file.set_len(self.file_size) {
            warn!(
                path = %self.path.display(),
                error = %e,
                "failed to discard partial frame"
            );
        }
    }

    /// Drop bytes past the last complete frame left by an earlier failed write.
    fn discard_tail(&mut self) -> Result<()> {
        let len = self.file.metadata()?.len();
        if len > self.file_size {
            warn!(
                path = %self.path.display(),
                discarded = len - self.file_size,
                "discarding bytes past last complete frame"
            );
            self.file.set_len(self.file_size)?;
        }
        Ok(())
    }

    /// Read one frame. Returns the entry and the frame length.
    fn read_frame(reader: &mut impl Read) -> Result<(FeedEntry, u64)> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        reader.read_exact(&mut header)?;

        if &header[0..4] != LOG_MAGIC {
            return Err(FeedError::InvalidFormat("Invalid frame magic".into()));
        }
        if header[4] != LOG_VERSION {
            return Err(FeedError::InvalidFormat(format!(
                "Unsupported log version: {}",
                header[4]
            )));
        }

        let mut key_bytes = [0u8; 8];
        key_bytes.copy_from_slice(&header[5..13]);
        let key = SequenceKey(u64::from_le_bytes(key_bytes));

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&header[13..17]);
        let payload_len = u32::from_le_bytes(len_bytes) as usize;

        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&payload);

        if stored_checksum != computed_checksum {
            return Err(FeedError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        let message: Message = rmp_serde::from_slice(&payload)?;
        let frame_len = (FRAME_HEADER_SIZE + payload_len + FRAME_TRAILER_SIZE) as u64;

        Ok((FeedEntry::new(key, message), frame_len))
    }
}

impl FeedStorage for FeedLog {
    fn load(&mut self) -> Result<Vec<FeedEntry>> {
        let file_len = self.file.metadata()?.len();
        self.file.seek(SeekFrom::Start(0))?;

        let mut reader = BufReader::new(&self.file);
        let mut entries = Vec::new();
        let mut offset = 0u64;
        let mut last_key: Option<SequenceKey> = None;

        while offset < file_len {
            match Self::read_frame(&mut reader) {
                Ok((entry, frame_len)) => {
                    if last_key.map_or(false, |last| entry.key <= last) {
                        return Err(FeedError::Corruption(format!(
                            "Key {} at offset {} does not follow {:?}",
                            entry.key, offset, last_key
                        )));
                    }
                    last_key = Some(entry.key);
                    offset += frame_len;
                    entries.push(entry);
                }
                Err(FeedError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    // Torn write at the tail from an interrupted append
                    warn!(
                        path = %self.path.display(),
                        offset,
                        discarded = file_len - offset,
                        "truncating incomplete frame at end of feed log"
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        drop(reader);
        if offset < file_len {
            self.file.set_len(offset)?;
            self.file.sync_all()?;
        }

        self.file_size = offset;
        self.last_key = last_key;

        debug!(path = %self.path.display(), entries = entries.len(), "loaded feed log");
        Ok(entries)
    }

    fn append(&mut self, entry: &FeedEntry) -> Result<()> {
        if let Some(last) = self.last_key {
            if entry.key <= last {
                return Err(FeedError::Corruption(format!(
                    "Append of key {} after {}",
                    entry.key, last
                )));
            }
        }

        let frame = Self::encode_frame(entry)?;
        self.discard_tail()?;

        // Sync periodically based on sync_interval
        let sync_due = self.writes_since_sync + 1 >= self.sync_interval;
        if let Err(e) = self.write_frame(&frame, sync_due) {
            self.rollback();
            return Err(e);
        }

        self.file_size += frame.len() as u64;
        self.last_key = Some(entry.key);
        self.writes_since_sync = if sync_due { 0 } else { self.writes_since_sync + 1 };

        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        self.writes_since_sync = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;
    use tempfile::TempDir;

    fn entry(key: u64, body: &str) -> FeedEntry {
        FeedEntry::new(SequenceKey(key), Message::at("alice", body, Timestamp(1000 + key as i64)))
    }

    #[test]
    fn test_append_and_load() {
        let dir = TempDir::new().unwrap();
        let mut log = FeedLog::open(dir.path().join("feed.log")).unwrap();

        assert!(log.load().unwrap().is_empty());
        log.append(&entry(1, "hello")).unwrap();
        log.append(&entry(2, "world")).unwrap();

        let entries = log.load().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, SequenceKey(1));
        assert_eq!(entries[1].message.body, "world");
        assert_eq!(entries[1].message.created_at, Timestamp(1002));
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("feed.log");

        {
            let mut log = FeedLog::open(&path).unwrap();
            for i in 1..=5 {
                log.append(&entry(i, &format!("message {}", i))).unwrap();
            }
            log.sync().unwrap();
        }

        let mut log = FeedLog::open(&path).unwrap();
        let entries = log.load().unwrap();
        assert_eq!(entries.len(), 5);

        // Keys continue after reopen
        assert!(log.append(&entry(5, "dup")).is_err());
        log.append(&entry(6, "message 6")).unwrap();
        assert_eq!(log.load().unwrap().len(), 6);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("feed.log");

        let good_size = {
            let mut log = FeedLog::open(&path).unwrap();
            log.append(&entry(1, "complete")).unwrap();
            log.sync().unwrap();
            log.size()
        };

        // Half a frame
        let partial = FeedLog::encode_frame(&entry(2, "interrupted")).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial[..partial.len() / 2]).unwrap();
        drop(file);

        let mut log = FeedLog::open(&path).unwrap();
        let entries = log.load().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(log.size(), good_size);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_size);

        log.append(&entry(2, "retried")).unwrap();
        assert_eq!(log.load().unwrap().len(), 2);
    }

    #[test]
    fn test_partial_write_does_not_poison_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("feed.log");

        let mut log = FeedLog::open(&path).unwrap();
        log.load().unwrap();
        log.append(&entry(1, "first")).unwrap();
        let good_size = log.size();

        // Leftover of a long frame whose write failed midway
        let long = FeedLog::encode_frame(&entry(2, &"x".repeat(500))).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&long[..300]).unwrap();
        drop(file);

        log.append(&entry(2, "short")).unwrap();
        log.sync().unwrap();
        assert!(log.size() > good_size);
        drop(log);

        let mut log = FeedLog::open(&path).unwrap();
        let entries = log.load().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].key, SequenceKey(2));
        assert_eq!(entries[1].message.body, "short");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), log.size());
    }

    #[test]
    fn test_checksum_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("feed.log");

        {
            let mut log = FeedLog::open(&path).unwrap();
            log.append(&entry(1, "payload")).unwrap();
            log.sync().unwrap();
        }

        // Flip a payload byte
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[FRAME_HEADER_SIZE + 2] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let mut log = FeedLog::open(&path).unwrap();
        assert!(matches!(
            log.load(),
            Err(FeedError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("feed.log");
        std::fs::write(&path, vec![0u8; 64]).unwrap();

        let mut log = FeedLog::open(&path).unwrap();
        assert!(matches!(log.load(), Err(FeedError::InvalidFormat(_))));
    }
}
