//! Durable key-value storage for committed batches, bookmarks and the label
//! table.

mod memory;
mod sled;

pub use self::memory::MemoryStore;
pub use self::sled::SledStore;

use std::{
    fmt,
    string::FromUtf8Error,
    sync::atomic::{AtomicUsize, Ordering},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Key of a committed batch. Keys are assigned by the store in increasing
/// order starting at 1; `StoreKey::NONE` means "no data".
#[derive(
    Clone, Copy, Debug, Default, Hash, Eq, Ord, PartialOrd, PartialEq, Serialize, Deserialize,
)]
pub struct StoreKey(u64);

impl StoreKey {
    pub const NONE: StoreKey = StoreKey(0);

    pub const fn new(key: u64) -> Self {
        Self(key)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub(crate) fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub(crate) fn from_be_slice(bytes: &[u8]) -> Result<Self, StoreError> {
        be_u64(bytes)
            .map(Self)
            .ok_or_else(|| StoreError::MalformedKey(bytes.to_vec()))
    }
}

pub(crate) fn be_u64(bytes: &[u8]) -> Option<u64> {
    let mut raw = [0_u8; 8];
    if bytes.len() != raw.len() {
        return None;
    }
    raw.copy_from_slice(bytes);
    Some(u64::from_be_bytes(raw))
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Last key a destination has durably finished processing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub key: StoreKey,
}

/// Durable storage shared by every appender and writer of a queue.
///
/// Implementations serialize key allocation in [`Store::commit`] and tolerate
/// arbitrary concurrent reads.
#[cfg_attr(test, mockall::automock)]
pub trait Store: Send + Sync {
    /// Oldest stored batch, or `StoreKey::NONE` if the store is empty.
    fn oldest_key(&self) -> Result<StoreKey, StoreError>;

    /// Newest stored batch, or `StoreKey::NONE` if the store is empty.
    fn newest_key(&self) -> Result<StoreKey, StoreError>;

    /// First stored key greater than `current`, or `current` itself when
    /// nothing newer exists yet.
    fn next_key(&self, current: StoreKey) -> Result<StoreKey, StoreError>;

    fn signal(&self, key: StoreKey) -> Result<Option<Vec<u8>>, StoreError>;

    /// Assigns the next key and persists `batch` under it. Either both happen
    /// or neither is visible.
    fn commit(&self, batch: &[u8]) -> Result<StoreKey, StoreError>;

    /// Removes every batch with a key lower than `key` and returns how many
    /// were removed.
    fn delete_keys_older_than(&self, key: StoreKey) -> Result<usize, StoreError>;

    fn bookmark(&self, name: &str) -> Result<Option<Bookmark>, StoreError>;

    fn write_bookmark(&self, name: &str, bookmark: &Bookmark) -> Result<(), StoreError>;

    /// Every saved bookmark whose name starts with `prefix`.
    fn bookmarks(&self, prefix: &str) -> Result<Vec<(String, Bookmark)>, StoreError>;

    fn label_entries(&self) -> Result<Vec<(u64, String)>, StoreError>;

    fn write_label_entries(&self, entries: &[(u64, String)]) -> Result<(), StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error occurred")]
    Database(#[from] ::sled::Error),

    #[error("Serialization error occurred")]
    Serialization(#[from] bincode::Error),

    #[error("Stored key {0:?} is not a big-endian u64")]
    MalformedKey(Vec<u8>),

    #[error("Stored label id {0:?} is not a big-endian u64")]
    MalformedLabelId(Vec<u8>),

    #[error("Stored label is not valid UTF-8")]
    MalformedLabel(#[from] FromUtf8Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FlushOptions {
    AfterEachWrite,
    AfterXWrites(usize),
    AfterXBytes(usize),
    Off,
}

impl FlushOptions {
    /// Maps the `flush_after_writes` setting: 0 disables explicit flushing,
    /// 1 flushes after every write and any larger value flushes every N writes.
    pub fn from_write_count(writes: usize) -> Self {
        match writes {
            0 => FlushOptions::Off,
            1 => FlushOptions::AfterEachWrite,
            n => FlushOptions::AfterXWrites(n),
        }
    }
}

pub(crate) struct FlushState {
    writes: AtomicUsize,
    bytes_written: AtomicUsize,
}

impl FlushState {
    pub(crate) fn new() -> Self {
        Self {
            writes: AtomicUsize::default(),
            bytes_written: AtomicUsize::default(),
        }
    }

    /// Records a write and reports whether the store should flush now.
    /// Counters restart after every positive answer.
    pub(crate) fn record(&self, options: FlushOptions, bytes_written: usize) -> bool {
        let writes = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        let bytes = self.bytes_written.fetch_add(bytes_written, Ordering::SeqCst) + bytes_written;

        let should_flush = match options {
            FlushOptions::AfterEachWrite => true,
            FlushOptions::AfterXWrites(xwrites) => writes >= xwrites,
            FlushOptions::AfterXBytes(xbytes) => bytes >= xbytes,
            FlushOptions::Off => false,
        };

        if should_flush {
            self.writes.store(0, Ordering::SeqCst);
            self.bytes_written.store(0, Ordering::SeqCst);
        }
        should_flush
    }
}
