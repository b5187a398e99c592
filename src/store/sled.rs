use std::path::Path;

use parking_lot::Mutex;
use sled::{
    transaction::{TransactionError, TransactionResult},
    Batch, Db, Transactional, Tree,
};
use tracing::{debug, info};

use super::{be_u64, Bookmark, FlushOptions, FlushState, Store, StoreError, StoreKey};

const SIGNALS_TREE: &str = "signals";
const BOOKMARKS_TREE: &str = "bookmarks";
const LABELS_TREE: &str = "labels";
const LAST_KEY: &[u8] = b"last_key";

/// Store backed by a sled database.
///
/// Batches live in the `signals` tree keyed by big-endian `u64`, so tree
/// order is key order. The highest key ever assigned is kept next to the
/// trees so keys keep increasing after every batch has been pruned.
pub struct SledStore {
    db: Db,
    signals: Tree,
    bookmarks: Tree,
    labels: Tree,
    last_key: Mutex<StoreKey>,
    flush_options: FlushOptions,
    flush_state: FlushState,
}

impl SledStore {
    pub fn open<P>(path: P, flush_options: FlushOptions) -> Result<Self, StoreError>
    where
        P: AsRef<Path>,
    {
        let db = sled::open(path.as_ref())?;
        let signals = db.open_tree(SIGNALS_TREE)?;
        let bookmarks = db.open_tree(BOOKMARKS_TREE)?;
        let labels = db.open_tree(LABELS_TREE)?;

        let recorded = match db.get(LAST_KEY)? {
            Some(bytes) => StoreKey::from_be_slice(&bytes)?,
            None => StoreKey::NONE,
        };
        let stored = match signals.last()? {
            Some((key, _)) => StoreKey::from_be_slice(&key)?,
            None => StoreKey::NONE,
        };
        let last_key = recorded.max(stored);

        info!(
            "opened sample store at {} with last key {}",
            path.as_ref().display(),
            last_key
        );

        Ok(Self {
            db,
            signals,
            bookmarks,
            labels,
            last_key: Mutex::new(last_key),
            flush_options,
            flush_state: FlushState::new(),
        })
    }

    fn after_write(&self, bytes_written: usize) -> Result<(), StoreError> {
        if self.flush_state.record(self.flush_options, bytes_written) {
            self.db.flush()?;
        }
        Ok(())
    }

    fn first_key(entry: Option<(sled::IVec, sled::IVec)>) -> Result<StoreKey, StoreError> {
        entry.map_or(Ok(StoreKey::NONE), |(key, _)| StoreKey::from_be_slice(&key))
    }
}

impl Store for SledStore {
    fn oldest_key(&self) -> Result<StoreKey, StoreError> {
        Self::first_key(self.signals.first()?)
    }

    fn newest_key(&self) -> Result<StoreKey, StoreError> {
        Self::first_key(self.signals.last()?)
    }

    fn next_key(&self, current: StoreKey) -> Result<StoreKey, StoreError> {
        match self.signals.get_gt(current.to_be_bytes())? {
            Some((key, _)) => StoreKey::from_be_slice(&key),
            None => Ok(current),
        }
    }

    fn signal(&self, key: StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .signals
            .get(key.to_be_bytes())?
            .map(|value| value.to_vec()))
    }

    /// The batch and the last assigned key are written in one transaction.
    /// A failed flush is reported after the key is taken, so the key is never
    /// handed out twice.
    fn commit(&self, batch: &[u8]) -> Result<StoreKey, StoreError> {
        let mut last_key = self.last_key.lock();
        let key = last_key.next();
        let key_bytes = key.to_be_bytes();

        let committed: TransactionResult<()> =
            (&self.signals, &*self.db).transaction(|(signals, meta)| {
                signals.insert(&key_bytes[..], batch)?;
                meta.insert(LAST_KEY, &key_bytes[..])?;
                Ok(())
            });
        committed.map_err(|e| match e {
            TransactionError::Storage(e) => StoreError::Database(e),
            TransactionError::Abort(()) => {
                StoreError::Unavailable(format!("commit of batch {} aborted", key))
            }
        })?;

        *last_key = key;
        self.after_write(batch.len())?;
        Ok(key)
    }

    fn delete_keys_older_than(&self, key: StoreKey) -> Result<usize, StoreError> {
        let upper = key.to_be_bytes();
        let mut batch = Batch::default();
        let mut removed = 0;
        for entry in self.signals.range(..upper) {
            let (stored, _) = entry?;
            batch.remove(stored);
            removed += 1;
        }

        if removed > 0 {
            self.signals.apply_batch(batch)?;
            self.after_write(0)?;
            debug!("removed {} batches older than key {}", removed, key);
        }
        Ok(removed)
    }

    fn bookmark(&self, name: &str) -> Result<Option<Bookmark>, StoreError> {
        match self.bookmarks.get(name.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_bookmark(&self, name: &str, bookmark: &Bookmark) -> Result<(), StoreError> {
        let bytes = bincode::serialize(bookmark)?;
        self.bookmarks.insert(name.as_bytes(), bytes.as_slice())?;
        self.after_write(bytes.len())
    }

    fn bookmarks(&self, prefix: &str) -> Result<Vec<(String, Bookmark)>, StoreError> {
        self.bookmarks
            .scan_prefix(prefix.as_bytes())
            .map(|entry| {
                let (name, bytes) = entry?;
                let name = String::from_utf8_lossy(&name).into_owned();
                Ok((name, bincode::deserialize(&bytes)?))
            })
            .collect()
    }

    fn label_entries(&self) -> Result<Vec<(u64, String)>, StoreError> {
        self.labels
            .iter()
            .map(|entry| {
                let (id, value) = entry?;
                let id = be_u64(&id).ok_or_else(|| StoreError::MalformedLabelId(id.to_vec()))?;
                let value = String::from_utf8(value.to_vec())?;
                Ok((id, value))
            })
            .collect()
    }

    fn write_label_entries(&self, entries: &[(u64, String)]) -> Result<(), StoreError> {
        let mut batch = Batch::default();
        let mut bytes_written = 0;
        for (id, value) in entries {
            batch.insert(&id.to_be_bytes()[..], value.as_bytes());
            bytes_written += value.len();
        }
        self.labels.apply_batch(batch)?;
        self.after_write(bytes_written)
    }
}
