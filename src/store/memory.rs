use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use super::{Bookmark, Store, StoreError, StoreKey};

/// Volatile store. Useful for tests and for agents running without a data
/// directory; nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    signals: BTreeMap<StoreKey, Vec<u8>>,
    bookmarks: HashMap<String, Bookmark>,
    labels: BTreeMap<u64, String>,
    last_key: StoreKey,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Store for MemoryStore {
    fn oldest_key(&self) -> Result<StoreKey, StoreError> {
        let state = self.state.lock();
        Ok(state.signals.keys().next().copied().unwrap_or_default())
    }

    fn newest_key(&self) -> Result<StoreKey, StoreError> {
        let state = self.state.lock();
        Ok(state.signals.keys().next_back().copied().unwrap_or_default())
    }

    fn next_key(&self, current: StoreKey) -> Result<StoreKey, StoreError> {
        let state = self.state.lock();
        Ok(state
            .signals
            .range(current.next()..)
            .next()
            .map_or(current, |(key, _)| *key))
    }

    fn signal(&self, key: StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.state.lock().signals.get(&key).cloned())
    }

    fn commit(&self, batch: &[u8]) -> Result<StoreKey, StoreError> {
        let mut state = self.state.lock();
        let key = state.last_key.next();
        state.signals.insert(key, batch.to_vec());
        state.last_key = key;
        Ok(key)
    }

    fn delete_keys_older_than(&self, key: StoreKey) -> Result<usize, StoreError> {
        let mut state = self.state.lock();
        let retained = state.signals.split_off(&key);
        let removed = state.signals.len();
        state.signals = retained;
        Ok(removed)
    }

    fn bookmark(&self, name: &str) -> Result<Option<Bookmark>, StoreError> {
        Ok(self.state.lock().bookmarks.get(name).copied())
    }

    fn write_bookmark(&self, name: &str, bookmark: &Bookmark) -> Result<(), StoreError> {
        self.state
            .lock()
            .bookmarks
            .insert(name.to_owned(), *bookmark);
        Ok(())
    }

    fn bookmarks(&self, prefix: &str) -> Result<Vec<(String, Bookmark)>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .bookmarks
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, bookmark)| (name.clone(), *bookmark))
            .collect())
    }

    fn label_entries(&self) -> Result<Vec<(u64, String)>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .labels
            .iter()
            .map(|(id, value)| (*id, value.clone()))
            .collect())
    }

    fn write_label_entries(&self, entries: &[(u64, String)]) -> Result<(), StoreError> {
        self.state.lock().labels.extend(entries.iter().cloned());
        Ok(())
    }
}
