use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tracing::debug;

use crate::store::{Store, StoreError};

/// Interns label strings as integer ids.
///
/// Ids start at 1 and are handed out in first-seen order. New entries are
/// written to the store before they become visible, so an id returned once
/// resolves to the same string after a restart.
pub struct LabelCache<S> {
    store: Arc<S>,
    dictionary: RwLock<Dictionary>,
}

#[derive(Default)]
struct Dictionary {
    ids: HashMap<String, u64>,
    strings: HashMap<u64, String>,
    last_id: u64,
}

impl Dictionary {
    fn insert(&mut self, id: u64, value: String) {
        self.last_id = self.last_id.max(id);
        self.ids.insert(value.clone(), id);
        self.strings.insert(id, value);
    }

    fn pairs<T>(&self, labels: &[T]) -> Option<Vec<(u64, u64)>>
    where
        T: AsRef<str>,
    {
        labels
            .chunks_exact(2)
            .map(|pair| {
                let name: &str = pair[0].as_ref();
                let value: &str = pair[1].as_ref();
                Some((*self.ids.get(name)?, *self.ids.get(value)?))
            })
            .collect()
    }
}

impl<S> LabelCache<S>
where
    S: Store,
{
    /// Loads the persisted dictionary from `store`.
    pub fn open(store: Arc<S>) -> Result<Self, LabelCacheError> {
        let mut dictionary = Dictionary::default();
        for (id, value) in store.label_entries()? {
            dictionary.insert(id, value);
        }
        debug!("loaded {} label dictionary entries", dictionary.strings.len());

        Ok(Self {
            store,
            dictionary: RwLock::new(dictionary),
        })
    }

    /// Maps every name/value pair of every label set to a pair of ids,
    /// assigning ids to strings seen for the first time.
    pub fn encode<L, T>(&self, label_sets: &[L]) -> Result<Vec<Vec<(u64, u64)>>, LabelCacheError>
    where
        L: AsRef<[T]>,
        T: AsRef<str>,
    {
        {
            let dictionary = self.dictionary.read();
            let known: Option<Vec<_>> = label_sets
                .iter()
                .map(|set| dictionary.pairs(AsRef::<[T]>::as_ref(set)))
                .collect();
            if let Some(encoded) = known {
                return Ok(encoded);
            }
        }

        let mut dictionary = self.dictionary.write();
        let mut fresh: Vec<(u64, String)> = Vec::new();
        let mut next_id = dictionary.last_id;
        for label in label_sets
            .iter()
            .flat_map(|set| AsRef::<[T]>::as_ref(set))
        {
            let label = AsRef::<str>::as_ref(label);
            if dictionary.ids.contains_key(label) || fresh.iter().any(|(_, s)| s == label) {
                continue;
            }
            next_id += 1;
            fresh.push((next_id, label.to_owned()));
        }

        if !fresh.is_empty() {
            self.store.write_label_entries(&fresh)?;
            debug!("interned {} new label strings", fresh.len());
            for (id, value) in fresh {
                dictionary.insert(id, value);
            }
        }

        label_sets
            .iter()
            .map(|set| {
                dictionary
                    .pairs(AsRef::<[T]>::as_ref(set))
                    .ok_or(LabelCacheError::Inconsistent)
            })
            .collect()
    }

    /// Resolves id pairs back into a flattened name/value label list.
    pub fn decode(&self, ids: &[(u64, u64)]) -> Result<Vec<String>, LabelCacheError> {
        let dictionary = self.dictionary.read();
        let mut labels = Vec::with_capacity(ids.len() * 2);
        for (name, value) in ids {
            for id in &[*name, *value] {
                let label = dictionary
                    .strings
                    .get(id)
                    .ok_or(LabelCacheError::UnknownId(*id))?;
                labels.push(label.clone());
            }
        }
        Ok(labels)
    }

    pub fn len(&self) -> usize {
        self.dictionary.read().strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LabelCacheError {
    #[error("Label id {0} is not in the dictionary")]
    UnknownId(u64),

    #[error("Label dictionary lost an entry it just interned")]
    Inconsistent,

    #[error("Failed to persist label dictionary. Caused by: {0}")]
    Store(#[from] StoreError),
}
