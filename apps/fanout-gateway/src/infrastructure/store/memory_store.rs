//! In-memory set store.
//!
//! Mirrors Redis set semantics: a missing key reads as an empty set and a
//! set that loses its last member disappears.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::application::ports::{SetBatch, SetCommand, SetStorePort, StoreError};

/// Process-local implementation of [`SetStorePort`].
///
/// Suitable for tests and single-node development. Not shared across
/// gateway instances.
#[derive(Debug, Default)]
pub struct InMemorySetStore {
    sets: Mutex<HashMap<String, HashSet<String>>>,
}

impl InMemorySetStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of non-empty sets.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.sets.lock().len()
    }

    /// Ordered copy of every set, for assertions.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.sets
            .lock()
            .iter()
            .map(|(key, members)| (key.clone(), members.iter().cloned().collect()))
            .collect()
    }
}

#[async_trait]
impl SetStorePort for InMemorySetStore {
    async fn members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .sets
            .lock()
            .get(key)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn execute(&self, batch: SetBatch) -> Result<(), StoreError> {
        let mut sets = self.sets.lock();
        for command in batch.commands() {
            match command {
                SetCommand::Add { key, members } => {
                    sets.entry(key.clone())
                        .or_default()
                        .extend(members.iter().cloned());
                }
                SetCommand::Remove { key, member } => {
                    if let Some(set) = sets.get_mut(key) {
                        set.remove(member);
                        if set.is_empty() {
                            sets.remove(key);
                        }
                    }
                }
                SetCommand::Delete { key } => {
                    sets.remove(key);
                }
            }
        }
        drop(sets);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
