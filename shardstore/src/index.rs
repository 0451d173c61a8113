//! Keep the full index of each shard in memory.

use crate::{Index, IndexStore, Key};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;

/// Errors that can occur when interacting with the [Memory] store.
#[derive(Debug, Error)]
pub enum Error {
    #[error("index not found: {0}")]
    NotFound(String),
}

/// An [IndexStore] that holds every index in memory.
///
/// Clones share the same underlying map.
#[derive(Clone)]
pub struct Memory<K: Key, I: Index> {
    indices: Arc<Mutex<HashMap<K, I>>>,
}

impl<K: Key, I: Index> Default for Memory<K, I> {
    fn default() -> Self {
        Self {
            indices: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K: Key, I: Index> Memory<K, I> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored indices.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no index is stored.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, I>> {
        self.indices.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K: Key, I: Index> IndexStore for Memory<K, I> {
    type Key = K;
    type Index = I;
    type Error = Error;

    async fn get_full_index(&self, key: &K) -> Result<I, Error> {
        self.lock()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn add_full_index(&self, key: K, index: I) -> Result<(), Error> {
        self.lock().insert(key, index);
        Ok(())
    }

    async fn has_full_index(&self, key: &K) -> Result<bool, Error> {
        Ok(self.lock().contains_key(key))
    }

    async fn drop_full_index(&self, key: &K) -> Result<bool, Error> {
        Ok(self.lock().remove(key).is_some())
    }
}
