//! In-memory key-value store.
//!
//! Implements [`StoragePort`] for simulation runs and tests.  Keys are
//! namespaced (`namespace::key`) and each write replaces the whole value,
//! so a reader never sees a partial snapshot.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use log::debug;

use crate::app::ports::{StorageError, StoragePort};

/// Largest value accepted by one write (bytes).
const MAX_BLOB_SIZE: usize = 4000;

#[derive(Default)]
pub struct MemoryStore {
    store: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn composite_key(namespace: &str, key: &str) -> String {
        format!("{}::{}", namespace, key)
    }

    fn store(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.store.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Number of stored keys across all namespaces.
    pub fn len(&self) -> usize {
        self.store().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StoragePort for MemoryStore {
    fn read(&self, namespace: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.store()
            .get(&Self::composite_key(namespace, key))
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    fn write(&self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        if data.len() > MAX_BLOB_SIZE {
            return Err(StorageError::Full);
        }
        let composite = Self::composite_key(namespace, key);
        debug!("MemoryStore: write {} ({} bytes)", composite, data.len());
        self.store().insert(composite, data.to_vec());
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        self.store().remove(&Self::composite_key(namespace, key));
        Ok(())
    }

    fn exists(&self, namespace: &str, key: &str) -> bool {
        self.store()
            .contains_key(&Self::composite_key(namespace, key))
    }
}
