//! Memory Store Module
//!
//! Process-local map from storage key to entry, used by the in-memory driver.

use std::collections::HashMap;

use crate::cache::{CacheEntry, TypedValue};
use crate::error::{CacheError, Result};

// == Memory Store ==
/// Entry map with lazy expiry checks and a bulk sweep.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Storage key -> entry
    entries: HashMap<String, CacheEntry>,
}

impl MemoryStore {
    // == Constructor ==
    pub fn new() -> Self {
        Self::default()
    }

    // == Live Lookups ==
    /// Returns the entry if present and not expired.
    pub fn live_entry(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key).filter(|entry| !entry.is_expired())
    }

    /// Mutable lookup. An expired entry is dropped on the spot.
    pub fn live_entry_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
        if self.entries.get(key).is_some_and(|entry| entry.is_expired()) {
            self.entries.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }

    pub fn contains_live(&self, key: &str) -> bool {
        self.live_entry(key).is_some()
    }

    // == Insert ==
    /// Stores an entry under `key`.
    ///
    /// With `overwrite` off, a live entry already under the key is a
    /// `DuplicateEntry`; an expired one is replaced.
    pub fn insert(&mut self, key: String, entry: CacheEntry, overwrite: bool, label: &str) -> Result<()> {
        if !overwrite && self.contains_live(&key) {
            return Err(CacheError::DuplicateEntry(label.to_string()));
        }
        self.entries.insert(key, entry);
        Ok(())
    }

    // == Increment ==
    /// Adds `delta` to the live numeric value under `key`.
    ///
    /// A missing key fails with `KeyNotFound`, or materializes as `delta`
    /// with `create_ttl` when `create` is set.
    pub fn increment(
        &mut self,
        key: &str,
        delta: i64,
        create: bool,
        create_ttl: Option<u64>,
        label: &str,
    ) -> Result<TypedValue> {
        match self.live_entry_mut(key) {
            Some(entry) => {
                let next = entry
                    .value
                    .add_delta(delta)
                    .ok_or_else(|| CacheError::NotNumeric(label.to_string()))?;
                entry.value = next.clone();
                Ok(next)
            }
            None if create => {
                let value = TypedValue::from_counter(delta);
                let entry = CacheEntry::new(value.clone(), create_ttl)?;
                self.entries.insert(key.to_string(), entry);
                Ok(value)
            }
            None => Err(CacheError::KeyNotFound(label.to_string())),
        }
    }

    // == Delete ==
    /// Removes an entry, returning whether one was present.
    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Removes every entry whose storage key starts with `prefix`.
    pub fn remove_prefix(&mut self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        before - self.entries.len()
    }

    // == Cleanup Expired ==
    /// Removes all expired entries from the store.
    ///
    /// Returns the number of entries removed.
    pub fn cleanup_expired(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before - self.entries.len()
    }

    // == Length ==
    /// Returns the current number of entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    // == Is Empty ==
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
