//! In-Memory Driver
//!
//! Backs the driver contract with a process-local map. It is the only driver
//! that evicts proactively: a sweep task owned by the instance removes
//! expired entries on a fixed interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::driver::{normalize_ttl, silence, CacheDriver, DriverConfig, MultiExists};
use crate::cache::entry::expire_at_from_ttl;
use crate::cache::keys::KEY_SEPARATOR;
use crate::cache::{CacheEntry, CacheOptions, MemoryStore, TypedValue};
use crate::error::{CacheError, Result};
use crate::tasks::spawn_cleanup_task;

/// Default sweep interval.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

// == Memory Driver ==
/// Bulk operations are plain loops: the first failure aborts the rest of
/// the batch and keys already written stay written.
pub struct MemoryDriver {
    config: DriverConfig,
    store: Arc<RwLock<MemoryStore>>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryDriver {
    /// Creates the driver and starts its sweep task.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: DriverConfig) -> Self {
        Self::with_cleanup_interval(config, DEFAULT_CLEANUP_INTERVAL)
    }

    pub fn with_cleanup_interval(config: DriverConfig, interval: Duration) -> Self {
        let store = Arc::new(RwLock::new(MemoryStore::new()));
        let handle = spawn_cleanup_task(store.clone(), interval);
        Self {
            config,
            store,
            cleanup: Mutex::new(Some(handle)),
        }
    }

    /// Number of stored entries, expired ones not yet swept included.
    pub async fn len(&self) -> usize {
        self.store.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.read().await.is_empty()
    }

    /// True while the sweep task is running.
    pub fn is_sweeping(&self) -> bool {
        self.cleanup
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn stop_cleanup(&self) {
        if let Some(handle) = self.cleanup.lock().take() {
            handle.abort();
            debug!("memory driver: cleanup task stopped");
        }
    }

    fn storage_key(&self, key: &str) -> Result<String> {
        self.config.storage_key(key, false)
    }

    fn storage_keys(&self, keys: &[String]) -> Result<Vec<String>> {
        let hashes = self.config.hash_keys(keys)?;
        Ok(hashes
            .iter()
            .map(|hash| crate::cache::keys::composite(self.config.namespace_hash(), hash, false))
            .collect())
    }
}

impl Drop for MemoryDriver {
    fn drop(&mut self) {
        self.stop_cleanup();
    }
}

#[async_trait]
impl CacheDriver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn config(&self) -> &DriverConfig {
        &self.config
    }

    fn config_mut(&mut self) -> &mut DriverConfig {
        &mut self.config
    }

    async fn set(&self, key: &str, value: TypedValue, options: CacheOptions) -> Result<()> {
        let storage_key = self.storage_key(key)?;
        if matches!(value, TypedValue::Undefined) {
            return Err(CacheError::Serialization(format!("cannot store undefined under '{}'", key)));
        }
        let entry = CacheEntry::new(value, self.config.resolve_ttl(&options))?;
        let overwrite = self.config.resolve_overwrite(&options);

        self.store.write().await.insert(storage_key, entry, overwrite, key)
    }

    async fn get(&self, key: &str, options: CacheOptions) -> Result<Option<TypedValue>> {
        let storage_key = self.storage_key(key)?;
        let store = self.store.read().await;
        let result = store
            .live_entry(&storage_key)
            .map(|entry| Some(entry.value.clone()))
            .ok_or_else(|| CacheError::KeyNotFound(key.to_string()));
        silence(result, options.silent)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let storage_key = self.storage_key(key)?;
        Ok(self.store.read().await.contains_live(&storage_key))
    }

    async fn expire(&self, key: &str, ttl: Option<u64>) -> Result<()> {
        let storage_key = self.storage_key(key)?;
        let expire_at = expire_at_from_ttl(normalize_ttl(ttl))?;

        if let Some(entry) = self.store.write().await.live_entry_mut(&storage_key) {
            entry.expire_at = expire_at;
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let storage_key = self.storage_key(key)?;
        self.store.write().await.remove(&storage_key);
        Ok(())
    }

    async fn invalidate(&self) -> Result<()> {
        let prefix = format!("{}{}", self.config.namespace_hash(), KEY_SEPARATOR);
        let removed = self.store.write().await.remove_prefix(&prefix);
        debug!("memory driver: invalidated {} entries", removed);
        Ok(())
    }

    async fn increment(
        &self,
        key: &str,
        delta: i64,
        options: CacheOptions,
    ) -> Result<Option<TypedValue>> {
        let storage_key = self.storage_key(key)?;
        let create_ttl = self.config.resolve_ttl(&options);

        let result = self
            .store
            .write()
            .await
            .increment(&storage_key, delta, options.create, create_ttl, key)
            .map(Some);
        silence(result, options.silent)
    }

    async fn set_multi(&self, entries: &[(String, TypedValue)], options: CacheOptions) -> Result<()> {
        let keys: Vec<String> = entries.iter().map(|(key, _)| key.clone()).collect();
        let storage_keys = self.storage_keys(&keys)?;
        let ttl = self.config.resolve_ttl(&options);
        let overwrite = self.config.resolve_overwrite(&options);

        let mut store = self.store.write().await;
        for ((key, value), storage_key) in entries.iter().zip(storage_keys) {
            if matches!(value, TypedValue::Undefined) {
                return Err(CacheError::Serialization(format!("cannot store undefined under '{}'", key)));
            }
            let entry = CacheEntry::new(value.clone(), ttl)?;
            store.insert(storage_key, entry, overwrite, key)?;
        }
        Ok(())
    }

    async fn get_multi(
        &self,
        keys: &[String],
        options: CacheOptions,
    ) -> Result<HashMap<String, Option<TypedValue>>> {
        let storage_keys = self.storage_keys(keys)?;
        let store = self.store.read().await;

        let mut values = HashMap::with_capacity(keys.len());
        for (key, storage_key) in keys.iter().zip(storage_keys) {
            let result = store
                .live_entry(&storage_key)
                .map(|entry| Some(entry.value.clone()))
                .ok_or_else(|| CacheError::KeyNotFound(key.clone()));
            values.insert(key.clone(), silence(result, options.silent)?);
        }
        Ok(values)
    }

    async fn exists_multi(&self, keys: &[String], all: bool) -> Result<MultiExists> {
        let storage_keys = self.storage_keys(keys)?;
        let store = self.store.read().await;

        let map = keys
            .iter()
            .zip(storage_keys)
            .map(|(key, storage_key)| (key.clone(), store.contains_live(&storage_key)))
            .collect();
        Ok(MultiExists::from_map(map, all))
    }

    async fn remove_multi(&self, keys: &[String]) -> Result<()> {
        let storage_keys = self.storage_keys(keys)?;
        let mut store = self.store.write().await;
        for storage_key in storage_keys {
            store.remove(&storage_key);
        }
        Ok(())
    }

    async fn increment_multi(
        &self,
        deltas: &[(String, i64)],
        options: CacheOptions,
    ) -> Result<HashMap<String, Option<TypedValue>>> {
        let keys: Vec<String> = deltas.iter().map(|(key, _)| key.clone()).collect();
        let storage_keys = self.storage_keys(&keys)?;
        let create_ttl = self.config.resolve_ttl(&options);

        let mut store = self.store.write().await;
        let mut values = HashMap::with_capacity(deltas.len());
        for ((key, delta), storage_key) in deltas.iter().zip(storage_keys) {
            let result = store
                .increment(&storage_key, *delta, options.create, create_ttl, key)
                .map(Some);
            values.insert(key.clone(), silence(result, options.silent)?);
        }
        Ok(values)
    }

    async fn expire_multi(&self, keys: &[String], ttl: Option<u64>) -> Result<()> {
        let storage_keys = self.storage_keys(keys)?;
        let expire_at = expire_at_from_ttl(normalize_ttl(ttl))?;

        let mut store = self.store.write().await;
        for storage_key in storage_keys {
            if let Some(entry) = store.live_entry_mut(&storage_key) {
                entry.expire_at = expire_at;
            }
        }
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        self.stop_cleanup();
        Ok(())
    }
}
