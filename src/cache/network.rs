//! Network-KV Driver
//!
//! Backs the driver contract with a remote key-value store reached through a
//! [`Connection`]. Records are `<typeCode>:<payload>` strings stored under
//! `<signature>:<namespaceHash>:<keyHash>`, and TTLs are native.
//!
//! Only single keys are atomic. Bulk writes fan out one command per key and
//! run concurrently; a failure rejects the call but keys already written
//! stay written.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::{debug, warn};

use crate::cache::connection::{Connection, KvStore, SetMode};
use crate::cache::driver::{normalize_ttl, silence, CacheDriver, DriverConfig, MultiExists};
use crate::cache::entry::expire_at_from_ttl;
use crate::cache::value::{decode_record, encode_record};
use crate::cache::{CacheOptions, TypedValue};
use crate::error::{CacheError, Result};

/// Compare-and-swap retries before a counter update gives up.
const MAX_SWAP_ATTEMPTS: usize = 16;

// == Network Driver ==
pub struct NetworkDriver<C: Connection> {
    config: DriverConfig,
    connection: Arc<C>,
}

impl<C: Connection> NetworkDriver<C> {
    pub fn new(config: DriverConfig, connection: C) -> Self {
        Self::with_shared_connection(config, Arc::new(connection))
    }

    /// Several drivers may share one connection.
    pub fn with_shared_connection(config: DriverConfig, connection: Arc<C>) -> Self {
        Self { config, connection }
    }

    pub fn connection(&self) -> &Arc<C> {
        &self.connection
    }

    /// Live handle, connecting once on first use.
    async fn handle(&self) -> Result<C::Handle> {
        if !self.connection.is_connected() {
            debug!("network driver: connecting lazily");
            self.connection.connect().await?;
        }
        self.connection.get_connection()
    }

    fn storage_key(&self, key: &str) -> Result<String> {
        self.config.storage_key(key, true)
    }

    fn storage_keys(&self, keys: &[String]) -> Result<Vec<String>> {
        Ok(self
            .config
            .hash_keys(keys)?
            .iter()
            .map(|hash| crate::cache::keys::composite(self.config.namespace_hash(), hash, true))
            .collect())
    }

    async fn write_one(
        handle: &C::Handle,
        storage_key: &str,
        key: &str,
        value: &TypedValue,
        ttl: Option<u64>,
        overwrite: bool,
    ) -> Result<()> {
        let record = encode_record(value)?;
        let mode = if overwrite {
            SetMode::Always
        } else {
            SetMode::IfAbsent
        };
        if handle.set(storage_key, &record, ttl, mode).await? {
            Ok(())
        } else {
            Err(CacheError::DuplicateEntry(key.to_string()))
        }
    }

    async fn read_one(handle: &C::Handle, storage_key: &str, key: &str) -> Result<TypedValue> {
        match handle.get(storage_key).await? {
            Some(record) => decode_record(&record),
            None => Err(CacheError::KeyNotFound(key.to_string())),
        }
    }

    /// Optimistic read, compute, compare-and-swap.
    async fn increment_one(
        handle: &C::Handle,
        storage_key: &str,
        key: &str,
        delta: i64,
        create: bool,
        create_ttl: Option<u64>,
    ) -> Result<TypedValue> {
        for _ in 0..MAX_SWAP_ATTEMPTS {
            match handle.get(storage_key).await? {
                None if !create => return Err(CacheError::KeyNotFound(key.to_string())),
                None => {
                    let value = TypedValue::from_counter(delta);
                    let record = encode_record(&value)?;
                    if handle
                        .set(storage_key, &record, create_ttl, SetMode::IfAbsent)
                        .await?
                    {
                        return Ok(value);
                    }
                }
                Some(record) => {
                    let next = decode_record(&record)?
                        .add_delta(delta)
                        .ok_or_else(|| CacheError::NotNumeric(key.to_string()))?;
                    if handle
                        .compare_and_swap(storage_key, &record, &encode_record(&next)?)
                        .await?
                    {
                        return Ok(next);
                    }
                }
            }
            debug!("network driver: counter '{}' changed concurrently, retrying", key);
        }
        Err(CacheError::backend(
            format!("counter '{}' kept changing", key),
            format!("gave up after {} compare-and-swap attempts", MAX_SWAP_ATTEMPTS),
        ))
    }
}

#[async_trait]
impl<C: Connection + 'static> CacheDriver for NetworkDriver<C> {
    fn name(&self) -> &'static str {
        "network"
    }

    fn config(&self) -> &DriverConfig {
        &self.config
    }

    fn config_mut(&mut self) -> &mut DriverConfig {
        &mut self.config
    }

    async fn set(&self, key: &str, value: TypedValue, options: CacheOptions) -> Result<()> {
        let storage_key = self.storage_key(key)?;
        let ttl = self.config.resolve_ttl(&options);
        expire_at_from_ttl(ttl)?;
        let handle = self.handle().await?;

        Self::write_one(
            &handle,
            &storage_key,
            key,
            &value,
            ttl,
            self.config.resolve_overwrite(&options),
        )
        .await
    }

    async fn get(&self, key: &str, options: CacheOptions) -> Result<Option<TypedValue>> {
        let storage_key = self.storage_key(key)?;
        let handle = self.handle().await?;
        let result = Self::read_one(&handle, &storage_key, key).await.map(Some);
        silence(result, options.silent)
    }

    /// There is no native existence check; a read stands in for it.
    async fn exists(&self, key: &str) -> Result<bool> {
        let storage_key = self.storage_key(key)?;
        let handle = self.handle().await?;
        Ok(handle.get(&storage_key).await?.is_some())
    }

    /// Expired keys are gone from the store, so their TTL cannot come back.
    async fn expire(&self, key: &str, ttl: Option<u64>) -> Result<()> {
        let storage_key = self.storage_key(key)?;
        let ttl = normalize_ttl(ttl);
        expire_at_from_ttl(ttl)?;
        let handle = self.handle().await?;
        handle.expire(&storage_key, ttl).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let storage_key = self.storage_key(key)?;
        let handle = self.handle().await?;
        handle.delete(&storage_key).await
    }

    /// Flushes the ENTIRE remote database, not just the configured
    /// namespace: the protocol has no per-namespace flush. Every namespace
    /// and every other tenant of the same database is wiped.
    async fn invalidate(&self) -> Result<()> {
        let handle = self.handle().await?;
        warn!(
            "network driver: invalidate flushes the whole remote store, not only namespace {:?}",
            self.config.namespace()
        );
        handle.flush().await
    }

    async fn increment(
        &self,
        key: &str,
        delta: i64,
        options: CacheOptions,
    ) -> Result<Option<TypedValue>> {
        let storage_key = self.storage_key(key)?;
        let create_ttl = self.config.resolve_ttl(&options);
        expire_at_from_ttl(create_ttl)?;
        let handle = self.handle().await?;

        let result = Self::increment_one(&handle, &storage_key, key, delta, options.create, create_ttl)
            .await
            .map(Some);
        silence(result, options.silent)
    }

    async fn set_multi(&self, entries: &[(String, TypedValue)], options: CacheOptions) -> Result<()> {
        let keys: Vec<String> = entries.iter().map(|(key, _)| key.clone()).collect();
        let storage_keys = self.storage_keys(&keys)?;
        let ttl = self.config.resolve_ttl(&options);
        expire_at_from_ttl(ttl)?;
        let overwrite = self.config.resolve_overwrite(&options);
        let handle = self.handle().await?;

        debug!("network driver: writing {} keys", entries.len());
        try_join_all(entries.iter().zip(storage_keys.iter()).map(
            |((key, value), storage_key)| {
                Self::write_one(&handle, storage_key, key, value, ttl, overwrite)
            },
        ))
        .await?;
        Ok(())
    }

    async fn get_multi(
        &self,
        keys: &[String],
        options: CacheOptions,
    ) -> Result<HashMap<String, Option<TypedValue>>> {
        let storage_keys = self.storage_keys(keys)?;
        let handle = self.handle().await?;
        let records = handle.mget(&storage_keys).await?;

        let mut values = HashMap::with_capacity(keys.len());
        for (key, record) in keys.iter().zip(records) {
            let result = match record {
                Some(record) => decode_record(&record).map(Some),
                None => Err(CacheError::KeyNotFound(key.clone())),
            };
            values.insert(key.clone(), silence(result, options.silent)?);
        }
        Ok(values)
    }

    async fn exists_multi(&self, keys: &[String], all: bool) -> Result<MultiExists> {
        let storage_keys = self.storage_keys(keys)?;
        let handle = self.handle().await?;
        let records = handle.mget(&storage_keys).await?;

        let map = keys
            .iter()
            .cloned()
            .zip(records.iter().map(Option::is_some))
            .collect();
        Ok(MultiExists::from_map(map, all))
    }

    async fn remove_multi(&self, keys: &[String]) -> Result<()> {
        let storage_keys = self.storage_keys(keys)?;
        let handle = self.handle().await?;
        try_join_all(storage_keys.iter().map(|storage_key| handle.delete(storage_key))).await?;
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
        expire_at_from_ttl(create_ttl)?;
        let handle = self.handle().await?;

        let results = try_join_all(deltas.iter().zip(storage_keys.iter()).map(
            |((key, delta), storage_key)| {
                let handle = &handle;
                async move {
                    let result = Self::increment_one(
                        handle,
                        storage_key,
                        key,
                        *delta,
                        options.create,
                        create_ttl,
                    )
                    .await
                    .map(Some);
                    silence(result, options.silent).map(|value| (key.clone(), value))
                }
            },
        ))
        .await?;
        Ok(results.into_iter().collect())
    }

    async fn expire_multi(&self, keys: &[String], ttl: Option<u64>) -> Result<()> {
        let storage_keys = self.storage_keys(keys)?;
        let ttl = normalize_ttl(ttl);
        expire_at_from_ttl(ttl)?;
        let handle = self.handle().await?;
        try_join_all(storage_keys.iter().map(|storage_key| handle.expire(storage_key, ttl))).await?;
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        self.connection.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;
    use serde_json::json;

    // == Mock Store ==
    #[derive(Clone, Default)]
    struct MockKv {
        data: Arc<Mutex<HashMap<String, (String, Option<Instant>)>>>,
        swap_conflicts: Arc<AtomicUsize>,
    }

    impl MockKv {
        fn live(&self, key: &str) -> Option<String> {
            let mut data = self.data.lock();
            match data.get(key) {
                Some((_, Some(at))) if Instant::now() >= *at => {
                    data.remove(key);
                    None
                }
                Some((value, _)) => Some(value.clone()),
                None => None,
            }
        }

        fn len(&self) -> usize {
            self.data.lock().len()
        }
    }

    #[async_trait]
    impl KvStore for MockKv {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            Ok(self.live(key))
        }

        async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
            Ok(keys.iter().map(|key| self.live(key)).collect())
        }

        async fn set(&self, key: &str, value: &str, ttl: Option<u64>, mode: SetMode) -> Result<bool> {
            if mode == SetMode::IfAbsent && self.live(key).is_some() {
                return Ok(false);
            }
            let at = ttl.map(|seconds| Instant::now() + Duration::from_secs(seconds));
            self.data.lock().insert(key.to_string(), (value.to_string(), at));
            Ok(true)
        }

        async fn compare_and_swap(&self, key: &str, expected: &str, value: &str) -> Result<bool> {
            if self.swap_conflicts.load(Ordering::SeqCst) > 0 {
                self.swap_conflicts.fetch_sub(1, Ordering::SeqCst);
                return Ok(false);
            }
            if self.live(key).as_deref() != Some(expected) {
                return Ok(false);
            }
            let mut data = self.data.lock();
            if let Some(entry) = data.get_mut(key) {
                entry.0 = value.to_string();
            }
            Ok(true)
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.data.lock().remove(key);
            Ok(())
        }

        async fn expire(&self, key: &str, ttl: Option<u64>) -> Result<()> {
            if self.live(key).is_none() {
                return Ok(());
            }
            if let Some(entry) = self.data.lock().get_mut(key) {
                entry.1 = ttl.map(|seconds| Instant::now() + Duration::from_secs(seconds));
            }
            Ok(())
        }

        async fn flush(&self) -> Result<()> {
            self.data.lock().clear();
            Ok(())
        }
    }

    // == Mock Connection ==
    #[derive(Default)]
    struct MockConnection {
        kv: MockKv,
        connected: AtomicBool,
        refuse: bool,
    }

    #[async_trait]
    impl Connection for MockConnection {
        type Handle = MockKv;

        async fn connect(&self) -> Result<()> {
            if self.refuse {
                return Err(CacheError::DriverNotConnected("refused".into()));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn disconnect(&self) -> Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn get_connection(&self) -> Result<MockKv> {
            if self.is_connected() {
                Ok(self.kv.clone())
            } else {
                Err(CacheError::DriverNotConnected("mock".into()))
            }
        }
    }

    fn driver() -> NetworkDriver<MockConnection> {
        NetworkDriver::new(DriverConfig::new(), MockConnection::default())
    }

    #[tokio::test]
    async fn test_lazy_connect_and_dispose() {
        let cache = driver();
        assert!(!cache.connection().is_connected());

        cache.set("k", "v".into(), CacheOptions::new()).await.unwrap();
        assert!(cache.connection().is_connected());

        cache.dispose().await.unwrap();
        assert!(!cache.connection().is_connected());
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces() {
        let connection = MockConnection {
            refuse: true,
            ..Default::default()
        };
        let cache = NetworkDriver::new(DriverConfig::new(), connection);
        let result = cache.get("k", CacheOptions::new()).await;
        assert!(matches!(result, Err(CacheError::DriverNotConnected(_))));
    }

    #[tokio::test]
    async fn test_storage_key_carries_signature() {
        let cache = driver();
        cache.set("k", "v".into(), CacheOptions::new()).await.unwrap();

        let stored = cache.connection().kv.data.lock().keys().cloned().collect::<Vec<_>>();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].starts_with("polycache:*:"));
    }

    #[tokio::test]
    async fn test_scenario() {
        let cache = driver();
        let user = TypedValue::from(json!({"name": "Ana"}));

        cache.set("user:42", user.clone(), CacheOptions::new().ttl(60)).await.unwrap();
        assert!(cache.exists("user:42").await.unwrap());
        assert_eq!(cache.get("user:42", CacheOptions::new()).await.unwrap(), Some(user));
        cache.remove("user:42").await.unwrap();
        assert!(!cache.exists("user:42").await.unwrap());
    }

    #[tokio::test]
    async fn test_overwrite_guard_maps_not_stored() {
        let cache = driver();
        cache.set("k", "v1".into(), CacheOptions::new()).await.unwrap();

        let dup = cache.set("k", "v2".into(), CacheOptions::new().overwrite(false)).await;
        assert!(matches!(dup, Err(CacheError::DuplicateEntry(_))));

        cache.set("k", "v2".into(), CacheOptions::new().overwrite(true)).await.unwrap();
        assert_eq!(cache.get("k", CacheOptions::new()).await.unwrap(), Some("v2".into()));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = driver();
        cache.set("k", "v".into(), CacheOptions::new().ttl(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(!cache.exists("k").await.unwrap());
        assert!(cache.get("k", CacheOptions::new().silent()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_counters_with_bigint() {
        let cache = driver();
        let big: num_bigint::BigInt = "90071992547409930000".parse().unwrap();
        cache.set("big", TypedValue::BigInt(big.clone()), CacheOptions::new()).await.unwrap();

        let next = cache.increment("big", 1, CacheOptions::new()).await.unwrap();
        assert_eq!(next, Some(TypedValue::BigInt(big + 1u32)));

        let created = cache.increment("fresh", 3, CacheOptions::new().create()).await.unwrap();
        assert_eq!(created, Some(TypedValue::Number(3.0)));

        cache.set("text", "abc".into(), CacheOptions::new()).await.unwrap();
        let result = cache.increment("text", 1, CacheOptions::new()).await;
        assert!(matches!(result, Err(CacheError::NotNumeric(_))));
        let result = cache.increment("none", 1, CacheOptions::new()).await;
        assert!(matches!(result, Err(CacheError::KeyNotFound(_))));
    }

    #[tokio::test]
    async fn test_counter_retries_on_conflict() {
        let cache = driver();
        cache.set("c", TypedValue::Number(1.0), CacheOptions::new()).await.unwrap();
        cache.connection().kv.swap_conflicts.store(3, Ordering::SeqCst);

        let next = cache.increment("c", 1, CacheOptions::new()).await.unwrap();
        assert_eq!(next, Some(TypedValue::Number(2.0)));

        cache
            .connection()
            .kv
            .swap_conflicts
            .store(MAX_SWAP_ATTEMPTS, Ordering::SeqCst);
        let result = cache.increment("c", 1, CacheOptions::new()).await;
        assert!(matches!(result, Err(CacheError::Backend { .. })));
    }

    #[tokio::test]
    async fn test_invalidate_flushes_every_namespace() {
        let mut cache = driver();
        cache.set_namespace(Some("a".into()));
        cache.set("k", "a".into(), CacheOptions::new()).await.unwrap();
        cache.set_namespace(Some("b".into()));
        cache.set("k", "b".into(), CacheOptions::new()).await.unwrap();

        cache.invalidate().await.unwrap();
        assert_eq!(cache.connection().kv.len(), 0);
    }

    #[tokio::test]
    async fn test_set_multi_partial_failure_keeps_written_keys() {
        let cache = driver();
        cache.set("b", "existing".into(), CacheOptions::new()).await.unwrap();

        let entries = vec![
            ("a".to_string(), TypedValue::from("1")),
            ("b".to_string(), TypedValue::from("2")),
        ];
        let result = cache.set_multi(&entries, CacheOptions::new().overwrite(false)).await;
        assert!(matches!(result, Err(CacheError::DuplicateEntry(_))));
        assert!(cache.exists("a").await.unwrap());
        assert_eq!(cache.get("b", CacheOptions::new()).await.unwrap(), Some("existing".into()));
    }

    #[tokio::test]
    async fn test_bulk_operations() {
        let cache = driver();
        let entries = vec![
            ("a".to_string(), TypedValue::Number(1.0)),
            ("b".to_string(), TypedValue::Boolean(true)),
        ];
        cache.set_multi(&entries, CacheOptions::new()).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let values = cache.get_multi(&keys, CacheOptions::new().silent()).await.unwrap();
        assert_eq!(values["b"], Some(TypedValue::Boolean(true)));
        assert_eq!(values["c"], None);

        match cache.exists_multi(&keys, false).await.unwrap() {
            MultiExists::PerKey(map) => {
                assert!(map["a"]);
                assert!(!map["c"]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let counters = cache
            .increment_multi(
                &[("a".to_string(), 4), ("b".to_string(), 1)],
                CacheOptions::new().silent(),
            )
            .await
            .unwrap();
        assert_eq!(counters["a"], Some(TypedValue::Number(5.0)));
        assert_eq!(counters["b"], None);

        cache.expire_multi(&keys, Some(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(cache.exists_multi(&keys, true).await.unwrap(), MultiExists::All(false));

        cache.set_multi(&entries, CacheOptions::new()).await.unwrap();
        cache.remove_multi(&keys).await.unwrap();
        assert_eq!(cache.connection().kv.len(), 0);
    }

    #[tokio::test]
    async fn test_created_counter_keeps_large_delta_exact() {
        let cache = driver();
        let delta = 9_007_199_254_740_993_i64;

        let created = cache.increment("c", delta, CacheOptions::new().create()).await.unwrap();
        let expected = TypedValue::BigInt(num_bigint::BigInt::from(delta));
        assert_eq!(created, Some(expected.clone()));
        assert_eq!(cache.get("c", CacheOptions::new()).await.unwrap(), Some(expected));
    }
}
