//! Cache Driver Contract
//!
//! The operation set every backend implements, plus the configuration each
//! driver embeds.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::cache::keys::{self, HashAlgorithm};
use crate::cache::{CacheOptions, TypedValue};
use crate::error::{CacheError, Result};

// == Driver Configuration ==
/// Shared driver settings. The namespace hash is memoized and recomputed
/// whenever the namespace or the hash algorithm changes.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    namespace: Option<String>,
    namespace_hash: String,
    default_ttl: u64,
    default_overwrite: bool,
    hash_algorithm: HashAlgorithm,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            namespace_hash: keys::NAMESPACE_WILDCARD.to_string(),
            default_ttl: 0,
            default_overwrite: true,
            hash_algorithm: HashAlgorithm::default(),
        }
    }
}

impl DriverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.set_namespace(Some(namespace.into()));
        self
    }

    pub fn with_default_ttl(mut self, seconds: u64) -> Self {
        self.default_ttl = seconds;
        self
    }

    pub fn with_default_overwrite(mut self, overwrite: bool) -> Self {
        self.default_overwrite = overwrite;
        self
    }

    pub fn with_hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.set_hash_algorithm(algorithm);
        self
    }

    // == Getters ==
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn namespace_hash(&self) -> &str {
        &self.namespace_hash
    }

    /// Default TTL in seconds, 0 = never expires
    pub fn default_ttl(&self) -> u64 {
        self.default_ttl
    }

    pub fn default_overwrite(&self) -> bool {
        self.default_overwrite
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash_algorithm
    }

    // == Setters ==
    pub fn set_namespace(&mut self, namespace: Option<String>) {
        self.namespace = namespace.filter(|ns| !ns.is_empty());
        self.rehash_namespace();
    }

    pub fn set_default_ttl(&mut self, seconds: u64) {
        self.default_ttl = seconds;
    }

    pub fn set_default_overwrite(&mut self, overwrite: bool) {
        self.default_overwrite = overwrite;
    }

    pub fn set_hash_algorithm(&mut self, algorithm: HashAlgorithm) {
        self.hash_algorithm = algorithm;
        self.rehash_namespace();
    }

    fn rehash_namespace(&mut self) {
        self.namespace_hash = keys::hash_namespace(self.namespace.as_deref(), self.hash_algorithm);
    }

    // == Key Helpers ==
    pub fn hash_key(&self, key: &str) -> Result<String> {
        keys::hash_key(key, self.hash_algorithm)
    }

    pub fn hash_keys<S: AsRef<str>>(&self, keys: &[S]) -> Result<Vec<String>> {
        keys::hash_many_keys(keys, self.hash_algorithm)
    }

    /// Full storage key for `key` under the configured namespace.
    pub fn storage_key(&self, key: &str, with_global_signature: bool) -> Result<String> {
        let key_hash = self.hash_key(key)?;
        Ok(keys::composite(&self.namespace_hash, &key_hash, with_global_signature))
    }

    // == Option Resolution ==
    /// Effective TTL for a write, `None` meaning never expires.
    pub fn resolve_ttl(&self, options: &CacheOptions) -> Option<u64> {
        normalize_ttl(Some(options.ttl.unwrap_or(self.default_ttl)))
    }

    pub fn resolve_overwrite(&self, options: &CacheOptions) -> bool {
        options.overwrite.unwrap_or(self.default_overwrite)
    }
}

/// Maps a zero TTL to "never expires".
pub fn normalize_ttl(ttl: Option<u64>) -> Option<u64> {
    ttl.filter(|seconds| *seconds > 0)
}

/// Converts a silenceable failure into the `None` fallback when `silent` is set.
pub(crate) fn silence<T>(result: Result<Option<T>>, silent: bool) -> Result<Option<T>> {
    match result {
        Err(err) if silent && err.is_silenceable() => Ok(None),
        other => other,
    }
}

// == Multi Exists ==
/// Result of [`CacheDriver::exists_multi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiExists {
    /// AND of every key's existence
    All(bool),
    /// Existence per logical key
    PerKey(HashMap<String, bool>),
}

impl MultiExists {
    pub fn from_map(map: HashMap<String, bool>, all: bool) -> Self {
        if all {
            MultiExists::All(map.values().all(|exists| *exists))
        } else {
            MultiExists::PerKey(map)
        }
    }
}

// == Cache Driver Trait ==
/// Operation set every storage backend implements.
///
/// Keys are logical strings; drivers hash them under the configured
/// namespace. Single-key failures reject the call. Bulk atomicity is
/// backend-defined and documented on each implementation.
#[async_trait]
pub trait CacheDriver: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    fn config(&self) -> &DriverConfig;

    fn config_mut(&mut self) -> &mut DriverConfig;

    /// Stores `value`. Fails with `DuplicateEntry` if the key exists and
    /// overwrite is off.
    async fn set(&self, key: &str, value: TypedValue, options: CacheOptions) -> Result<()>;

    /// Reads a value. Missing or expired keys fail with `KeyNotFound` unless
    /// `silent`, which yields `None`.
    async fn get(&self, key: &str, options: CacheOptions) -> Result<Option<TypedValue>>;

    /// True only if the key is present and not expired.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Rewrites the TTL of a live key. `None` or `Some(0)` clears it.
    /// Absent or expired keys are left untouched.
    async fn expire(&self, key: &str, ttl: Option<u64>) -> Result<()>;

    /// Deletes a key; absent keys are not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Clears every entry of the configured namespace.
    async fn invalidate(&self) -> Result<()>;

    /// Adds `delta` to a numeric value and returns the new value.
    async fn increment(
        &self,
        key: &str,
        delta: i64,
        options: CacheOptions,
    ) -> Result<Option<TypedValue>>;

    async fn decrement(
        &self,
        key: &str,
        delta: i64,
        options: CacheOptions,
    ) -> Result<Option<TypedValue>> {
        self.increment(key, negate(delta)?, options).await
    }

    async fn set_multi(&self, entries: &[(String, TypedValue)], options: CacheOptions)
        -> Result<()>;

    /// Per-key values; with `silent`, missing keys map to `None`.
    async fn get_multi(
        &self,
        keys: &[String],
        options: CacheOptions,
    ) -> Result<HashMap<String, Option<TypedValue>>>;

    async fn exists_multi(&self, keys: &[String], all: bool) -> Result<MultiExists>;

    async fn remove_multi(&self, keys: &[String]) -> Result<()>;

    async fn increment_multi(
        &self,
        deltas: &[(String, i64)],
        options: CacheOptions,
    ) -> Result<HashMap<String, Option<TypedValue>>>;

    async fn decrement_multi(
        &self,
        deltas: &[(String, i64)],
        options: CacheOptions,
    ) -> Result<HashMap<String, Option<TypedValue>>> {
        let negated = deltas
            .iter()
            .map(|(key, delta)| negate(*delta).map(|negated| (key.clone(), negated)))
            .collect::<Result<Vec<_>>>()?;
        self.increment_multi(&negated, options).await
    }

    async fn expire_multi(&self, keys: &[String], ttl: Option<u64>) -> Result<()>;

    /// Releases background tasks and backend handles.
    async fn dispose(&self) -> Result<()> {
        Ok(())
    }

    // == Configuration Accessors ==
    fn namespace(&self) -> Option<&str> {
        self.config().namespace()
    }

    fn set_namespace(&mut self, namespace: Option<String>) {
        self.config_mut().set_namespace(namespace);
    }

    fn default_ttl(&self) -> u64 {
        self.config().default_ttl()
    }

    fn set_default_ttl(&mut self, seconds: u64) {
        self.config_mut().set_default_ttl(seconds);
    }

    fn default_overwrite(&self) -> bool {
        self.config().default_overwrite()
    }

    fn set_default_overwrite(&mut self, overwrite: bool) {
        self.config_mut().set_default_overwrite(overwrite);
    }

    fn hash_algorithm(&self) -> HashAlgorithm {
        self.config().hash_algorithm()
    }

    fn set_hash_algorithm(&mut self, algorithm: HashAlgorithm) {
        self.config_mut().set_hash_algorithm(algorithm);
    }
}

fn negate(delta: i64) -> Result<i64> {
    delta
        .checked_neg()
        .ok_or_else(|| CacheError::InvalidArgument(format!("delta {} cannot be negated", delta)))
}
