//! File Driver
//!
//! One file per key: `<root>/<namespaceHash>/<keyHash>.cache`, holding the
//! `<typeCode>:<payload>` record. There is no native expiry, so TTL calls
//! are rejected. Bulk operations fan out one file operation per key with no
//! cross-file transaction.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::cache::driver::{silence, CacheDriver, DriverConfig, MultiExists};
use crate::cache::value::{decode_record, encode_record};
use crate::cache::{CacheOptions, TypedValue};
use crate::error::{CacheError, Result};

/// Extension of files this driver owns.
pub const CACHE_EXTENSION: &str = "cache";

const TEMP_EXTENSION: &str = "tmp";

fn io_error(context: &str, path: &Path, err: std::io::Error) -> CacheError {
    CacheError::backend(format!("{} {}", context, path.display()), err)
}

/// Counter for temp file names, unique within the process.
static TEMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Sibling of `path` in the same directory. Never ends in `.cache`, so
/// readers and `invalidate` ignore it.
fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sequence = TEMP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(
        ".{}.{}.{}.{}",
        name,
        std::process::id(),
        sequence,
        TEMP_EXTENSION
    ))
}

async fn write_new(path: &Path, record: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(record.as_bytes()).await?;
    file.flush().await
}

/// Replacing writes go through a temp file renamed over the target, so
/// readers see either the old or the new record, never a partial one.
async fn open_and_write(path: &Path, record: &str, overwrite: bool) -> std::io::Result<()> {
    if !overwrite {
        return write_new(path, record).await;
    }
    let temp = temp_path(path);
    let result = match write_new(&temp, record).await {
        Ok(()) => fs::rename(&temp, path).await,
        Err(err) => Err(err),
    };
    if result.is_err() {
        // Best effort; the temp file may never have been created.
        let _ = fs::remove_file(&temp).await;
    }
    result
}

/// Writes a record. Exclusive create makes `overwrite = false` race-free;
/// a missing namespace directory is created and the write retried once.
async fn write_record(path: &Path, record: &str, overwrite: bool, label: &str) -> Result<()> {
    let first = match open_and_write(path, record, overwrite).await {
        Err(err) if err.kind() == ErrorKind::NotFound => {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)
                    .await
                    .map_err(|e| io_error("cannot create", dir, e))?;
                debug!("file driver: created {}", dir.display());
            }
            open_and_write(path, record, overwrite).await
        }
        other => other,
    };
    match first {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            Err(CacheError::DuplicateEntry(label.to_string()))
        }
        Err(err) => Err(io_error("cannot write", path, err)),
    }
}

async fn read_record(path: &Path) -> Result<Option<TypedValue>> {
    match fs::read_to_string(path).await {
        Ok(record) => decode_record(&record).map(Some),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_error("cannot read", path, err)),
    }
}

async fn delete_record(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_error("cannot delete", path, err)),
    }
}

fn unsupported_ttl() -> CacheError {
    CacheError::UnsupportedOperation("the file driver does not support TTL".to_string())
}

// == File Driver ==
pub struct FileDriver {
    config: DriverConfig,
    root: PathBuf,
}

impl FileDriver {
    /// Creates the driver. Directories are created on first write.
    pub fn new(config: DriverConfig, root: impl Into<PathBuf>) -> Self {
        Self {
            config,
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the current namespace.
    pub fn namespace_dir(&self) -> PathBuf {
        self.root.join(self.config.namespace_hash())
    }

    fn record_path(&self, key_hash: &str) -> PathBuf {
        self.namespace_dir()
            .join(format!("{}.{}", key_hash, CACHE_EXTENSION))
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        Ok(self.record_path(&self.config.hash_key(key)?))
    }

    fn paths_for<S: AsRef<str>>(&self, keys: &[S]) -> Result<Vec<PathBuf>> {
        Ok(self
            .config
            .hash_keys(keys)?
            .iter()
            .map(|hash| self.record_path(hash))
            .collect())
    }

    /// Only an explicit positive TTL is rejected; the inherited default is ignored.
    fn check_write_ttl(options: &CacheOptions) -> Result<()> {
        match options.ttl {
            Some(seconds) if seconds > 0 => Err(unsupported_ttl()),
            _ => Ok(()),
        }
    }

    /// Read, compute, replace. Concurrent updates of one key can lose a delta.
    async fn increment_path(
        &self,
        path: &Path,
        label: &str,
        delta: i64,
        options: &CacheOptions,
    ) -> Result<Option<TypedValue>> {
        let result = match read_record(path).await? {
            Some(current) => match current.add_delta(delta) {
                Some(next) => {
                    write_record(path, &encode_record(&next)?, true, label).await?;
                    Ok(Some(next))
                }
                None => Err(CacheError::NotNumeric(label.to_string())),
            },
            None if options.create => {
                let created = TypedValue::from_counter(delta);
                write_record(path, &encode_record(&created)?, true, label).await?;
                Ok(Some(created))
            }
            None => Err(CacheError::KeyNotFound(label.to_string())),
        };
        silence(result, options.silent)
    }
}

#[async_trait]
impl CacheDriver for FileDriver {
    fn name(&self) -> &'static str {
        "file"
    }

    fn config(&self) -> &DriverConfig {
        &self.config
    }

    fn config_mut(&mut self) -> &mut DriverConfig {
        &mut self.config
    }

    async fn set(&self, key: &str, value: TypedValue, options: CacheOptions) -> Result<()> {
        Self::check_write_ttl(&options)?;
        let path = self.path_for(key)?;
        let record = encode_record(&value)?;
        write_record(&path, &record, self.config.resolve_overwrite(&options), key).await
    }

    async fn get(&self, key: &str, options: CacheOptions) -> Result<Option<TypedValue>> {
        let path = self.path_for(key)?;
        let result = read_record(&path)
            .await?
            .map(Some)
            .ok_or_else(|| CacheError::KeyNotFound(key.to_string()));
        silence(result, options.silent)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| io_error("cannot stat", &path, e))
    }

    async fn expire(&self, _key: &str, _ttl: Option<u64>) -> Result<()> {
        Err(unsupported_ttl())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        delete_record(&self.path_for(key)?).await
    }

    async fn invalidate(&self) -> Result<()> {
        let dir = self.namespace_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(io_error("cannot list", &dir, err)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("cannot list", &dir, e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == CACHE_EXTENSION) {
                paths.push(path);
            }
        }

        let removed = paths.len();
        try_join_all(paths.iter().map(|path| delete_record(path))).await?;
        debug!("file driver: invalidated {} records in {}", removed, dir.display());
        Ok(())
    }

    async fn increment(
        &self,
        key: &str,
        delta: i64,
        options: CacheOptions,
    ) -> Result<Option<TypedValue>> {
        let path = self.path_for(key)?;
        self.increment_path(&path, key, delta, &options).await
    }

    async fn set_multi(&self, entries: &[(String, TypedValue)], options: CacheOptions) -> Result<()> {
        Self::check_write_ttl(&options)?;
        let keys: Vec<&str> = entries.iter().map(|(key, _)| key.as_str()).collect();
        let paths = self.paths_for(&keys)?;
        let records = entries
            .iter()
            .map(|(_, value)| encode_record(value))
            .collect::<Result<Vec<_>>>()?;
        let overwrite = self.config.resolve_overwrite(&options);

        let writes = entries
            .iter()
            .zip(paths.iter().zip(records.iter()))
            .map(|((key, _), (path, record))| write_record(path, record, overwrite, key));
        let results = join_all(writes).await;

        let failures = results.iter().filter(|result| result.is_err()).count();
        if failures > 0 {
            warn!("file driver: {} of {} writes failed", failures, entries.len());
        }
        results.into_iter().collect()
    }

    async fn get_multi(
        &self,
        keys: &[String],
        options: CacheOptions,
    ) -> Result<HashMap<String, Option<TypedValue>>> {
        let paths = self.paths_for(keys)?;
        let records = try_join_all(paths.iter().map(|path| read_record(path))).await?;

        let mut values = HashMap::with_capacity(keys.len());
        for (key, record) in keys.iter().zip(records) {
            let result = record
                .map(Some)
                .ok_or_else(|| CacheError::KeyNotFound(key.clone()));
            values.insert(key.clone(), silence(result, options.silent)?);
        }
        Ok(values)
    }

    async fn exists_multi(&self, keys: &[String], all: bool) -> Result<MultiExists> {
        let paths = self.paths_for(keys)?;
        let found = try_join_all(paths.iter().map(|path| async move {
            fs::try_exists(path)
                .await
                .map_err(|e| io_error("cannot stat", path, e))
        }))
        .await?;

        let map = keys.iter().cloned().zip(found).collect();
        Ok(MultiExists::from_map(map, all))
    }

    async fn remove_multi(&self, keys: &[String]) -> Result<()> {
        let paths = self.paths_for(keys)?;
        try_join_all(paths.iter().map(|path| delete_record(path))).await?;
        Ok(())
    }

    async fn increment_multi(
        &self,
        deltas: &[(String, i64)],
        options: CacheOptions,
    ) -> Result<HashMap<String, Option<TypedValue>>> {
        let keys: Vec<&str> = deltas.iter().map(|(key, _)| key.as_str()).collect();
        let paths = self.paths_for(&keys)?;

        // Deltas for one key apply in order; distinct keys fan out.
        let mut groups: Vec<(&str, &Path, Vec<i64>)> = Vec::new();
        let mut positions: HashMap<&str, usize> = HashMap::new();
        for ((key, delta), path) in deltas.iter().zip(paths.iter()) {
            match positions.get(key.as_str()) {
                Some(&index) => groups[index].2.push(*delta),
                None => {
                    positions.insert(key.as_str(), groups.len());
                    groups.push((key.as_str(), path.as_path(), vec![*delta]));
                }
            }
        }

        let updates = groups.into_iter().map(|(key, path, key_deltas)| async move {
            let mut value = None;
            for delta in key_deltas {
                value = self.increment_path(path, key, delta, &options).await?;
            }
            Ok::<_, CacheError>((key.to_string(), value))
        });
        Ok(try_join_all(updates).await?.into_iter().collect())
    }

    async fn expire_multi(&self, _keys: &[String], _ttl: Option<u64>) -> Result<()> {
        Err(unsupported_ttl())
    }
}
