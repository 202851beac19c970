//! Embedded-SQL Driver
//!
//! Backs the driver contract with one SQLite table:
//!
//! ```sql
//! cache_storage(namespace TEXT, key TEXT, value TEXT, data_type_code INTEGER,
//!               date DATETIME, expire DATETIME, PRIMARY KEY(namespace, key))
//! ```
//!
//! The connection is opened and the schema created on first use. Bulk writes
//! run in one transaction, split into chunks of `chunk_size` keys per
//! statement; any chunk failure rolls the whole batch back. This is the only
//! driver with multi-key atomicity.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value as SqlValue;
use rusqlite::{ffi, params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use tokio::task;
use tracing::{debug, info, warn};

use crate::cache::driver::{normalize_ttl, silence, CacheDriver, DriverConfig, MultiExists};
use crate::cache::entry::{current_timestamp_ms, expire_at_from_ttl};
use crate::cache::value::{serialize, unserialize, DataType};
use crate::cache::{CacheOptions, TypedValue};
use crate::error::{CacheError, Result};

/// Keys per `IN (...)` statement.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Last millisecond of year 9999; later timestamps break fixed-width ordering.
const MAX_TIMESTAMP_MS: u64 = 253_402_300_799_999;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cache_storage (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT,
    data_type_code INTEGER NOT NULL,
    date DATETIME NOT NULL,
    expire DATETIME,
    PRIMARY KEY (namespace, key)
);
";

const LIVE: &str = "(expire IS NULL OR expire >= ?)";

type SharedConnection = Arc<Mutex<Option<Connection>>>;

// == Timestamps ==
/// Fixed-width UTC text, so string comparison orders by time.
fn sql_timestamp(ms: u64) -> Result<String> {
    if ms > MAX_TIMESTAMP_MS {
        return Err(CacheError::InvalidArgument(format!("timestamp {} ms is out of range", ms)));
    }
    DateTime::<Utc>::from_timestamp_millis(ms as i64)
        .map(|at| at.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .ok_or_else(|| CacheError::InvalidArgument(format!("timestamp {} ms is out of range", ms)))
}

fn now_timestamp() -> Result<String> {
    sql_timestamp(current_timestamp_ms())
}

fn expire_timestamp(ttl: Option<u64>) -> Result<Option<String>> {
    expire_at_from_ttl(ttl)?.map(sql_timestamp).transpose()
}

// == Error Mapping ==
fn map_sql_error(err: rusqlite::Error) -> CacheError {
    CacheError::backend("sqlite", err)
}

fn is_key_conflict(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => {
            failure.code == ErrorCode::ConstraintViolation
                && (failure.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    || failure.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE)
        }
        _ => false,
    }
}

fn map_write_error(err: rusqlite::Error, label: &str) -> CacheError {
    if is_key_conflict(&err) {
        CacheError::DuplicateEntry(label.to_string())
    } else {
        map_sql_error(err)
    }
}

fn map_join_error(err: task::JoinError) -> CacheError {
    CacheError::backend("sqlite worker failed", err)
}

// == Store Setup ==
/// Opens the database file, creates the schema and registers `cache_add`.
fn open_store(path: &Path) -> Result<Connection> {
    if path.as_os_str().is_empty() {
        return Err(CacheError::DriverNotConfigured("sqlite path is empty".to_string()));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| CacheError::backend(format!("cannot create {}", parent.display()), e))?;
    }
    let conn = Connection::open(path)
        .map_err(|e| CacheError::DriverNotConnected(format!("{}: {}", path.display(), e)))?;
    conn.execute_batch(SCHEMA).map_err(map_sql_error)?;
    register_functions(&conn).map_err(map_sql_error)?;
    info!("sqlite store ready at {}", path.display());
    Ok(conn)
}

/// `cache_add(value, data_type_code, delta)` applies counter arithmetic with
/// the same number semantics as every other driver.
fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "cache_add",
        3,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let payload: String = ctx.get(0)?;
            let code: i64 = ctx.get(1)?;
            let delta: i64 = ctx.get(2)?;
            let current = unserialize(&payload, code)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            let next = current.add_delta(delta).ok_or_else(|| {
                rusqlite::Error::UserFunctionError(
                    format!("type code {} is not numeric", code).into(),
                )
            })?;
            serialize(&next)
                .map(|(_, payload)| payload)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))
        },
    )
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

// == Row Helpers ==
/// Removes expired rows for `key_hashes` so they never block an insert.
fn purge_expired(conn: &Connection, namespace: &str, key_hashes: &[String], now: &str, chunk_size: usize) -> Result<()> {
    for chunk in key_hashes.chunks(chunk_size) {
        let sql = format!(
            "DELETE FROM cache_storage WHERE namespace = ? AND key IN ({}) \
             AND expire IS NOT NULL AND expire < ?",
            placeholders(chunk.len())
        );
        let mut values = Vec::with_capacity(chunk.len() + 2);
        values.push(SqlValue::Text(namespace.to_string()));
        values.extend(chunk.iter().map(|hash| SqlValue::Text(hash.clone())));
        values.push(SqlValue::Text(now.to_string()));
        conn.execute(&sql, params_from_iter(values.iter()))
            .map_err(map_sql_error)?;
    }
    Ok(())
}

/// One row of a pending write.
struct Row {
    label: String,
    key_hash: String,
    code: u8,
    payload: String,
}

fn insert_rows(
    conn: &Connection,
    namespace: &str,
    rows: &[Row],
    overwrite: bool,
    now: &str,
    expire: Option<&str>,
    chunk_size: usize,
) -> Result<()> {
    let verb = if overwrite { "INSERT OR REPLACE" } else { "INSERT" };
    for chunk in rows.chunks(chunk_size) {
        let tuples = vec!["(?, ?, ?, ?, ?, ?)"; chunk.len()].join(", ");
        let sql = format!(
            "{} INTO cache_storage (namespace, key, value, data_type_code, date, expire) VALUES {}",
            verb, tuples
        );
        let mut values = Vec::with_capacity(chunk.len() * 6);
        for row in chunk {
            values.push(SqlValue::Text(namespace.to_string()));
            values.push(SqlValue::Text(row.key_hash.clone()));
            values.push(SqlValue::Text(row.payload.clone()));
            values.push(SqlValue::Integer(row.code as i64));
            values.push(SqlValue::Text(now.to_string()));
            values.push(expire.map_or(SqlValue::Null, |at| SqlValue::Text(at.to_string())));
        }
        conn.execute(&sql, params_from_iter(values.iter())).map_err(|err| {
            let label = if chunk.len() == 1 {
                chunk[0].label.clone()
            } else {
                format!("one of {} keys", chunk.len())
            };
            map_write_error(err, &label)
        })?;
    }
    Ok(())
}

/// Live `(payload, code)` rows by key hash.
fn select_live(
    conn: &Connection,
    namespace: &str,
    key_hashes: &[String],
    now: &str,
    chunk_size: usize,
) -> Result<HashMap<String, (String, i64)>> {
    let mut found = HashMap::with_capacity(key_hashes.len());
    for chunk in key_hashes.chunks(chunk_size) {
        let sql = format!(
            "SELECT key, value, data_type_code FROM cache_storage \
             WHERE namespace = ? AND key IN ({}) AND {}",
            placeholders(chunk.len()),
            LIVE
        );
        let mut values = Vec::with_capacity(chunk.len() + 2);
        values.push(SqlValue::Text(namespace.to_string()));
        values.extend(chunk.iter().map(|hash| SqlValue::Text(hash.clone())));
        values.push(SqlValue::Text(now.to_string()));

        let mut stmt = conn.prepare(&sql).map_err(map_sql_error)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
            })
            .map_err(map_sql_error)?;
        for row in rows {
            let (key, payload, code) = row.map_err(map_sql_error)?;
            found.insert(key, (payload, code));
        }
    }
    Ok(found)
}

/// Counter update for one key.
///
/// Without `create` a conditional `UPDATE` touches only live numeric rows;
/// when nothing matched, a follow-up read tells a missing key from a
/// non-numeric one. With `create` an upsert replaces missing or expired rows
/// with `delta` in the same statement.
fn increment_row(
    conn: &Connection,
    namespace: &str,
    key_hash: &str,
    label: &str,
    delta: i64,
    create: bool,
    create_expire: Option<&str>,
) -> Result<TypedValue> {
    let now = now_timestamp()?;
    let numeric = format!(
        "{}, {}",
        DataType::NUMERIC_CODES[0],
        DataType::NUMERIC_CODES[1]
    );

    let updated: Option<(String, i64)> = if create {
        let (initial_type, initial) = serialize(&TypedValue::from_counter(delta))?;
        let sql = format!(
            "INSERT INTO cache_storage (namespace, key, value, data_type_code, date, expire) \
             VALUES (?1, ?2, ?3, ?7, ?4, ?5) \
             ON CONFLICT(namespace, key) DO UPDATE SET \
               value = CASE WHEN expire IS NOT NULL AND expire < ?4 \
                       THEN excluded.value ELSE cache_add(value, data_type_code, ?6) END, \
               data_type_code = CASE WHEN expire IS NOT NULL AND expire < ?4 \
                       THEN excluded.data_type_code ELSE data_type_code END, \
               expire = CASE WHEN expire IS NOT NULL AND expire < ?4 \
                       THEN excluded.expire ELSE expire END, \
               date = ?4 \
             WHERE (expire IS NOT NULL AND expire < ?4) OR data_type_code IN ({numeric}) \
             RETURNING value, data_type_code",
            numeric = numeric,
        );
        conn.query_row(
            &sql,
            params![
                namespace,
                key_hash,
                initial,
                now,
                create_expire,
                delta,
                initial_type.code()
            ],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(map_sql_error)?
    } else {
        let sql = format!(
            "UPDATE cache_storage SET value = cache_add(value, data_type_code, ?1), date = ?4 \
             WHERE namespace = ?2 AND key = ?3 AND data_type_code IN ({}) \
             AND (expire IS NULL OR expire >= ?4) \
             RETURNING value, data_type_code",
            numeric
        );
        conn.query_row(&sql, params![delta, namespace, key_hash, now], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .optional()
        .map_err(map_sql_error)?
    };

    if let Some((payload, code)) = updated {
        return unserialize(&payload, code);
    }

    let present: Option<i64> = conn
        .query_row(
            "SELECT data_type_code FROM cache_storage \
             WHERE namespace = ?1 AND key = ?2 AND (expire IS NULL OR expire >= ?3)",
            params![namespace, key_hash, now],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_sql_error)?;
    match present {
        Some(_) => Err(CacheError::NotNumeric(label.to_string())),
        None => Err(CacheError::KeyNotFound(label.to_string())),
    }
}

// == SQLite Driver ==
pub struct SqliteDriver {
    config: DriverConfig,
    path: PathBuf,
    chunk_size: usize,
    db: SharedConnection,
}

impl SqliteDriver {
    /// Creates the driver. The database is opened lazily.
    pub fn new(config: DriverConfig, path: impl Into<PathBuf>) -> Self {
        Self {
            config,
            path: path.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            db: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Result<Self> {
        self.set_chunk_size(chunk_size)?;
        Ok(self)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn set_chunk_size(&mut self, chunk_size: usize) -> Result<()> {
        if chunk_size == 0 {
            return Err(CacheError::InvalidArgument("chunk size must be positive".to_string()));
        }
        self.chunk_size = chunk_size;
        Ok(())
    }

    /// True once the store has been opened and not dropped since.
    pub fn is_connected(&self) -> bool {
        self.db.lock().is_some()
    }

    /// Runs `op` on the blocking pool against the lazily opened store.
    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let path = self.path.clone();

        task::spawn_blocking(move || -> Result<T> {
            let mut guard = db.lock();
            if guard.is_none() {
                debug!("sqlite driver: opening {}", path.display());
                *guard = Some(open_store(&path)?);
            }
            match guard.as_mut() {
                Some(conn) => op(conn),
                None => Err(CacheError::DriverNotConnected(path.display().to_string())),
            }
        })
        .await
        .map_err(map_join_error)?
    }

    /// Clears the namespace, or with `drop_store` disconnects and deletes
    /// the database file. The next operation reopens and recreates it.
    pub async fn invalidate_with(&self, drop_store: bool) -> Result<()> {
        if !drop_store {
            let namespace = self.config.namespace_hash().to_string();
            let removed = self
                .run(move |conn| {
                    conn.execute("DELETE FROM cache_storage WHERE namespace = ?1", params![namespace])
                        .map_err(map_sql_error)
                })
                .await?;
            debug!("sqlite driver: invalidated {} rows", removed);
            return Ok(());
        }

        let db = Arc::clone(&self.db);
        let path = self.path.clone();
        task::spawn_blocking(move || -> Result<()> {
            let mut guard = db.lock();
            if let Some(conn) = guard.take() {
                conn.close().map_err(|(_, err)| map_sql_error(err))?;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!("sqlite driver: dropped store {}", path.display());
                    Ok(())
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(CacheError::backend(format!("cannot delete {}", path.display()), err)),
            }
        })
        .await
        .map_err(map_join_error)?
    }

    fn hashed_rows(&self, entries: &[(String, TypedValue)]) -> Result<Vec<Row>> {
        let hashes = self.config.hash_keys(
            &entries.iter().map(|(key, _)| key.as_str()).collect::<Vec<_>>(),
        )?;
        entries
            .iter()
            .zip(hashes)
            .map(|((key, value), key_hash)| {
                let (data_type, payload) = serialize(value)?;
                Ok(Row {
                    label: key.clone(),
                    key_hash,
                    code: data_type.code(),
                    payload,
                })
            })
            .collect()
    }
}

#[async_trait]
impl CacheDriver for SqliteDriver {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn config(&self) -> &DriverConfig {
        &self.config
    }

    fn config_mut(&mut self) -> &mut DriverConfig {
        &mut self.config
    }

    async fn set(&self, key: &str, value: TypedValue, options: CacheOptions) -> Result<()> {
        let rows = self.hashed_rows(&[(key.to_string(), value)])?;
        let expire = expire_timestamp(self.config.resolve_ttl(&options))?;
        let overwrite = self.config.resolve_overwrite(&options);
        let namespace = self.config.namespace_hash().to_string();

        self.run(move |conn| {
            let now = now_timestamp()?;
            let tx = conn.transaction().map_err(map_sql_error)?;
            if !overwrite {
                let hashes = vec![rows[0].key_hash.clone()];
                purge_expired(&tx, &namespace, &hashes, &now, 1)?;
            }
            insert_rows(&tx, &namespace, &rows, overwrite, &now, expire.as_deref(), 1)?;
            tx.commit().map_err(map_sql_error)
        })
        .await
    }

    async fn get(&self, key: &str, options: CacheOptions) -> Result<Option<TypedValue>> {
        let key_hash = self.config.hash_key(key)?;
        let namespace = self.config.namespace_hash().to_string();
        let label = key.to_string();

        let result = self
            .run(move |conn| {
                let now = now_timestamp()?;
                let row: Option<(String, i64)> = conn
                    .query_row(
                        "SELECT value, data_type_code FROM cache_storage \
                         WHERE namespace = ?1 AND key = ?2 AND (expire IS NULL OR expire >= ?3)",
                        params![namespace, key_hash, now],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()
                    .map_err(map_sql_error)?;
                match row {
                    Some((payload, code)) => unserialize(&payload, code).map(Some),
                    None => Err(CacheError::KeyNotFound(label)),
                }
            })
            .await;
        silence(result, options.silent)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let key_hash = self.config.hash_key(key)?;
        let namespace = self.config.namespace_hash().to_string();

        self.run(move |conn| {
            let now = now_timestamp()?;
            conn.query_row(
                "SELECT 1 FROM cache_storage \
                 WHERE namespace = ?1 AND key = ?2 AND (expire IS NULL OR expire >= ?3)",
                params![namespace, key_hash, now],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
            .map_err(map_sql_error)
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Option<u64>) -> Result<()> {
        self.expire_multi(&[key.to_string()], ttl).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let key_hash = self.config.hash_key(key)?;
        let namespace = self.config.namespace_hash().to_string();

        self.run(move |conn| {
            conn.execute(
                "DELETE FROM cache_storage WHERE namespace = ?1 AND key = ?2",
                params![namespace, key_hash],
            )
            .map_err(map_sql_error)?;
            Ok(())
        })
        .await
    }

    async fn invalidate(&self) -> Result<()> {
        self.invalidate_with(false).await
    }

    async fn increment(
        &self,
        key: &str,
        delta: i64,
        options: CacheOptions,
    ) -> Result<Option<TypedValue>> {
        let key_hash = self.config.hash_key(key)?;
        let namespace = self.config.namespace_hash().to_string();
        let create_expire = expire_timestamp(self.config.resolve_ttl(&options))?;
        let label = key.to_string();

        let result = self
            .run(move |conn| {
                increment_row(
                    conn,
                    &namespace,
                    &key_hash,
                    &label,
                    delta,
                    options.create,
                    create_expire.as_deref(),
                )
                .map(Some)
            })
            .await;
        silence(result, options.silent)
    }

    async fn set_multi(&self, entries: &[(String, TypedValue)], options: CacheOptions) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let rows = self.hashed_rows(entries)?;
        let expire = expire_timestamp(self.config.resolve_ttl(&options))?;
        let overwrite = self.config.resolve_overwrite(&options);
        let namespace = self.config.namespace_hash().to_string();
        let chunk_size = self.chunk_size;

        debug!(
            "sqlite driver: writing {} rows in chunks of {}",
            rows.len(),
            chunk_size
        );
        self.run(move |conn| {
            let now = now_timestamp()?;
            let tx = conn.transaction().map_err(map_sql_error)?;
            let written = (|| {
                if !overwrite {
                    let hashes: Vec<String> = rows.iter().map(|row| row.key_hash.clone()).collect();
                    purge_expired(&tx, &namespace, &hashes, &now, chunk_size)?;
                }
                insert_rows(&tx, &namespace, &rows, overwrite, &now, expire.as_deref(), chunk_size)
            })();
            match written {
                Ok(()) => tx.commit().map_err(map_sql_error),
                Err(err) => {
                    warn!("sqlite driver: batch of {} rows rolled back: {}", rows.len(), err);
                    tx.rollback().map_err(map_sql_error)?;
                    Err(err)
                }
            }
        })
        .await
    }

    async fn get_multi(
        &self,
        keys: &[String],
        options: CacheOptions,
    ) -> Result<HashMap<String, Option<TypedValue>>> {
        let hashes = self.config.hash_keys(keys)?;
        let namespace = self.config.namespace_hash().to_string();
        let chunk_size = self.chunk_size;
        let lookup = hashes.clone();

        let found = self
            .run(move |conn| {
                let now = now_timestamp()?;
                select_live(conn, &namespace, &lookup, &now, chunk_size)
            })
            .await?;

        let mut values = HashMap::with_capacity(keys.len());
        for (key, hash) in keys.iter().zip(hashes) {
            let result = match found.get(&hash) {
                Some((payload, code)) => unserialize(payload, *code).map(Some),
                None => Err(CacheError::KeyNotFound(key.clone())),
            };
            values.insert(key.clone(), silence(result, options.silent)?);
        }
        Ok(values)
    }

    async fn exists_multi(&self, keys: &[String], all: bool) -> Result<MultiExists> {
        let hashes = self.config.hash_keys(keys)?;
        let namespace = self.config.namespace_hash().to_string();
        let chunk_size = self.chunk_size;
        let lookup = hashes.clone();

        let found = self
            .run(move |conn| {
                let now = now_timestamp()?;
                select_live(conn, &namespace, &lookup, &now, chunk_size)
            })
            .await?;

        let map = keys
            .iter()
            .zip(hashes)
            .map(|(key, hash)| (key.clone(), found.contains_key(&hash)))
            .collect();
        Ok(MultiExists::from_map(map, all))
    }

    async fn remove_multi(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let hashes = self.config.hash_keys(keys)?;
        let namespace = self.config.namespace_hash().to_string();
        let chunk_size = self.chunk_size;

        self.run(move |conn| {
            let tx = conn.transaction().map_err(map_sql_error)?;
            for chunk in hashes.chunks(chunk_size) {
                let sql = format!(
                    "DELETE FROM cache_storage WHERE namespace = ? AND key IN ({})",
                    placeholders(chunk.len())
                );
                let mut values = Vec::with_capacity(chunk.len() + 1);
                values.push(SqlValue::Text(namespace.clone()));
                values.extend(chunk.iter().map(|hash| SqlValue::Text(hash.clone())));
                tx.execute(&sql, params_from_iter(values.iter()))
                    .map_err(map_sql_error)?;
            }
            tx.commit().map_err(map_sql_error)
        })
        .await
    }

    async fn increment_multi(
        &self,
        deltas: &[(String, i64)],
        options: CacheOptions,
    ) -> Result<HashMap<String, Option<TypedValue>>> {
        let keys: Vec<String> = deltas.iter().map(|(key, _)| key.clone()).collect();
        let hashes = self.config.hash_keys(&keys)?;
        let namespace = self.config.namespace_hash().to_string();
        let create_expire = expire_timestamp(self.config.resolve_ttl(&options))?;
        let work: Vec<(String, String, i64)> = deltas
            .iter()
            .zip(hashes)
            .map(|((key, delta), hash)| (key.clone(), hash, *delta))
            .collect();

        self.run(move |conn| {
            let tx = conn.transaction().map_err(map_sql_error)?;
            let mut values = HashMap::with_capacity(work.len());
            for (key, hash, delta) in &work {
                let result = increment_row(
                    &tx,
                    &namespace,
                    hash,
                    key,
                    *delta,
                    options.create,
                    create_expire.as_deref(),
                )
                .map(Some);
                match silence(result, options.silent) {
                    Ok(value) => {
                        values.insert(key.clone(), value);
                    }
                    Err(err) => {
                        warn!("sqlite driver: counter batch rolled back: {}", err);
                        tx.rollback().map_err(map_sql_error)?;
                        return Err(err);
                    }
                }
            }
            tx.commit().map_err(map_sql_error)?;
            Ok(values)
        })
        .await
    }

    /// Only live rows are touched, so an expired key keeps its past expiry.
    async fn expire_multi(&self, keys: &[String], ttl: Option<u64>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let hashes = self.config.hash_keys(keys)?;
        let namespace = self.config.namespace_hash().to_string();
        let expire = expire_timestamp(normalize_ttl(ttl))?;
        let chunk_size = self.chunk_size;

        self.run(move |conn| {
            let now = now_timestamp()?;
            let tx = conn.transaction().map_err(map_sql_error)?;
            for chunk in hashes.chunks(chunk_size) {
                let sql = format!(
                    "UPDATE cache_storage SET expire = ? WHERE namespace = ? AND key IN ({}) AND {}",
                    placeholders(chunk.len()),
                    LIVE
                );
                let mut values = Vec::with_capacity(chunk.len() + 3);
                values.push(expire.clone().map_or(SqlValue::Null, SqlValue::Text));
                values.push(SqlValue::Text(namespace.clone()));
                values.extend(chunk.iter().map(|hash| SqlValue::Text(hash.clone())));
                values.push(SqlValue::Text(now.clone()));
                tx.execute(&sql, params_from_iter(values.iter()))
                    .map_err(map_sql_error)?;
            }
            tx.commit().map_err(map_sql_error)
        })
        .await
    }

    async fn dispose(&self) -> Result<()> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || -> Result<()> {
            if let Some(conn) = db.lock().take() {
                conn.close().map_err(|(_, err)| map_sql_error(err))?;
            }
            Ok(())
        })
        .await
        .map_err(map_join_error)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn driver(dir: &TempDir) -> SqliteDriver {
        SqliteDriver::new(DriverConfig::new(), dir.path().join("cache.sqlite"))
    }

    #[test]
    fn test_sql_timestamp_is_fixed_width() {
        assert_eq!(sql_timestamp(0).unwrap(), "1970-01-01 00:00:00.000");
        assert_eq!(sql_timestamp(1_500).unwrap(), "1970-01-01 00:00:01.500");
        assert!(sql_timestamp(MAX_TIMESTAMP_MS + 1).is_err());
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(3), "?, ?, ?");
    }

    #[tokio::test]
    async fn test_lazy_open_and_schema() {
        let dir = TempDir::new().unwrap();
        let cache = driver(&dir);
        assert!(!cache.is_connected());

        assert!(!cache.exists("k").await.unwrap());
        assert!(cache.is_connected());
        assert!(cache.path().exists());
    }

    #[tokio::test]
    async fn test_scenario() {
        let dir = TempDir::new().unwrap();
        let cache = driver(&dir);
        let user = TypedValue::from(json!({"name": "Ana"}));

        cache.set("user:42", user.clone(), CacheOptions::new().ttl(60)).await.unwrap();
        assert!(cache.exists("user:42").await.unwrap());
        assert_eq!(cache.get("user:42", CacheOptions::new()).await.unwrap(), Some(user));
        cache.remove("user:42").await.unwrap();
        assert!(!cache.exists("user:42").await.unwrap());
    }

    #[tokio::test]
    async fn test_overwrite_guard() {
        let dir = TempDir::new().unwrap();
        let cache = driver(&dir);
        cache.set("k", "v1".into(), CacheOptions::new()).await.unwrap();

        let dup = cache.set("k", "v2".into(), CacheOptions::new().overwrite(false)).await;
        assert!(matches!(dup, Err(CacheError::DuplicateEntry(_))));

        cache.set("k", "v2".into(), CacheOptions::new().overwrite(true)).await.unwrap();
        assert_eq!(cache.get("k", CacheOptions::new()).await.unwrap(), Some("v2".into()));
    }

    #[tokio::test]
    async fn test_expired_row_does_not_block_insert() {
        let dir = TempDir::new().unwrap();
        let cache = driver(&dir);
        cache.set("k", "old".into(), CacheOptions::new().ttl(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(!cache.exists("k").await.unwrap());
        cache.set("k", "new".into(), CacheOptions::new().overwrite(false)).await.unwrap();
        assert_eq!(cache.get("k", CacheOptions::new()).await.unwrap(), Some("new".into()));
    }

    #[tokio::test]
    async fn test_expire_does_not_restore_expired_rows() {
        let dir = TempDir::new().unwrap();
        let cache = driver(&dir);
        cache.set("live", "v".into(), CacheOptions::new()).await.unwrap();
        cache.set("gone", "v".into(), CacheOptions::new().ttl(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        cache.expire("gone", None).await.unwrap();
        assert!(!cache.exists("gone").await.unwrap());

        cache.expire("live", Some(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!cache.exists("live").await.unwrap());
    }

    #[tokio::test]
    async fn test_counters() {
        let dir = TempDir::new().unwrap();
        let cache = driver(&dir);

        let result = cache.increment("c", 1, CacheOptions::new()).await;
        assert!(matches!(result, Err(CacheError::KeyNotFound(_))));

        let created = cache.increment("c", 5, CacheOptions::new().create()).await.unwrap();
        assert_eq!(created, Some(TypedValue::Number(5.0)));
        let next = cache.increment("c", 2, CacheOptions::new().create()).await.unwrap();
        assert_eq!(next, Some(TypedValue::Number(7.0)));
        let next = cache.decrement("c", 10, CacheOptions::new()).await.unwrap();
        assert_eq!(next, Some(TypedValue::Number(-3.0)));
        assert_eq!(
            cache.get("c", CacheOptions::new()).await.unwrap(),
            Some(TypedValue::Number(-3.0))
        );

        cache.set("text", "abc".into(), CacheOptions::new()).await.unwrap();
        let result = cache.increment("text", 1, CacheOptions::new()).await;
        assert!(matches!(result, Err(CacheError::NotNumeric(_))));
        let result = cache.increment("text", 1, CacheOptions::new().create()).await;
        assert!(matches!(result, Err(CacheError::NotNumeric(_))));
        assert!(cache.increment("text", 1, CacheOptions::new().silent()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bigint_counter_is_exact() {
        let dir = TempDir::new().unwrap();
        let cache = driver(&dir);
        let big: num_bigint::BigInt = "18446744073709551616".parse().unwrap();
        cache.set("big", TypedValue::BigInt(big.clone()), CacheOptions::new()).await.unwrap();

        let next = cache.increment("big", 1, CacheOptions::new()).await.unwrap();
        assert_eq!(next, Some(TypedValue::BigInt(big + 1u32)));
    }

    #[tokio::test]
    async fn test_create_replaces_expired_counter() {
        let dir = TempDir::new().unwrap();
        let cache = driver(&dir);
        cache.set("c", TypedValue::Number(100.0), CacheOptions::new().ttl(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let created = cache.increment("c", 1, CacheOptions::new().create()).await.unwrap();
        assert_eq!(created, Some(TypedValue::Number(1.0)));
    }

    #[tokio::test]
    async fn test_set_multi_is_atomic() {
        let dir = TempDir::new().unwrap();
        let cache = driver(&dir).with_chunk_size(2).unwrap();
        cache.set("k3", "existing".into(), CacheOptions::new()).await.unwrap();

        let entries: Vec<(String, TypedValue)> = (1..=5)
            .map(|i| (format!("k{}", i), TypedValue::Number(i as f64)))
            .collect();
        let result = cache.set_multi(&entries, CacheOptions::new().overwrite(false)).await;
        assert!(matches!(result, Err(CacheError::DuplicateEntry(_))));

        for key in ["k1", "k2", "k4", "k5"] {
            assert!(!cache.exists(key).await.unwrap(), "{} should not persist", key);
        }
        assert_eq!(cache.get("k3", CacheOptions::new()).await.unwrap(), Some("existing".into()));
    }

    #[tokio::test]
    async fn test_bulk_operations_across_chunks() {
        let dir = TempDir::new().unwrap();
        let cache = driver(&dir).with_chunk_size(3).unwrap();

        let entries: Vec<(String, TypedValue)> = (0..10)
            .map(|i| (format!("k{}", i), TypedValue::Number(i as f64)))
            .collect();
        cache.set_multi(&entries, CacheOptions::new()).await.unwrap();

        let keys: Vec<String> = (0..11).map(|i| format!("k{}", i)).collect();
        let values = cache.get_multi(&keys, CacheOptions::new().silent()).await.unwrap();
        assert_eq!(values["k9"], Some(TypedValue::Number(9.0)));
        assert_eq!(values["k10"], None);

        let result = cache.get_multi(&keys, CacheOptions::new()).await;
        assert!(matches!(result, Err(CacheError::KeyNotFound(_))));

        assert_eq!(cache.exists_multi(&keys[..10], true).await.unwrap(), MultiExists::All(true));

        let counters = cache
            .increment_multi(&[("k1".into(), 10), ("k2".into(), 20)], CacheOptions::new())
            .await
            .unwrap();
        assert_eq!(counters["k2"], Some(TypedValue::Number(22.0)));

        cache.expire_multi(&keys, Some(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(cache.exists_multi(&keys, true).await.unwrap(), MultiExists::All(false));

        cache.set_multi(&entries, CacheOptions::new()).await.unwrap();
        cache.remove_multi(&keys).await.unwrap();
        assert_eq!(cache.exists_multi(&keys[..1], true).await.unwrap(), MultiExists::All(false));
    }

    #[tokio::test]
    async fn test_increment_multi_rolls_back() {
        let dir = TempDir::new().unwrap();
        let cache = driver(&dir);
        cache.set("a", TypedValue::Number(1.0), CacheOptions::new()).await.unwrap();

        let result = cache
            .increment_multi(&[("a".into(), 1), ("missing".into(), 1)], CacheOptions::new())
            .await;
        assert!(matches!(result, Err(CacheError::KeyNotFound(_))));
        assert_eq!(
            cache.get("a", CacheOptions::new()).await.unwrap(),
            Some(TypedValue::Number(1.0))
        );
    }

    #[tokio::test]
    async fn test_invalidate_is_namespace_scoped() {
        let dir = TempDir::new().unwrap();
        let mut cache = driver(&dir);
        cache.set_namespace(Some("a".into()));
        cache.set("k", "a".into(), CacheOptions::new()).await.unwrap();
        cache.set_namespace(Some("b".into()));
        cache.set("k", "b".into(), CacheOptions::new()).await.unwrap();

        cache.invalidate().await.unwrap();
        assert!(!cache.exists("k").await.unwrap());

        cache.set_namespace(Some("a".into()));
        assert_eq!(cache.get("k", CacheOptions::new()).await.unwrap(), Some("a".into()));
    }

    #[tokio::test]
    async fn test_invalidate_drop_store_reconnects_lazily() {
        let dir = TempDir::new().unwrap();
        let cache = driver(&dir);
        cache.set("k", "v".into(), CacheOptions::new()).await.unwrap();

        cache.invalidate_with(true).await.unwrap();
        assert!(!cache.is_connected());
        assert!(!cache.path().exists());

        assert!(!cache.exists("k").await.unwrap());
        assert!(cache.is_connected());
    }

    #[tokio::test]
    async fn test_zero_chunk_size_rejected() {
        let dir = TempDir::new().unwrap();
        let result = driver(&dir).with_chunk_size(0);
        assert!(matches!(result, Err(CacheError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_created_counter_keeps_large_delta_exact() {
        let dir = TempDir::new().unwrap();
        let cache = driver(&dir);
        let delta = -9_007_199_254_740_993_i64;
        let expected = TypedValue::BigInt(num_bigint::BigInt::from(delta));

        let created = cache.increment("c", delta, CacheOptions::new().create()).await.unwrap();
        assert_eq!(created, Some(expected.clone()));
        assert_eq!(cache.get("c", CacheOptions::new()).await.unwrap(), Some(expected.clone()));

        cache.set("old", TypedValue::Number(1.0), CacheOptions::new().ttl(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let replaced = cache.increment("old", delta, CacheOptions::new().create()).await.unwrap();
        assert_eq!(replaced, Some(expected.clone()));
        assert_eq!(cache.get("old", CacheOptions::new()).await.unwrap(), Some(expected));
    }
}
