//! Network connections for remote key-value stores.
//!
//! `Connection` is the collaborator a networked driver depends on; its raw
//! handle implements `KvStore`, the small command set the driver needs.
//! `RedisConnection` is the production implementation.

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info};

use crate::error::{CacheError, Result};

// == Connection ==
/// Lifecycle of a connection to a remote store.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Raw backend handle.
    type Handle: KvStore + Clone + 'static;

    async fn connect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> Result<()>;

    /// Returns the live handle, or `DriverNotConnected`.
    fn get_connection(&self) -> Result<Self::Handle>;
}

// == Set Mode ==
/// Write condition for [`KvStore::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    Always,
    IfAbsent,
}

// == KV Store ==
/// Commands of a remote key-value store. Every command is atomic for its
/// key; nothing spans keys.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Writes `value` with an optional TTL in seconds. Returns false when
    /// `SetMode::IfAbsent` found the key already present.
    async fn set(&self, key: &str, value: &str, ttl: Option<u64>, mode: SetMode) -> Result<bool>;

    /// Replaces `expected` with `value`, keeping the current TTL. Returns
    /// false if the stored value changed or vanished.
    async fn compare_and_swap(&self, key: &str, expected: &str, value: &str) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Sets a TTL in seconds, or clears it with `None`.
    async fn expire(&self, key: &str, ttl: Option<u64>) -> Result<()>;

    /// Removes every key of the store.
    async fn flush(&self) -> Result<()>;
}

// == Redis ==
const COMPARE_AND_SWAP: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
  return 0
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl > 0 then
  redis.call('SET', KEYS[1], ARGV[2], 'PX', ttl)
else
  redis.call('SET', KEYS[1], ARGV[2])
end
return 1
"#;

fn map_redis_error(context: &str, err: redis::RedisError) -> CacheError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        return CacheError::DriverNotConnected(format!("{}: {}", context, err));
    }
    CacheError::backend(context, err)
}

/// Redis connection over a multiplexed tokio connection.
pub struct RedisConnection {
    client: Client,
    handle: RwLock<Option<RedisHandle>>,
}

impl RedisConnection {
    /// Parses the URL; no I/O happens until [`Connection::connect`].
    pub fn open(url: &str) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| CacheError::DriverNotConfigured(format!("invalid redis url '{}': {}", url, e)))?;
        Ok(Self {
            client,
            handle: RwLock::new(None),
        })
    }
}

#[async_trait]
impl Connection for RedisConnection {
    type Handle = RedisHandle;

    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let connection = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| map_redis_error("connect", e))?;
        *self.handle.write() = Some(RedisHandle { connection });
        info!("redis connection established");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.handle.read().is_some()
    }

    async fn disconnect(&self) -> Result<()> {
        if self.handle.write().take().is_some() {
            debug!("redis connection released");
        }
        Ok(())
    }

    fn get_connection(&self) -> Result<RedisHandle> {
        self.handle
            .read()
            .clone()
            .ok_or_else(|| CacheError::DriverNotConnected("redis".to_string()))
    }
}

/// Cloneable handle; clones share the multiplexed connection.
#[derive(Clone)]
pub struct RedisHandle {
    connection: MultiplexedConnection,
}

#[async_trait]
impl KvStore for RedisHandle {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut con = self.connection.clone();
        con.get(key).await.map_err(|e| map_redis_error("GET", e))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut con = self.connection.clone();
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(key);
        }
        let values: Vec<Option<String>> = cmd
            .query_async(&mut con)
            .await
            .map_err(|e| map_redis_error("MGET", e))?;
        Ok(values)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<u64>, mode: SetMode) -> Result<bool> {
        let mut con = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(seconds) = ttl {
            cmd.arg("EX").arg(seconds);
        }
        if mode == SetMode::IfAbsent {
            cmd.arg("NX");
        }
        let reply: Option<String> = cmd
            .query_async(&mut con)
            .await
            .map_err(|e| map_redis_error("SET", e))?;
        Ok(reply.is_some())
    }

    async fn compare_and_swap(&self, key: &str, expected: &str, value: &str) -> Result<bool> {
        let mut con = self.connection.clone();
        let script = Script::new(COMPARE_AND_SWAP);
        let swapped: i64 = script
            .key(key)
            .arg(expected)
            .arg(value)
            .invoke_async(&mut con)
            .await
            .map_err(|e| map_redis_error("compare-and-swap", e))?;
        Ok(swapped == 1)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut con = self.connection.clone();
        let _: i64 = con.del(key).await.map_err(|e| map_redis_error("DEL", e))?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Option<u64>) -> Result<()> {
        let mut con = self.connection.clone();
        let _: i64 = match ttl {
            Some(seconds) => redis::cmd("EXPIRE")
                .arg(key)
                .arg(seconds)
                .query_async(&mut con)
                .await
                .map_err(|e| map_redis_error("EXPIRE", e))?,
            None => redis::cmd("PERSIST")
                .arg(key)
                .query_async(&mut con)
                .await
                .map_err(|e| map_redis_error("PERSIST", e))?,
        };
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut con = self.connection.clone();
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut con)
            .await
            .map_err(|e| map_redis_error("FLUSHDB", e))?;
        Ok(())
    }
}
